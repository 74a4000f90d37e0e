use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sling::config::{OutputMode, WorkSpec};
use sling::executor::Work;
use sling::report::RunStats;
use sling::script::ScriptEngine;

/// Write a one-file script into a fresh temp directory.
fn write_script(tag: &str, body: String) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sling-e2e-{}-{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("script.star");
    std::fs::write(&file, body).unwrap();
    file
}

/// In-memory sink shared with the run, so tests can inspect CSV output.
#[derive(Clone, Default)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run a spec + script to completion off the async test thread.
async fn run_work(spec: WorkSpec, script: PathBuf) -> RunStats {
    let engine = ScriptEngine::new(&script).expect("script should load");
    let handle = tokio::runtime::Handle::current();
    let work = Work::new(spec, engine, handle);
    tokio::task::spawn_blocking(move || work.run())
        .await
        .expect("run thread panicked")
}

fn quiet_spec(n: u64) -> WorkSpec {
    WorkSpec {
        n,
        timeout: Duration::from_secs(5),
        writer: Some(Box::new(SharedWriter::default())),
        ..WorkSpec::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fixed_n_runs_exactly_n_units() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(5)
        .mount(&server)
        .await;

    let script = write_script(
        "fixed-n",
        format!("def main(ctx):\n    requests.get(\"{}/ping\")\n", server.uri()),
    );

    let stats = run_work(quiet_spec(5), script).await;
    assert_eq!(stats.count, 5);
    assert_eq!(stats.status_codes.get(&200), Some(&5));
    assert!(stats.errors.is_empty(), "unexpected errors: {:?}", stats.errors);
}

#[tokio::test(flavor = "multi_thread")]
async fn form_post_sends_bracketed_keys() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/tokens"))
        .and(header(
            "content-type",
            "application/x-www-form-urlencoded",
        ))
        .and(body_string("card[number]=4242424242424242"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(3)
        .mount(&server)
        .await;

    let script = write_script(
        "form-post",
        format!(
            concat!(
                "def main(ctx):\n",
                "    payload = {{\"card\": {{\"number\": \"4242424242424242\"}}}}\n",
                "    r = requests.post(\"{}/v1/tokens\", data = payload)\n",
                "    r.raise_for_status()\n",
            ),
            server.uri()
        ),
    );

    let stats = run_work(quiet_spec(3), script).await;
    // The mock only matches the bracket-encoded body; 200s prove it did.
    assert_eq!(stats.status_codes.get(&200), Some(&3));
}

#[tokio::test(flavor = "multi_thread")]
async fn raise_for_status_errors_the_unit_but_not_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let script = write_script(
        "raise",
        format!(
            "def main(ctx):\n    r = requests.get(\"{}/boom\")\n    r.raise_for_status()\n",
            server.uri()
        ),
    );

    // Every unit fails after its request; the run still executes all four
    // units and records all four responses.
    let stats = run_work(quiet_spec(4), script).await;
    assert_eq!(stats.count, 4);
    assert_eq!(stats.status_codes.get(&500), Some(&4));
}

#[tokio::test(flavor = "multi_thread")]
async fn response_surface_matches_scripting_expectations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(r#"{"id": "tok_1", "n": 3}"#, "application/json"),
        )
        .mount(&server)
        .await;

    let script = write_script(
        "surface",
        format!(
            concat!(
                "def main(ctx):\n",
                "    r = requests.get(\"{uri}/json\")\n",
                "    if not r.ok:\n",
                "        fail(\"expected ok\")\n",
                "    if r.status_code != 200:\n",
                "        fail(\"expected 200, got %d\" % r.status_code)\n",
                "    doc = r.json()\n",
                "    if doc[\"id\"] != \"tok_1\" or doc[\"n\"] != 3:\n",
                "        fail(\"unexpected document: %s\" % r.text)\n",
            ),
            uri = server.uri()
        ),
    );

    let stats = run_work(quiet_spec(2), script).await;
    assert_eq!(stats.count, 2);
    assert!(stats.errors.is_empty());
    assert_eq!(stats.status_codes.get(&200), Some(&2));
}

#[tokio::test(flavor = "multi_thread")]
async fn user_agent_and_extra_headers_are_injected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ua"))
        .and(header("user-agent", "sling-test-agent"))
        .and(header("x-run-id", "7"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let script = write_script(
        "headers",
        format!("def main(ctx):\n    requests.get(\"{}/ua\")\n", server.uri()),
    );

    let mut spec = quiet_spec(2);
    spec.user_agent = "sling-test-agent".to_string();
    spec.headers = vec![("x-run-id".to_string(), "7".to_string())];
    let stats = run_work(spec, script).await;
    assert_eq!(stats.status_codes.get(&200), Some(&2));
}

#[tokio::test(flavor = "multi_thread")]
async fn script_headers_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth"))
        .and(header("authorization", "Bearer sk_test"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let script = write_script(
        "script-headers",
        format!(
            concat!(
                "def main(ctx):\n",
                "    headers = {{\"authorization\": \"Bearer sk_test\"}}\n",
                "    requests.post(\"{}/auth\", data = \"raw body\", headers = headers)\n",
            ),
            server.uri()
        ),
    );

    let stats = run_work(quiet_spec(1), script).await;
    assert_eq!(stats.status_codes.get(&200), Some(&1));
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_errors_are_recorded_not_fatal() {
    // Nothing listens on this port; requests fail in transport and the run
    // still completes with every unit accounted for.
    let script = write_script(
        "conn-refused",
        "def main(ctx):\n    requests.get(\"http://127.0.0.1:1/unreachable\")\n".to_string(),
    );

    let stats = run_work(quiet_spec(3), script).await;
    assert_eq!(stats.count, 3);
    assert!(stats.status_codes.is_empty());
    assert_eq!(stats.errors.values().sum::<u64>(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn csv_mode_streams_one_row_per_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string("abcde"))
        .mount(&server)
        .await;

    let script = write_script(
        "csv",
        format!("def main(ctx):\n    requests.get(\"{}/csv\")\n", server.uri()),
    );

    let sink = SharedWriter::default();
    let mut spec = quiet_spec(3);
    spec.output = OutputMode::Csv;
    spec.writer = Some(Box::new(sink.clone()));
    let stats = run_work(spec, script).await;
    assert_eq!(stats.count, 3);

    let csv = sink.contents();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4, "header plus one row per result:\n{csv}");
    assert!(lines[0].starts_with("response-time,DNS+dialup,DNS,"));
    for row in &lines[1..] {
        let cols: Vec<&str> = row.split(',').collect();
        assert_eq!(cols.len(), 9, "bad row: {row}");
        assert_eq!(cols[6], "200");
        assert_eq!(cols[8], "5");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_mode_stops_on_cancellation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rate"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let script = write_script(
        "rate",
        format!("def main(ctx):\n    requests.get(\"{}/rate\")\n", server.uri()),
    );

    let mut spec = quiet_spec(0);
    spec.rps = 10;
    let engine = ScriptEngine::new(&script).expect("script should load");
    let work = Work::new(spec, engine, tokio::runtime::Handle::current());

    let stop = work.stop_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        stop.cancel();
    });

    let stats = tokio::task::spawn_blocking(move || work.run())
        .await
        .expect("run thread panicked");
    assert!(stats.count > 0, "rate mode should have issued requests");
    assert!(stats.errors.is_empty(), "unexpected errors: {:?}", stats.errors);
}
