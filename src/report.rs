//! Result aggregation and output.
//!
//! A dedicated reporter thread drains the result channel until every sender
//! is gone, tallying counts, per-phase duration sums, status-code and
//! error-kind histograms, and an HDR histogram of latencies for percentile
//! output. CSV mode streams one row per result as it arrives; summary mode
//! prints aggregates when the run finalizes.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use crossbeam_channel::Receiver;
use hdrhistogram::Histogram;
use tracing::warn;

use crate::config::OutputMode;
use crate::errors::ErrorKind;
use crate::result::CallResult;

/// Bookkeeping surface the instrumented client calls around each request.
/// `start` fires before the request is issued (rate counters key off it);
/// `finish` delivers the measured result. The two always pair 1:1.
pub trait Reporter: Send + Sync {
    fn start(&self);
    fn finish(&self, result: CallResult);
}

/// Running totals accumulated by the reporter thread.
pub struct ReportData {
    pub count: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub bytes: i64,
    pub fastest: Duration,
    pub slowest: Duration,
    pub sum_duration: Duration,
    pub sum_conn: Duration,
    pub sum_dns: Duration,
    pub sum_req: Duration,
    pub sum_delay: Duration,
    pub sum_res: Duration,
    latency_us: Histogram<u64>,
    mode: OutputMode,
    writer: Box<dyn Write + Send>,
}

impl ReportData {
    fn new(mode: OutputMode, writer: Box<dyn Write + Send>) -> Self {
        // 1 microsecond to 10 minutes, 3 significant digits.
        let latency_us = Histogram::new_with_bounds(1, 600_000_000, 3)
            .expect("latency histogram bounds");
        ReportData {
            count: 0,
            status_codes: BTreeMap::new(),
            errors: BTreeMap::new(),
            bytes: 0,
            fastest: Duration::MAX,
            slowest: Duration::ZERO,
            sum_duration: Duration::ZERO,
            sum_conn: Duration::ZERO,
            sum_dns: Duration::ZERO,
            sum_req: Duration::ZERO,
            sum_delay: Duration::ZERO,
            sum_res: Duration::ZERO,
            latency_us,
            mode,
            writer,
        }
    }

    fn record(&mut self, r: &CallResult) {
        self.count += 1;
        self.sum_duration += r.duration;
        self.sum_conn += r.conn_duration;
        self.sum_dns += r.dns_duration;
        self.sum_req += r.req_duration;
        self.sum_delay += r.delay_duration;
        self.sum_res += r.res_duration;
        if r.duration < self.fastest {
            self.fastest = r.duration;
        }
        if r.duration > self.slowest {
            self.slowest = r.duration;
        }
        if r.content_length > 0 {
            self.bytes += r.content_length;
        }
        match r.err {
            Some(kind) => {
                *self.errors.entry(kind).or_insert(0) += 1;
            }
            None => {
                *self.status_codes.entry(r.status_code).or_insert(0) += 1;
            }
        }
        let us = (r.duration.as_micros() as u64).max(1);
        if self.latency_us.record(us).is_err() {
            // Saturate instead of dropping outliers beyond the trackable range.
            let _ = self.latency_us.record(self.latency_us.high());
        }
    }

    fn write_csv_header(&mut self) {
        let _ = writeln!(
            self.writer,
            "response-time,DNS+dialup,DNS,Request-write,Response-read,Response-delay,status-code,offset,content-length"
        );
    }

    fn write_csv_row(&mut self, r: &CallResult) {
        let _ = writeln!(
            self.writer,
            "{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{},{:.4},{}",
            r.duration.as_secs_f64(),
            r.conn_duration.as_secs_f64(),
            r.dns_duration.as_secs_f64(),
            r.req_duration.as_secs_f64(),
            r.res_duration.as_secs_f64(),
            r.delay_duration.as_secs_f64(),
            r.status_code,
            r.offset.as_secs_f64(),
            r.content_length,
        );
    }

    fn percentile(&self, q: f64) -> Duration {
        Duration::from_micros(self.latency_us.value_at_quantile(q))
    }

    /// Requests per second over the whole run.
    pub fn rps(&self, total: Duration) -> f64 {
        if total.is_zero() {
            return 0.0;
        }
        self.count as f64 / total.as_secs_f64()
    }

    /// Print the final output and flush the sink. Consumes the data.
    pub fn finalize(mut self, total: Duration) -> RunStats {
        if self.mode == OutputMode::Summary && self.count > 0 {
            self.print_summary(total);
        }
        let _ = self.writer.flush();
        RunStats {
            count: self.count,
            status_codes: self.status_codes,
            errors: self.errors,
            rps: if total.is_zero() {
                0.0
            } else {
                self.count as f64 / total.as_secs_f64()
            },
        }
    }

    fn print_summary(&mut self, total: Duration) {
        let avg = self.sum_duration / self.count.max(1) as u32;
        let per_phase = |sum: Duration, count: u64| sum / count.max(1) as u32;

        let mut out = String::new();
        out.push_str("\nSummary:\n");
        out.push_str(&format!("  Total:\t{:.4} secs\n", total.as_secs_f64()));
        out.push_str(&format!(
            "  Slowest:\t{:.4} secs\n",
            self.slowest.as_secs_f64()
        ));
        out.push_str(&format!(
            "  Fastest:\t{:.4} secs\n",
            if self.fastest == Duration::MAX {
                0.0
            } else {
                self.fastest.as_secs_f64()
            }
        ));
        out.push_str(&format!("  Average:\t{:.4} secs\n", avg.as_secs_f64()));
        out.push_str(&format!("  Requests/sec:\t{:.4}\n", self.rps(total)));
        if self.bytes > 0 {
            out.push_str(&format!("  Total data:\t{} bytes\n", self.bytes));
        }

        out.push_str("\nLatency distribution:\n");
        for (label, q) in [("50%", 0.50), ("90%", 0.90), ("95%", 0.95), ("99%", 0.99)] {
            out.push_str(&format!(
                "  {} in {:.4} secs\n",
                label,
                self.percentile(q).as_secs_f64()
            ));
        }

        out.push_str("\nDetails (average):\n");
        out.push_str(&format!(
            "  DNS+dialup:\t{:.4} secs\n",
            per_phase(self.sum_conn, self.count).as_secs_f64()
        ));
        out.push_str(&format!(
            "  DNS-lookup:\t{:.4} secs\n",
            per_phase(self.sum_dns, self.count).as_secs_f64()
        ));
        out.push_str(&format!(
            "  req write:\t{:.4} secs\n",
            per_phase(self.sum_req, self.count).as_secs_f64()
        ));
        out.push_str(&format!(
            "  resp wait:\t{:.4} secs\n",
            per_phase(self.sum_delay, self.count).as_secs_f64()
        ));
        out.push_str(&format!(
            "  resp read:\t{:.4} secs\n",
            per_phase(self.sum_res, self.count).as_secs_f64()
        ));

        out.push_str("\nStatus code distribution:\n");
        for (code, n) in &self.status_codes {
            out.push_str(&format!("  [{code}]\t{n} responses\n"));
        }

        if !self.errors.is_empty() {
            out.push_str("\nError distribution:\n");
            for (kind, n) in &self.errors {
                out.push_str(&format!("  [{}]\t{} errors\n", kind.label(), n));
            }
        }

        let _ = self.writer.write_all(out.as_bytes());
    }
}

/// Final statistics handed back to the orchestrator (and to tests).
#[derive(Debug)]
pub struct RunStats {
    pub count: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub rps: f64,
}

/// Reporter thread body: drain until every sender is gone.
pub fn run_reporter(
    results: Receiver<CallResult>,
    mode: OutputMode,
    writer: Box<dyn Write + Send>,
) -> ReportData {
    let mut data = ReportData::new(mode, writer);
    if mode == OutputMode::Csv {
        data.write_csv_header();
    }
    for result in results.iter() {
        if mode == OutputMode::Csv {
            data.write_csv_row(&result);
        }
        data.record(&result);
    }
    if data.count == 0 {
        warn!("no results were recorded");
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn result_with(duration_ms: u64, status: u16) -> CallResult {
        CallResult {
            offset: Duration::ZERO,
            status_code: status,
            err: None,
            content_length: 10,
            duration: Duration::from_millis(duration_ms),
            conn_duration: Duration::ZERO,
            dns_duration: Duration::ZERO,
            req_duration: Duration::ZERO,
            res_duration: Duration::ZERO,
            delay_duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_reporter_drains_until_closed() {
        let (tx, rx) = bounded(16);
        for _ in 0..3 {
            tx.send(result_with(5, 200)).unwrap();
        }
        tx.send(result_with(7, 503)).unwrap();
        drop(tx);

        let data = run_reporter(rx, OutputMode::Summary, Box::new(Vec::new()));
        assert_eq!(data.count, 4);
        assert_eq!(data.status_codes[&200], 3);
        assert_eq!(data.status_codes[&503], 1);
        assert_eq!(data.bytes, 40);
    }

    #[test]
    fn test_errors_and_statuses_tally_separately() {
        let (tx, rx) = bounded(16);
        tx.send(result_with(5, 200)).unwrap();
        tx.send(CallResult::transport_error(
            Duration::ZERO,
            Duration::from_millis(3),
            ErrorKind::Connect,
        ))
        .unwrap();
        drop(tx);

        let data = run_reporter(rx, OutputMode::Summary, Box::new(Vec::new()));
        assert_eq!(data.count, 2);
        assert_eq!(data.errors[&ErrorKind::Connect], 1);
        assert!(!data.status_codes.contains_key(&0));
    }

    #[test]
    fn test_csv_rows_stream_per_result() {
        let (tx, rx) = bounded(16);
        tx.send(result_with(5, 200)).unwrap();
        tx.send(result_with(6, 200)).unwrap();
        drop(tx);

        let sink: Vec<u8> = Vec::new();
        let data = run_reporter(rx, OutputMode::Csv, Box::new(sink));
        assert_eq!(data.count, 2);
    }

    #[test]
    fn test_finalize_reports_rps() {
        let (tx, rx) = bounded(16);
        for _ in 0..10 {
            tx.send(result_with(5, 200)).unwrap();
        }
        drop(tx);

        let data = run_reporter(rx, OutputMode::Summary, Box::new(Vec::new()));
        let stats = data.finalize(Duration::from_secs(2));
        assert_eq!(stats.count, 10);
        assert!((stats.rps - 5.0).abs() < 1e-9);
    }
}
