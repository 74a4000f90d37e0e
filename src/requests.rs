//! The script-visible `requests` module and its Response value.
//!
//! `requests.get` / `requests.post` read the per-invocation context (stop
//! token, HTTP client, reporter handle, user agent) from the evaluator's
//! extra slot; calling them during module top-level evaluation, where no
//! context is installed, fails with a clear error.

use std::fmt;
use std::sync::Arc;

use allocative::Allocative;
use anyhow::anyhow;
use starlark::any::ProvidesStaticType;
use starlark::environment::{GlobalsBuilder, Methods, MethodsBuilder, MethodsStatic};
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::starlark_simple_value;
use starlark::values::dict::DictRef;
use starlark::values::none::NoneType;
use starlark::values::{starlark_value, Heap, NoSerialize, StarlarkValue, Value, ValueLike};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{BufferedResponse, HttpClient, HttpRequest};
use crate::values::{form_encode, json_to_value};
use crate::worker::WorkReporter;

/// Per-invocation bindings installed in the evaluator for one unit of
/// work. Request starts are counted by the reporter handle.
#[derive(ProvidesStaticType)]
pub struct RequestContext {
    pub cancel: CancellationToken,
    pub client: Arc<HttpClient>,
    pub reporter: Arc<WorkReporter>,
    pub user_agent: String,
}

/// Members of the predeclared `requests` global.
#[starlark_module]
pub(crate) fn requests_members(builder: &mut GlobalsBuilder) {
    fn get<'v>(
        url: Value<'v>,
        headers: Option<Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        perform(eval, "GET", url, None, headers)
    }

    fn post<'v>(
        url: Value<'v>,
        data: Option<Value<'v>>,
        headers: Option<Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        perform(eval, "POST", url, data, headers)
    }
}

fn perform<'v>(
    eval: &mut Evaluator<'v, '_>,
    method: &'static str,
    url: Value<'v>,
    data: Option<Value<'v>>,
    headers: Option<Value<'v>>,
) -> anyhow::Result<Value<'v>> {
    let heap = eval.heap();
    let rcx = eval
        .extra
        .ok_or_else(|| anyhow!("requests can't be used at top level, only in function bodies"))?
        .downcast_ref::<RequestContext>()
        .ok_or_else(|| anyhow!("internal error: evaluator context has the wrong type"))?;

    let url_str = url
        .unpack_str()
        .ok_or_else(|| anyhow!("expected url to be a string"))?;
    let url = Url::parse(url_str).map_err(|e| anyhow!("invalid url {url_str:?}: {e}"))?;

    let mut is_form = false;
    let body = match data {
        Some(v) if !v.is_none() => {
            if let Some(raw) = v.unpack_str() {
                Some(raw.as_bytes().to_vec())
            } else if DictRef::from_value(v).is_some() {
                is_form = true;
                Some(form_encode(v, heap)?.into_bytes())
            } else {
                return Err(anyhow!("expected a string or dict for data"));
            }
        }
        _ => None,
    };

    let mut header_pairs = Vec::new();
    if let Some(h) = headers {
        if !h.is_none() {
            let dict =
                DictRef::from_value(h).ok_or_else(|| anyhow!("expected a dict for headers"))?;
            for (name, value) in dict.iter() {
                let name = match name.unpack_str() {
                    Some(s) => s.to_string(),
                    None => name.to_string(),
                };
                let value = match value.unpack_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                header_pairs.push((name, value));
            }
        }
    }

    let mut req = HttpRequest {
        method,
        url,
        headers: header_pairs,
        body,
    };
    if is_form {
        req.set_default_header("content-type", "application/x-www-form-urlencoded");
    }
    req.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("user-agent"));
    req.headers
        .push(("user-agent".to_string(), rcx.user_agent.clone()));

    if rcx.cancel.is_cancelled() {
        return Err(anyhow!("run is stopping; request not issued"));
    }

    let response = rcx
        .client
        .execute(req, rcx.reporter.as_ref())
        .map_err(|e| anyhow!("{method} {url_str}: {e}"))?;

    Ok(heap.alloc(Response::from(response)))
}

/// A completed HTTP response with a fully buffered body, the shape
/// synchronous scripting code expects.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct Response {
    status: u16,
    url: String,
    body: Vec<u8>,
}
starlark_simple_value!(Response);

impl From<BufferedResponse> for Response {
    fn from(resp: BufferedResponse) -> Self {
        Response {
            status: resp.status,
            url: resp.url,
            body: resp.body,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<response [{}]>", self.status)
    }
}

#[starlark_value(type = "response")]
impl<'v> StarlarkValue<'v> for Response {
    fn get_methods() -> Option<&'static Methods> {
        static RES: MethodsStatic = MethodsStatic::new();
        RES.methods(response_methods)
    }
}

fn response_ref(value: Value) -> anyhow::Result<&Response> {
    value
        .downcast_ref::<Response>()
        .ok_or_else(|| anyhow!("expected a response"))
}

#[starlark_module]
fn response_methods(builder: &mut MethodsBuilder) {
    #[starlark(attribute)]
    fn status_code<'v>(this: Value<'v>) -> anyhow::Result<i32> {
        Ok(response_ref(this)?.status as i32)
    }

    #[starlark(attribute)]
    fn url<'v>(this: Value<'v>) -> anyhow::Result<String> {
        Ok(response_ref(this)?.url.clone())
    }

    #[starlark(attribute)]
    fn ok<'v>(this: Value<'v>) -> anyhow::Result<bool> {
        Ok(response_ref(this)?.status < 400)
    }

    #[starlark(attribute)]
    fn text<'v>(this: Value<'v>) -> anyhow::Result<String> {
        Ok(String::from_utf8_lossy(&response_ref(this)?.body).into_owned())
    }

    /// Parse the body as JSON on demand; `text` is effectively free because
    /// the body is already buffered, so only `json` is lazy.
    fn json<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        let response = response_ref(this)?;
        let doc: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| anyhow!("response.json: {e}"))?;
        json_to_value(heap, &doc)
    }

    fn raise_for_status<'v>(this: Value<'v>) -> anyhow::Result<NoneType> {
        let response = response_ref(this)?;
        if response.status >= 400 {
            return Err(anyhow!("HTTP {} from {}", response.status, response.url));
        }
        Ok(NoneType)
    }
}
