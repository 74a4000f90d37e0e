use std::time::Duration;

use crate::errors::ErrorKind;

/// Measurements for one completed HTTP call.
///
/// A phase that did not occur (e.g. DNS lookup on a reused connection)
/// reports a zero duration. `status_code` is 0 and `err` is set when the
/// request failed at the transport level.
#[derive(Debug, Clone)]
pub struct CallResult {
    /// Time since run start at which the request began.
    pub offset: Duration,

    /// HTTP status code, 0 on transport error.
    pub status_code: u16,

    /// Transport error kind, if the call failed before an HTTP response.
    pub err: Option<ErrorKind>,

    /// Response body size in bytes, negative when unknown (chunked without
    /// a content-length header).
    pub content_length: i64,

    /// Total wall time for the call.
    pub duration: Duration,

    /// Connection setup (DNS lookup + dial + TLS); 0 if the connection was
    /// reused.
    pub conn_duration: Duration,

    /// DNS lookup.
    pub dns_duration: Duration,

    /// Request write.
    pub req_duration: Duration,

    /// First response byte to end of body.
    pub res_duration: Duration,

    /// Request written to first response byte (TTFB).
    pub delay_duration: Duration,
}

impl CallResult {
    /// A result for a call that failed in transport before any response.
    pub fn transport_error(offset: Duration, duration: Duration, kind: ErrorKind) -> Self {
        CallResult {
            offset,
            status_code: 0,
            err: Some(kind),
            content_length: 0,
            duration,
            conn_duration: Duration::ZERO,
            dns_duration: Duration::ZERO,
            req_duration: Duration::ZERO,
            res_duration: Duration::ZERO,
            delay_duration: Duration::ZERO,
        }
    }
}
