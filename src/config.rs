use std::io::Write;
use std::time::Duration;

use url::Url;

use crate::errors::Error;
use crate::utils::parse_header;

/// How the reporter emits results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Aggregate statistics printed at the end of the run.
    Summary,
    /// One CSV row per result, streamed as results arrive.
    Csv,
}

impl OutputMode {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "" => Ok(OutputMode::Summary),
            "csv" => Ok(OutputMode::Csv),
            other => Err(Error::Config(format!(
                "invalid output type {other:?}; expected \"\" or \"csv\""
            ))),
        }
    }
}

/// Immutable configuration for one run.
pub struct WorkSpec {
    /// Total number of script units to run; 0 selects RPS mode.
    pub n: u64,

    /// Target requests per second in RPS mode.
    pub rps: u64,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Negotiate HTTP/2 over TLS (ALPN).
    pub h2: bool,

    /// Do not advertise or decode gzip response bodies.
    pub disable_compression: bool,

    /// Do not reuse TCP connections between requests.
    pub disable_keepalive: bool,

    /// HTTP proxy to route requests through.
    pub proxy: Option<Url>,

    /// Value of the injected user-agent header.
    pub user_agent: String,

    /// Extra headers merged into every request.
    pub headers: Vec<(String, String)>,

    /// Reporter output mode.
    pub output: OutputMode,

    /// Where the reporter writes. Defaults to stdout.
    pub writer: Option<Box<dyn Write + Send>>,

    /// Compute controller adjustments without applying them.
    pub observe_only: bool,
}

impl Default for WorkSpec {
    fn default() -> Self {
        WorkSpec {
            n: 0,
            rps: 5,
            timeout: Duration::from_secs(20),
            h2: false,
            disable_compression: false,
            disable_keepalive: false,
            proxy: None,
            user_agent: concat!("sling/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: Vec::new(),
            output: OutputMode::Summary,
            writer: None,
            observe_only: false,
        }
    }
}

impl WorkSpec {
    /// Validate cross-field constraints before a run.
    pub fn validate(&self) -> Result<(), Error> {
        if self.n == 0 && self.rps < 1 {
            return Err(Error::Config(
                "rps cannot be smaller than 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Parse repeatable `Name: value` header flags.
    pub fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>, Error> {
        raw.iter().map(|h| parse_header(h)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_mode_parse() {
        assert_eq!(OutputMode::parse("").unwrap(), OutputMode::Summary);
        assert_eq!(OutputMode::parse("csv").unwrap(), OutputMode::Csv);
        assert!(OutputMode::parse("json").is_err());
    }

    #[test]
    fn test_rps_mode_requires_rate() {
        let spec = WorkSpec {
            rps: 0,
            ..WorkSpec::default()
        };
        assert!(spec.validate().is_err());

        let spec = WorkSpec {
            n: 10,
            rps: 0,
            ..WorkSpec::default()
        };
        // Fixed-N mode does not use the rate target.
        assert!(spec.validate().is_ok());
    }
}
