use regex::Regex;
use std::sync::OnceLock;

use crate::errors::Error;

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([\w-]+):\s*(.+)").expect("header regex"))
}

/// Parse one `Name: value` header flag.
pub fn parse_header(input: &str) -> Result<(String, String), Error> {
    let caps = header_regex()
        .captures(input)
        .ok_or_else(|| Error::Config(format!("could not parse header {input:?}")))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_simple() {
        let (name, value) = parse_header("Authorization: Bearer abc").unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer abc");
    }

    #[test]
    fn test_parse_header_no_space() {
        let (name, value) = parse_header("X-Trace-Id:42").unwrap();
        assert_eq!(name, "X-Trace-Id");
        assert_eq!(value, "42");
    }

    #[test]
    fn test_parse_header_value_keeps_colons() {
        let (_, value) = parse_header("Referer: http://example.com/a").unwrap();
        assert_eq!(value, "http://example.com/a");
    }

    #[test]
    fn test_parse_header_rejects_garbage() {
        assert!(parse_header("no-colon-here").is_err());
        assert!(parse_header(": empty name").is_err());
    }
}
