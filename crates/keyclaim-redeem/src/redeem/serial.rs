//! Serial extraction from user input.
//!
//! Users paste either the bare code or a storefront link carrying it, e.g.
//! `https://shop.example.com/redeem?serial=ABCD-1234` or
//! `https://shop.example.com/keys/ABCD-1234`.

use reqwest::Url;
use thiserror::Error;

const MIN_LEN: usize = 4;
const MAX_LEN: usize = 64;
const QUERY_KEYS: [&str; 3] = ["serial", "key", "code"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    #[error("no serial given")]
    Empty,

    #[error("serial must be {MIN_LEN}-{MAX_LEN} characters, got {0}")]
    Length(usize),

    #[error("serial may only contain letters, digits and '-'")]
    Charset,
}

/// Extract and validate a serial from a bare code or a URL containing it.
pub fn parse_serial(input: &str) -> Result<String, SerialError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SerialError::Empty);
    }

    let candidate = if input.contains("://") {
        Url::parse(input).ok().and_then(|url| from_url(&url))
    } else {
        None
    }
    .unwrap_or_else(|| input.to_string());

    validate(candidate.trim())
}

fn from_url(url: &Url) -> Option<String> {
    let from_query = url
        .query_pairs()
        .find(|(k, v)| QUERY_KEYS.contains(&k.as_ref()) && !v.trim().is_empty())
        .map(|(_, v)| v.into_owned());

    from_query.or_else(|| {
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .next_back()
            .map(str::to_string)
    })
}

fn validate(serial: &str) -> Result<String, SerialError> {
    if serial.is_empty() {
        return Err(SerialError::Empty);
    }
    let len = serial.chars().count();
    if !(MIN_LEN..=MAX_LEN).contains(&len) {
        return Err(SerialError::Length(len));
    }
    if !serial.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(SerialError::Charset);
    }
    Ok(serial.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_code_is_trimmed() {
        assert_eq!(parse_serial("  ABCDEFGHIJ \n"), Ok("ABCDEFGHIJ".into()));
        assert_eq!(parse_serial("abcd-1234"), Ok("abcd-1234".into()));
    }

    #[test]
    fn code_from_query_parameter() {
        assert_eq!(
            parse_serial("https://shop.example.com/redeem?ref=x&serial=ABCD-1234"),
            Ok("ABCD-1234".into())
        );
        assert_eq!(
            parse_serial("https://shop.example.com/redeem?code=QWERTY"),
            Ok("QWERTY".into())
        );
    }

    #[test]
    fn code_from_last_path_segment() {
        assert_eq!(
            parse_serial("https://shop.example.com/keys/ABCDEFGHIJ/"),
            Ok("ABCDEFGHIJ".into())
        );
    }

    #[test]
    fn invalid_serials_are_rejected() {
        assert_eq!(parse_serial(""), Err(SerialError::Empty));
        assert_eq!(parse_serial("abc"), Err(SerialError::Length(3)));
        assert_eq!(parse_serial(&"A".repeat(65)), Err(SerialError::Length(65)));
        assert_eq!(parse_serial("ABCD EFGH"), Err(SerialError::Charset));
        assert_eq!(parse_serial("ABCD_EFGH"), Err(SerialError::Charset));
    }

    #[test]
    fn url_without_usable_segment_fails_validation() {
        assert_eq!(
            parse_serial("https://shop.example.com/"),
            Err(SerialError::Charset)
        );
    }
}
