use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Strips surrounding whitespace and angle brackets from an SMTP address
/// argument.
pub fn strip_angle_brackets(input: &str) -> &str {
    input.trim().trim_matches(|c| c == '<' || c == '>')
}

/// Extracts the recipient domain, the part after the `@`.
///
/// Returns an empty string unless the address contains exactly one `@`.
pub fn mail_domain(address: &str) -> &str {
    let mut parts = address.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(domain), None) => domain,
        _ => "",
    }
}

/// Decodes one base64 credential line from an AUTH LOGIN exchange.
///
/// Returns `None` if the input is not valid base64 or not valid UTF-8.
pub fn decode_credential(line: &str) -> Option<String> {
    let bytes = BASE64.decode(line.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Current time as whole seconds since the Unix epoch.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("<alice@example.org>", "alice@example.org")]
    #[case("  <alice@example.org>  ", "alice@example.org")]
    #[case("alice@example.org", "alice@example.org")]
    #[case("<>", "")]
    #[case("", "")]
    fn test_strip_angle_brackets(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_angle_brackets(input), expected);
    }

    #[rstest]
    #[case("alice@example.org", "example.org")]
    #[case("@example.org", "example.org")]
    #[case("alice", "")]
    #[case("a@b@c", "")]
    #[case("", "")]
    fn test_mail_domain(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(mail_domain(input), expected);
    }

    #[rstest]
    #[case("dGVzdHVzZXI=", Some("testuser".to_string()))]
    #[case("  dGVzdHVzZXI=  ", Some("testuser".to_string()))]
    #[case("!!! not base64 !!!", None)]
    #[case("", Some(String::new()))]
    fn test_decode_credential(#[case] input: &str, #[case] expected: Option<String>) {
        assert_eq!(decode_credential(input), expected);
    }
}
