//! Header extraction from a raw HTTP request head

/// Parse `Name: value` header lines from raw request-head bytes.
///
/// The request line is skipped; parsing stops at the blank line. Bytes past
/// the head (an eagerly read body chunk) are ignored.
pub fn parse_request_headers(head: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(head);
    let mut headers = Vec::new();

    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    headers
}

/// Case-insensitive header lookup
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
