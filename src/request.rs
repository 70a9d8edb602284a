use thiserror::Error;

/// Why a client request was rejected before any upstream contact. The
/// client never sees an error body for these; the connection just closes.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("empty request")]
    Empty,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("missing or empty Host header")]
    MissingHost,
    #[error("invalid port in Host header: {0:?}")]
    InvalidPort(String),
}

/// The leading bytes of a client request, parsed just far enough to route it.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    /// The raw bytes as received, forwarded verbatim on the HTTP path.
    pub raw: Vec<u8>,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses the method token and the `Host:` header out of a raw request.
///
/// The target host and port come from the `Host:` header, not from the
/// request line; when the header carries no explicit port, `CONNECT`
/// requests default to 443 and everything else to 80.
pub fn parse(raw: Vec<u8>) -> Result<ParsedRequest, RequestError> {
    if raw.is_empty() {
        return Err(RequestError::Empty);
    }

    let first_line_end = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
    let first_line = String::from_utf8_lossy(&raw[..first_line_end]).into_owned();

    let mut tokens = first_line.split_whitespace();
    let method = tokens.next().ok_or(RequestError::MalformedRequestLine)?.to_string();
    if tokens.count() < 2 {
        return Err(RequestError::MalformedRequestLine);
    }

    let (host, port) = extract_host_port(&raw, &first_line)?;

    Ok(ParsedRequest {
        method,
        host,
        port,
        raw,
    })
}

fn extract_host_port(raw: &[u8], first_line: &str) -> Result<(String, u16), RequestError> {
    const HOST_HEADER: &[u8] = b"Host: ";

    let start =
        find_subsequence(raw, HOST_HEADER).ok_or(RequestError::MissingHost)? + HOST_HEADER.len();
    let end = find_subsequence(&raw[start..], b"\r\n").map_or(raw.len(), |i| start + i);

    let value = String::from_utf8_lossy(&raw[start..end]);
    let value = value.trim();

    let (host, port) = match value.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| RequestError::InvalidPort(port.to_string()))?;
            (host, port)
        }
        None => {
            let port = if first_line.contains("CONNECT") { 443 } else { 80 };
            (value, port)
        }
    };

    if host.is_empty() {
        return Err(RequestError::MissingHost);
    }
    Ok((host.to_string(), port))
}

/// First position of `needle` in `haystack`, byte-for-byte.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_http_request() {
        let raw = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let req = parse(raw.to_vec()).unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 80);
        assert!(!req.is_connect());
        assert_eq!(req.target(), "example.com:80");
    }

    #[test]
    fn parses_connect_request_with_default_port() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = parse(raw.to_vec()).unwrap();

        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 443);
        assert!(req.is_connect());
    }

    #[test]
    fn explicit_port_in_host_header_wins() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let req = parse(raw.to_vec()).unwrap();

        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 8080);
    }

    #[test]
    fn missing_host_header_is_rejected() {
        let raw = b"GET / HTTP/1.1\r\nUser-Agent: curl\r\n\r\n";
        assert!(matches!(parse(raw.to_vec()), Err(RequestError::MissingHost)));
    }

    #[test]
    fn empty_host_value_is_rejected() {
        let raw = b"GET / HTTP/1.1\r\nHost: \r\n\r\n";
        assert!(matches!(parse(raw.to_vec()), Err(RequestError::MissingHost)));
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com:http\r\n\r\n";
        assert!(matches!(parse(raw.to_vec()), Err(RequestError::InvalidPort(_))));
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(matches!(parse(Vec::new()), Err(RequestError::Empty)));
    }

    #[test]
    fn short_request_line_is_rejected() {
        let raw = b"GET /\r\nHost: example.com\r\n\r\n";
        assert!(matches!(
            parse(raw.to_vec()),
            Err(RequestError::MalformedRequestLine)
        ));
    }

    #[test]
    fn host_lookup_is_case_sensitive() {
        // The literal `Host: ` is matched byte-for-byte; a lowercased header
        // does not count as extraction succeeding.
        let raw = b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n";
        assert!(matches!(parse(raw.to_vec()), Err(RequestError::MissingHost)));
    }

    #[test]
    fn finds_byte_subsequences() {
        assert_eq!(find_subsequence(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subsequence(b"abcdef", b"xy"), None);
        assert_eq!(find_subsequence(b"ab", b"abcd"), None);
    }
}
