use crate::http::request::{Method, Request, Version};
use std::collections::HashMap;
use std::fmt;

/// Size limits applied while parsing a request head and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Longest single line (request line or header line), CRLF excluded.
    pub max_line_size: usize,
    /// Longest request head: request line, headers and the blank line.
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_line_size: 8 * 1024,
            max_header_size: 16 * 1024,
            max_body_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed before a request can be produced.
    Incomplete,
    /// The request is malformed; the reason is for logs only.
    BadRequest(&'static str),
    /// A line, the head or the declared body exceeds the configured limits.
    ///
    /// Oversized bodies are reported here as well, so they are also answered
    /// with `431 Request Header Fields Too Large`; GET and HEAD carry no
    /// meaningful body, and the connection is closed either way.
    TooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete request"),
            ParseError::BadRequest(reason) => write!(f, "bad request: {reason}"),
            ParseError::TooLarge => write!(f, "request too large"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy)]
enum State {
    StartLine,
    Headers,
    Body(usize),
    Complete,
}

/// Parses one request from the front of `buf` using the default limits.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    parse_with_limits(buf, &ParseLimits::default())
}

/// Parses one request from the front of `buf`.
///
/// On success returns the request and the number of bytes it occupied, so
/// pipelined bytes that follow it can stay buffered for the next call.
/// Returns [`ParseError::Incomplete`] when `buf` holds only a prefix of a
/// request that is still within the limits.
pub fn parse_with_limits(
    buf: &[u8],
    limits: &ParseLimits,
) -> Result<(Request, usize), ParseError> {
    let mut state = State::StartLine;
    let mut pos = 0;
    let mut start_line = None;
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut body = Vec::new();

    loop {
        match state {
            State::StartLine | State::Headers => {
                let line = match next_line(&buf[pos..], limits.max_line_size)? {
                    Some(line) => line,
                    None if buf.len() > limits.max_header_size => {
                        return Err(ParseError::TooLarge);
                    }
                    None => return Err(ParseError::Incomplete),
                };
                pos += line.len() + 2;

                if pos > limits.max_header_size {
                    return Err(ParseError::TooLarge);
                }

                if let State::StartLine = state {
                    // Stray CRLFs between pipelined requests are ignored.
                    if line.is_empty() {
                        continue;
                    }
                    start_line = Some(parse_start_line(line)?);
                    state = State::Headers;
                } else if line.is_empty() {
                    let content_length = body_length(&headers)?;
                    if content_length > limits.max_body_size {
                        return Err(ParseError::TooLarge);
                    }
                    state = if content_length > 0 {
                        State::Body(content_length)
                    } else {
                        State::Complete
                    };
                } else {
                    let (name, value) = parse_header_line(line)?;
                    headers
                        .entry(name)
                        .and_modify(|existing| {
                            existing.push_str(", ");
                            existing.push_str(&value);
                        })
                        .or_insert(value);
                }
            }

            State::Body(content_length) => {
                if buf.len() - pos < content_length {
                    return Err(ParseError::Incomplete);
                }
                body = buf[pos..pos + content_length].to_vec();
                pos += content_length;
                state = State::Complete;
            }

            State::Complete => break,
        }
    }

    let (method, path, version) =
        start_line.ok_or(ParseError::BadRequest("missing request line"))?;

    let request = Request {
        method,
        path,
        version,
        headers,
        body,
    };

    Ok((request, pos))
}

/// Returns the next CRLF-terminated line without its terminator.
fn next_line(buf: &[u8], max_line_size: usize) -> Result<Option<&[u8]>, ParseError> {
    let Some(lf) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > max_line_size + 1 {
            return Err(ParseError::TooLarge);
        }
        return Ok(None);
    };

    if lf == 0 || buf[lf - 1] != b'\r' {
        return Err(ParseError::BadRequest("line not terminated by CRLF"));
    }

    let line = &buf[..lf - 1];
    if line.len() > max_line_size {
        return Err(ParseError::TooLarge);
    }
    if line.contains(&b'\r') {
        return Err(ParseError::BadRequest("stray CR in line"));
    }

    Ok(Some(line))
}

fn parse_start_line(line: &[u8]) -> Result<(Method, String, Version), ParseError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ParseError::BadRequest("request line is not UTF-8"))?;

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequest("malformed request line"));
    };

    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError::BadRequest("malformed request line"));
    }

    let method = Method::from_str(method).ok_or(ParseError::BadRequest("unsupported method"))?;
    let version =
        Version::from_str(version).ok_or(ParseError::BadRequest("unsupported HTTP version"))?;

    if !target.starts_with('/') {
        return Err(ParseError::BadRequest("request target must be origin-form"));
    }

    Ok((method, target.to_string(), version))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ParseError::BadRequest("obsolete header line folding"));
    }

    let line = std::str::from_utf8(line)
        .map_err(|_| ParseError::BadRequest("header is not UTF-8"))?;

    let (name, value) = line
        .split_once(':')
        .ok_or(ParseError::BadRequest("header without colon"))?;

    if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ParseError::BadRequest("invalid header name"));
    }

    Ok((
        name.to_ascii_lowercase(),
        value.trim_matches(|c| c == ' ' || c == '\t').to_string(),
    ))
}

fn body_length(headers: &HashMap<String, String>) -> Result<usize, ParseError> {
    if headers.contains_key("transfer-encoding") {
        return Err(ParseError::BadRequest("transfer-encoding not supported"));
    }

    let Some(raw) = headers.get("content-length") else {
        return Ok(0);
    };

    // Repeated headers were joined with ", "; all copies must agree.
    let mut length = None;
    for value in raw.split(',') {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::BadRequest("invalid content-length"));
        }
        let parsed: usize = value
            .parse()
            .map_err(|_| ParseError::BadRequest("invalid content-length"))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ParseError::BadRequest("conflicting content-length"));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(length.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.header("Host"), Some("example.com"));
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn leading_blank_lines_are_skipped() {
        let req = b"\r\n\r\nHEAD /a HTTP/1.0\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.method, Method::HEAD);
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn partial_line_over_limit_is_too_large() {
        let limits = ParseLimits {
            max_line_size: 16,
            max_header_size: 64,
            max_body_size: 0,
        };
        let req = b"GET /aaaaaaaaaaaaaaaaaaaaaaaa";

        assert_eq!(parse_with_limits(req, &limits).unwrap_err(), ParseError::TooLarge);
    }
}
