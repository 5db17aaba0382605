use tokio::fs::File;

/// HTTP status codes produced by the server.
///
/// - `Ok` (200): file served
/// - `BadRequest` (400): malformed request
/// - `Forbidden` (403): path escapes the document root
/// - `NotFound` (404): no such file
/// - `RequestHeaderFieldsTooLarge` (431): request line or head over the limits
/// - `InternalServerError` (500): file could not be read
/// - `ServiceUnavailable` (503): worker queue full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 431 Request Header Fields Too Large
    RequestHeaderFieldsTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 503 Service Unavailable
    ServiceUnavailable,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use portico::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::RequestHeaderFieldsTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use portico::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Where the response body comes from.
#[derive(Debug)]
pub enum Body {
    /// In-memory body, used for error pages.
    Bytes(Vec<u8>),
    /// An open file and the number of bytes to send from it.
    File { file: File, len: u64 },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Bytes(bytes) => bytes.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Represents a complete HTTP response ready to be sent to a client.
///
/// Headers keep their insertion order on the wire; setting a header that is
/// already present replaces it in place.
#[derive(Debug)]
pub struct Response {
    /// The HTTP status code
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "text/css")
///     .body(b"body {}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Body,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Bytes(Vec::new()),
        }
    }

    /// Adds or replaces a header (names compare case-insensitively).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, key.into(), value.into());
        self
    }

    /// Sets an in-memory response body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Body::Bytes(body);
        self
    }

    /// Sets a file body of `len` bytes.
    pub fn file(mut self, file: File, len: u64) -> Self {
        self.body = Body::File { file, len };
        self
    }

    /// Builds the final Response.
    ///
    /// `Content-Length` is always derived from the body, replacing any value
    /// set by hand.
    pub fn build(mut self) -> Response {
        let len = self.body.len().to_string();
        set_header(&mut self.headers, "Content-Length".to_string(), len);

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

fn set_header(headers: &mut Vec<(String, String)>, key: String, value: String) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
        Some(entry) => entry.1 = value,
        None => headers.push((key, value)),
    }
}

impl Response {
    /// Creates a 200 OK response with the given in-memory body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        ResponseBuilder::new(StatusCode::Ok)
            .body(body.into())
            .build()
    }

    /// Creates an HTML error page for `status` with a short explanation.
    pub fn error_page(status: StatusCode, message: &str) -> Self {
        let code = status.as_u16();
        let reason = status.reason_phrase();
        let html = format!(
            "<!DOCTYPE html>\n\
             <html>\n\
             <head><title>{code} {reason}</title></head>\n\
             <body>\n\
             <h1>{code} - {reason}</h1>\n\
             <p>{message}</p>\n\
             <a href=\"/\">Back to Home</a>\n\
             </body>\n\
             </html>\n",
            message = escape_html(message),
        );

        ResponseBuilder::new(status)
            .header("Content-Type", "text/html")
            .body(html.into_bytes())
            .build()
    }

    /// Creates a 404 Not Found response.
    pub fn not_found() -> Self {
        Self::error_page(StatusCode::NotFound, "The requested file was not found.")
    }

    /// Creates a 500 Internal Server Error response.
    pub fn internal_error() -> Self {
        Self::error_page(
            StatusCode::InternalServerError,
            "The server failed to read the requested file.",
        )
    }

    /// Creates the 503 answer sent when no worker can take the connection.
    pub fn server_busy() -> Self {
        Self::error_page(
            StatusCode::ServiceUnavailable,
            "Server busy, please retry shortly.",
        )
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        set_header(&mut self.headers, key.into(), value.into());
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
