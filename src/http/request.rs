use std::collections::HashMap;

/// HTTP request methods served by the file server.
///
/// Only the read-only methods are recognized; any other token on the request
/// line is rejected by the parser with `400 Bad Request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// HEAD - Like GET but without the response body
    HEAD,
}

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// Represents a parsed HTTP request from a client.
///
/// Header names are stored lower-cased, so lookups through
/// [`Request::header`] are case-insensitive. The body, if the client sent
/// one, is kept only so the connection can skip past it.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET or HEAD)
    pub method: Method,
    /// The raw request target (e.g. "/css/style.css?v=2")
    pub path: String,
    pub version: Version,
    /// Request headers, keyed by lower-cased name
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Version,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Method tokens are case-sensitive.
    ///
    /// # Example
    ///
    /// ```
    /// # use portico::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// assert_eq!(Method::from_str("POST"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "HEAD" => Some(Method::HEAD),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
        }
    }
}

impl Version {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            version: Version::Http11,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            version: self.version,
            headers: self.headers,
            body: self.body,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// Whether the `Connection` header lists `token` (e.g. "close").
    pub fn has_connection_token(&self, token: &str) -> bool {
        self.header("Connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Whether the client asked for the connection to stay open.
    ///
    /// HTTP/1.1 persists unless `Connection: close` is sent; HTTP/1.0 closes
    /// unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.has_connection_token("close"),
            Version::Http10 => self.has_connection_token("keep-alive"),
        }
    }
}
