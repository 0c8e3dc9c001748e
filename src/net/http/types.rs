//! HTTP/1.1 message types shared by the parser and the control server.

use std::collections::HashMap;
use std::fmt;

/// Methods the control endpoint accepts. Anything else is rejected with a
/// 400 before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header collection with case-insensitive lookup, preserving the original
/// casing and insertion order for serialization.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when any comma-separated element of `name`'s value equals
    /// `token` case-insensitively (`Connection: keep-alive, Upgrade`).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Raw request target, query string included.
    pub target: String,
    /// Target with the query string stripped.
    pub path: String,
    pub query: HashMap<String, String>,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            target: target.to_string(),
            path,
            query,
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Serialize for the wire, emitting Content-Length when a body is
    /// present and none was set explicitly.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (k, v) in self.headers.iter() {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        if !self.body.is_empty() && self.headers.get("Content-Length").is_none() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub fn wants_close(&self) -> bool {
        self.headers.contains_token("Connection", "close")
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let mut r = Self::new(200, "OK");
        r.body = body.into();
        r
    }

    pub fn bad_request(msg: &str) -> Self {
        let mut r = Self::new(400, "Bad Request");
        r.body = msg.as_bytes().to_vec();
        r
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        for (k, v) in self.headers.iter() {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        // 101 upgrades carry no body and must not advertise one.
        if self.status != 101 && self.headers.get("Content-Length").is_none() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    match target.split_once('?') {
        None => (target.to_string(), HashMap::new()),
        Some((path, qs)) => {
            let query = url::form_urlencoded::parse(qs.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            (path.to_string(), query)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("missing"), None);
    }

    #[test]
    fn connection_token_matching() {
        let mut h = Headers::new();
        h.insert("Connection", "keep-alive, Upgrade");
        assert!(h.contains_token("Connection", "upgrade"));
        assert!(h.contains_token("connection", "Keep-Alive"));
        assert!(!h.contains_token("Connection", "close"));
    }

    #[test]
    fn target_query_parsing() {
        let req = HttpRequest::new(Method::Get, "/stats?room=R&verbose=1");
        assert_eq!(req.path, "/stats");
        assert_eq!(req.query.get("room").map(String::as_str), Some("R"));
        assert_eq!(req.query.get("verbose").map(String::as_str), Some("1"));
    }

    #[test]
    fn response_serialization_appends_content_length() {
        let resp = HttpResponse::ok("hello");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\nhello"));
    }

    #[test]
    fn upgrade_response_has_no_content_length() {
        let resp = HttpResponse::new(101, "Switching Protocols");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(!text.contains("Content-Length"));
    }
}
