use std::collections::HashMap;

use crate::auth;
use crate::buffer::Buffer;
use crate::logger::Logger;
use crate::sqlpool::SqlConnPool;

/// Short names that resolve to their `.html` page.
const DEFAULT_HTML: [&str; 6] = ["/index", "/register", "/login", "/welcome", "/video", "picture"];

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
}

/// Per-connection HTTP request state machine.
///
/// Each `parse` call consumes whole CRLF-delimited lines from the read
/// buffer and advances through request line, headers, and the optional
/// single-read body.
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    post: HashMap<String, String>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            post: HashMap::new(),
        }
    }

    /// Reset for the next request on this connection.
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.post.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn post_value(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.headers.get("Connection").map(String::as_str) == Some("keep-alive")
            && self.version == "1.1"
    }

    /// Drive the state machine over the readable span.
    pub fn parse(
        &mut self,
        buff: &mut Buffer,
        pool: Option<&SqlConnPool>,
        log: &Logger,
    ) -> Result<(), ParseError> {
        while buff.readable_len() > 0 && self.state != ParseState::Finish {
            let readable = buff.peek();
            let line_end = readable
                .windows(2)
                .position(|w| w == CRLF);
            let line_len = line_end.unwrap_or(readable.len());
            let line = String::from_utf8_lossy(&readable[..line_len]).into_owned();

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.normalize_path();
                }
                ParseState::Headers => {
                    self.parse_header(&line);
                    // Nothing beyond the closing CRLF: no body expected.
                    // Assumes the final CRLF arrived in the same read as
                    // the last header; a fragmented read can land here
                    // early.
                    if buff.readable_len() <= 2 {
                        self.state = ParseState::Finish;
                    }
                }
                ParseState::Body => {
                    self.parse_body(line, pool, log);
                }
                ParseState::Finish => {}
            }

            match line_end {
                // Partial line: wait for the rest.
                None => break,
                Some(_) => buff
                    .retrieve(line_len + 2)
                    .expect("line bounds came from the readable span"),
            }
        }
        log.debug(format!(
            "request [{}] [{}] [HTTP/{}]",
            self.method, self.path, self.version
        ));
        Ok(())
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let (method, path, proto) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v), None) if !m.is_empty() && !p.is_empty() => (m, p, v),
            _ => return Err(ParseError::BadRequestLine),
        };
        let version = proto
            .strip_prefix("HTTP/")
            .ok_or(ParseError::BadRequestLine)?;
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.headers.insert(name.to_string(), value.to_string());
            }
            // First non-header line ends the header block.
            None => self.state = ParseState::Body,
        }
    }

    fn parse_body(&mut self, line: String, pool: Option<&SqlConnPool>, log: &Logger) {
        self.body = line;
        self.parse_post(pool, log);
        self.state = ParseState::Finish;
        log.debug(format!("body len {}", self.body.len()));
    }

    fn parse_post(&mut self, pool: Option<&SqlConnPool>, log: &Logger) {
        if self.method != "POST"
            || self.header("Content-Type") != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        self.post = decode_urlencoded(&self.body);

        let is_login = match self.path.as_str() {
            "/register.html" => false,
            "/login.html" => true,
            _ => return,
        };

        let name = self.post_value("username").unwrap_or_default().to_owned();
        let pwd = self.post_value("password").unwrap_or_default().to_owned();
        let verified = match pool {
            Some(pool) => auth::user_verify(pool, &name, &pwd, is_login).unwrap_or_else(|e| {
                log.error(format!("credential check failed: {e}"));
                false
            }),
            None => {
                log.warn("auth request without a configured SQL pool");
                false
            }
        };
        self.path = if verified {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }
}

/// Decode an `application/x-www-form-urlencoded` body: `+` means space,
/// `%HH` is the byte with hex value HH, `&` separates `key=value` pairs.
fn decode_urlencoded(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for pair in body.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(decode_component(key), decode_component(value));
        }
    }
    fields
}

fn decode_component(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match hex_pair(bytes[i + 1], bytes[i + 2]) {
                Some(byte) => {
                    out.push(byte);
                    i += 3;
                }
                None => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> Logger {
        Logger::disabled()
    }

    fn parse_bytes(req: &mut HttpRequest, raw: &[u8]) -> Result<(), ParseError> {
        let mut buff = Buffer::new();
        buff.append(raw);
        req.parse(&mut buff, None, &quiet())
    }

    #[test]
    fn get_request_parses_line_and_headers() {
        let mut req = HttpRequest::new();
        parse_bytes(
            &mut req,
            b"GET /video HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();

        assert_eq!(req.state(), ParseState::Finish);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/video.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("Host"), Some("localhost"));
        assert!(req.is_keep_alive());
    }

    #[test]
    fn root_path_becomes_index() {
        let mut req = HttpRequest::new();
        parse_bytes(&mut req, b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn unknown_path_is_left_alone() {
        let mut req = HttpRequest::new();
        parse_bytes(&mut req, b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/missing");
    }

    #[test]
    fn garbage_request_line_is_rejected() {
        let mut req = HttpRequest::new();
        assert_eq!(
            parse_bytes(&mut req, b"NOT-HTTP\r\n\r\n"),
            Err(ParseError::BadRequestLine)
        );
        assert_eq!(
            parse_bytes(&mut HttpRequest::new(), b"GET /x FTP/1.1\r\n\r\n"),
            Err(ParseError::BadRequestLine)
        );
    }

    #[test]
    fn keep_alive_needs_version_one_one() {
        let mut req = HttpRequest::new();
        parse_bytes(
            &mut req,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn post_body_is_form_decoded() {
        let mut req = HttpRequest::new();
        parse_bytes(
            &mut req,
            b"POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\na=1+2&b=x%21y",
        )
        .unwrap();
        assert_eq!(req.state(), ParseState::Finish);
        assert_eq!(req.post_value("a"), Some("1 2"));
        assert_eq!(req.post_value("b"), Some("x!y"));
    }

    #[test]
    fn login_without_pool_rewrites_to_error_page() {
        let mut req = HttpRequest::new();
        parse_bytes(
            &mut req,
            b"POST /login.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nusername=a&password=b",
        )
        .unwrap();
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn urlencoded_round_trip_without_escapes() {
        let fields = decode_urlencoded("k1=v1&k2=v2&k3=v3");
        assert_eq!(fields["k1"], "v1");
        assert_eq!(fields["k2"], "v2");
        assert_eq!(fields["k3"], "v3");
    }

    #[test]
    fn percent_escapes_decode_to_their_bytes() {
        assert_eq!(decode_component("%41%20%7a"), "A z");
        // Truncated escape survives literally.
        assert_eq!(decode_component("100%"), "100%");
    }
}
