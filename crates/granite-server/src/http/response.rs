//! HTTP response construction.
//!
//! A response is either head-only, a head plus a small in-memory HTML body
//! (error pages), or a head plus an open file streamed by the transport.
//! Heads are pre-formatted into a buffer once, at build time; the job layer
//! then pushes bytes until the counters reach the buffer lengths.

use std::fs::File;
use std::path::Path;
use std::time::SystemTime;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::http::parser::{ParseError, Request};
use crate::http::path::{self, ResolveError};
use crate::mime;

/// Server identity advertised in every response.
const SERVER_NAME: &str = concat!("granite/", env!("CARGO_PKG_VERSION"));

const HTML_400: &str = "<!DOCTYPE html>\n\
<html>\n\
  <head><title>Bad Request</title></head>\n\
  <body><div><h1>Bad request.</h1></div></body>\n\
</html>\n";

const HTML_404: &str = "<!DOCTYPE html>\n\
<html>\n\
  <head><title>Not Found</title></head>\n\
  <body><div><h1>Not found.</h1></div></body>\n\
</html>\n";

const HTML_405: &str = "<!DOCTYPE html>\n\
<html>\n\
  <head><title>Method Not Allowed</title></head>\n\
  <body><div><h1>Method not allowed.</h1></div></body>\n\
</html>\n";

const HTML_500: &str = "<!DOCTYPE html>\n\
<html>\n\
  <head><title>Internal Server Error</title></head>\n\
  <body><div><h1>Internal server error.</h1></div></body>\n\
</html>\n";

/// What follows the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Head only (HEAD, OPTIONS).
    HeadOnly,
    /// Head plus the in-memory `body` buffer.
    Text,
    /// Head plus the contents of `file`.
    File,
}

/// An open file scheduled for transmission.
#[derive(Debug)]
pub struct ResponseFile {
    pub file: File,
    pub len: u64,
}

/// One pre-built response.
#[derive(Debug)]
pub struct Response {
    pub kind: ResponseKind,
    pub head: BytesMut,
    pub body: BytesMut,
    pub file: Option<ResponseFile>,
}

impl Response {
    fn new() -> Self {
        Self {
            kind: ResponseKind::Text,
            head: BytesMut::with_capacity(512),
            body: BytesMut::with_capacity(2048),
            file: None,
        }
    }

    fn clear(&mut self) {
        self.kind = ResponseKind::Text;
        self.head.clear();
        self.body.clear();
        // Dropping the handle closes the file descriptor.
        self.file = None;
    }

    /// File length for FILE responses, 0 otherwise.
    pub fn file_len(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.len)
    }
}

/// Per-connection HTTP state: the current response plus the close decision.
#[derive(Debug)]
pub struct HttpState {
    pub response: Response,
    /// Close the connection once the response is fully sent.
    pub should_close: bool,
}

impl Default for HttpState {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpState {
    pub fn new() -> Self {
        Self {
            response: Response::new(),
            should_close: false,
        }
    }

    /// Resets for the next request on a kept-alive connection.
    pub fn clear(&mut self) {
        self.response.clear();
        self.should_close = false;
    }

    /// Parses one raw request and builds the matching response.
    pub fn process(&mut self, raw: &[u8], root: &Path) {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(ParseError) => {
                self.build_error(400);
                return;
            }
        };

        match request.method {
            b"GET" => self.build_file(root, request.target, false),
            b"HEAD" => {
                self.build_file(root, request.target, true);
                // Even an error page is head-only for HEAD: the length is
                // advertised, the body withheld.
                self.response.kind = ResponseKind::HeadOnly;
            }
            b"OPTIONS" => self.build_options(),
            method => {
                debug!(method = %String::from_utf8_lossy(method), "method not allowed");
                self.build_error(405);
            }
        }

        // HTTP/1.0 peers get the response and then a close.
        if request.version_minor() == 0 {
            self.should_close = true;
        }
    }

    /// Builds the 500 response. Reached when the filesystem fails in a way
    /// that is not an absence (see `ResolveError::Io`), and available to
    /// callers that detect their own internal failures.
    pub fn set_internal_error(&mut self) {
        self.build_error(500);
    }

    fn build_file(&mut self, root: &Path, target: &[u8], head_only: bool) {
        let resolved = match path::resolve(root, target) {
            Ok(resolved) => resolved,
            Err(ResolveError::Io(e)) => {
                // Not an absence: the filesystem itself misbehaved.
                warn!(error = %e, "path resolution failed");
                self.set_internal_error();
                return;
            }
            Err(_) => {
                self.build_error(404);
                return;
            }
        };

        let file = match File::open(&resolved) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %resolved.display(), error = %e, "open failed");
                self.build_error(404);
                return;
            }
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %resolved.display(), error = %e, "stat failed");
                self.build_error(404);
                return;
            }
        };

        let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        let mime = mime::mime_for_path(&resolved.to_string_lossy());

        let head = format!(
            "HTTP/1.1 200 OK\r\n\
             Accept-Ranges: none\r\n\
             Cache-Control: public, max-age=86400\r\n\
             Connection: keep-alive\r\n\
             Content-Length: {}\r\n\
             Content-Type: {}\r\n\
             Date: {}\r\n\
             Last-Modified: {}\r\n\
             Server: {}\r\n\r\n",
            metadata.len(),
            mime,
            http_date(SystemTime::now()),
            http_date(modified),
            SERVER_NAME,
        );
        self.response.head.extend_from_slice(head.as_bytes());
        self.response.kind = if head_only {
            ResponseKind::HeadOnly
        } else {
            ResponseKind::File
        };
        if !head_only {
            self.response.file = Some(ResponseFile {
                file,
                len: metadata.len(),
            });
        }
    }

    fn build_options(&mut self) {
        let head = format!(
            "HTTP/1.1 204 No Content\r\n\
             Access-Control-Allow-Methods: GET, HEAD, OPTIONS\r\n\
             Allow: GET, HEAD, OPTIONS\r\n\
             Connection: keep-alive\r\n\
             Content-Length: 0\r\n\
             Date: {}\r\n\
             Server: {}\r\n\r\n",
            http_date(SystemTime::now()),
            SERVER_NAME,
        );
        self.response.head.extend_from_slice(head.as_bytes());
        self.response.kind = ResponseKind::HeadOnly;
    }

    fn build_error(&mut self, status: u16) {
        let (reason, html, close) = match status {
            400 => ("Bad Request", HTML_400, true),
            404 => ("Not Found", HTML_404, false),
            405 => ("Method Not Allowed", HTML_405, true),
            _ => ("Internal Server Error", HTML_500, true),
        };
        let connection = if close { "close" } else { "keep-alive" };

        let head = format!(
            "HTTP/1.1 {status} {reason}\r\n\
             Cache-Control: no-store, private\r\n\
             Connection: {connection}\r\n\
             Content-Length: {}\r\n\
             Content-Type: text/html; charset=UTF-8\r\n\
             Date: {}\r\n\
             Server: {}\r\n\r\n",
            html.len(),
            http_date(SystemTime::now()),
            SERVER_NAME,
        );
        self.response.head.extend_from_slice(head.as_bytes());
        self.response.body.extend_from_slice(html.as_bytes());
        self.response.kind = ResponseKind::Text;
        if close {
            self.should_close = true;
        }
    }
}

/// RFC 1123 date in GMT, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"hello").unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    fn head_str(state: &HttpState) -> String {
        String::from_utf8_lossy(&state.response.head).into_owned()
    }

    #[test]
    fn get_serves_file() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &root);

        let head = head_str(&state);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Accept-Ranges: none\r\n"));
        assert!(head.contains("Cache-Control: public, max-age=86400\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(state.response.kind, ResponseKind::File);
        assert_eq!(state.response.file_len(), 5);
        assert!(!state.should_close);
    }

    #[test]
    fn head_omits_body_keeps_head() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"HEAD /index.html HTTP/1.1\r\n\r\n", &root);

        assert_eq!(state.response.kind, ResponseKind::HeadOnly);
        assert!(state.response.file.is_none());
        let head = head_str(&state);
        assert!(head.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn head_of_missing_file_is_404_without_body() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"HEAD /missing.html HTTP/1.1\r\n\r\n", &root);

        let head = head_str(&state);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        // The length is advertised but the body is withheld.
        assert_eq!(state.response.kind, ResponseKind::HeadOnly);
        assert!(!state.response.body.is_empty());
    }

    #[test]
    fn options_is_204_with_allow() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"OPTIONS * HTTP/1.1\r\n\r\n", &root);

        let head = head_str(&state);
        assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(head.contains("Allow: GET, HEAD, OPTIONS\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert_eq!(state.response.kind, ResponseKind::HeadOnly);
        assert!(state.response.body.is_empty());
        assert!(!state.should_close);
    }

    #[test]
    fn unknown_method_is_405_close() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"DELETE / HTTP/1.1\r\n\r\n", &root);

        let head = head_str(&state);
        assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(state.should_close);
        assert_eq!(state.response.kind, ResponseKind::Text);
        assert!(!state.response.body.is_empty());
    }

    #[test]
    fn method_match_is_exact() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        // "GETX" must not be treated as GET.
        state.process(b"GETX / HTTP/1.1\r\n\r\n", &root);
        assert!(head_str(&state).starts_with("HTTP/1.1 405"));
    }

    #[test]
    fn parse_failure_is_400_close() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"garbage", &root);

        let head = head_str(&state);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(state.should_close);
    }

    #[test]
    fn traversal_is_404_keepalive() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"GET /../etc/passwd HTTP/1.1\r\n\r\n", &root);

        let head = head_str(&state);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(!state.should_close);
        let body = String::from_utf8_lossy(&state.response.body);
        assert!(body.contains("Not found"));
    }

    #[test]
    fn http10_closes_after_response() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"GET / HTTP/1.0\r\n\r\n", &root);
        assert!(head_str(&state).starts_with("HTTP/1.1 200"));
        assert!(state.should_close);
    }

    #[test]
    fn internal_error_is_500_close() {
        let mut state = HttpState::new();
        state.set_internal_error();
        let head = head_str(&state);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(state.should_close);
    }

    #[test]
    fn clear_resets_everything() {
        let (_dir, root) = fixture();
        let mut state = HttpState::new();
        state.process(b"GET / HTTP/1.1\r\n\r\n", &root);
        assert!(state.response.file.is_some());

        state.clear();
        assert!(state.response.head.is_empty());
        assert!(state.response.body.is_empty());
        assert!(state.response.file.is_none());
        assert!(!state.should_close);
        assert_eq!(state.response.kind, ResponseKind::Text);
    }

    #[test]
    fn date_is_rfc1123_gmt() {
        let time = UNIX_EPOCH + Duration::from_secs(784_111_777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
