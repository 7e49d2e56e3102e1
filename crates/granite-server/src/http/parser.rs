//! Zero-copy HTTP/1.x request parser.
//!
//! The parser scans a contiguous request buffer once and returns slices
//! into it; nothing is allocated or copied. Field boundaries are the
//! delimiter set {space, CR, LF, NUL}: enough to carve out the request
//! line, the headers, and the body for a static-file server. Methods and
//! URI syntax are not validated here.

use thiserror::Error;

/// Upper bound on stored headers. Further headers are consumed but dropped.
pub const MAX_HEADERS: usize = 128;

/// Parse failure: the request line delimiters were not where they must be.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed request line")]
pub struct ParseError;

/// One header as slices into the request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
}

/// A parsed request. All slices borrow from the input buffer and are valid
/// only until it is overwritten.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: &'a [u8],
    pub target: &'a [u8],
    pub version: &'a [u8],
    headers: [Header<'a>; MAX_HEADERS],
    header_count: usize,
    pub body: Option<&'a [u8]>,
}

const fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b' ' | b'\r' | b'\n' | b'\0')
}

impl<'a> Request<'a> {
    /// Parses `input`. Fails if the method or target is not terminated by a
    /// space.
    pub fn parse(input: &'a [u8]) -> Result<Self, ParseError> {
        let len = input.len();
        let mut cursor = 0usize;

        // Method.
        let start = cursor;
        while cursor < len && !is_delimiter(input[cursor]) {
            cursor += 1;
        }
        if cursor >= len || input[cursor] != b' ' {
            return Err(ParseError);
        }
        let method = &input[start..cursor];

        // Target.
        cursor += 1;
        let start = cursor;
        while cursor < len && !is_delimiter(input[cursor]) {
            cursor += 1;
        }
        if cursor >= len || input[cursor] != b' ' {
            return Err(ParseError);
        }
        let target = &input[start..cursor];

        // Version: runs to the next delimiter, no terminator required.
        cursor += 1;
        let start = cursor;
        while cursor < len && !is_delimiter(input[cursor]) {
            cursor += 1;
        }
        let version = &input[start..cursor];

        // Headers.
        const EMPTY: Header<'static> = Header {
            name: &[],
            value: &[],
        };
        let mut headers: [Header<'a>; MAX_HEADERS] = [EMPTY; MAX_HEADERS];
        let mut header_count = 0usize;

        loop {
            if cursor >= len || input[cursor] == b'\0' {
                break;
            }

            // Advance past the line terminator of the previous line.
            while cursor < len && !matches!(input[cursor], b'\n' | b'\0') {
                cursor += 1;
            }
            if cursor >= len || input[cursor] == b'\0' {
                break;
            }
            cursor += 1;

            // Header name, up to the colon. A line without one is the blank
            // line ending the header section.
            let start = cursor;
            while cursor < len && !matches!(input[cursor], b':' | b'\n' | b'\0') {
                cursor += 1;
            }
            if cursor >= len || input[cursor] != b':' {
                break;
            }
            let name = &input[start..cursor];

            // Skip the colon and any leading spaces.
            cursor += 1;
            while cursor < len && input[cursor] == b' ' {
                cursor += 1;
            }
            if cursor >= len || input[cursor] == b'\0' {
                break;
            }

            let start = cursor;
            while cursor < len && !matches!(input[cursor], b'\r' | b'\n' | b'\0') {
                cursor += 1;
            }
            let value = &input[start..cursor];

            if header_count < MAX_HEADERS {
                headers[header_count] = Header { name, value };
                header_count += 1;
            }
        }

        // Body: whatever follows the terminating blank line.
        cursor += 1;
        let body = if cursor < len {
            Some(&input[cursor..])
        } else {
            None
        };

        Ok(Self {
            method,
            target,
            version,
            headers,
            header_count,
            body,
        })
    }

    /// Stored headers in request order.
    pub fn headers(&self) -> &[Header<'a>] {
        &self.headers[..self.header_count]
    }

    /// Looks up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers()
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| h.value)
    }

    /// Resolves the HTTP/1.x minor version.
    ///
    /// Anything other than a literal `HTTP/1.1` resolves to 0, so unknown
    /// or damaged version fields behave like HTTP/1.0 (close after the
    /// response).
    pub fn version_minor(&self) -> u8 {
        if self.version.len() < 8 || &self.version[..7] != b"HTTP/1." {
            return 0;
        }
        u8::from(self.version[7] == b'1')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn well_formed_request_roundtrip() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.method, b"GET");
        assert_eq!(req.target, b"/index.html");
        assert_eq!(req.version, b"HTTP/1.1");
        assert_eq!(req.headers().len(), 2);
        assert_eq!(req.headers()[0].name, b"Host");
        assert_eq!(req.headers()[0].value, b"example.com");
        assert_eq!(req.headers()[1].name, b"Accept");
        assert_eq!(req.headers()[1].value, b"*/*");
        assert!(req.body.is_none());
    }

    #[test]
    fn body_length_matches_payload() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.body, Some(&b"hello"[..]));
    }

    #[test]
    fn no_headers_no_body() {
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.method, b"GET");
        assert_eq!(req.target, b"/");
        assert!(req.headers().is_empty());
        assert!(req.body.is_none());
    }

    #[test]
    fn missing_space_after_method_rejected() {
        assert!(Request::parse(b"GET\r\n\r\n").is_err());
        assert!(Request::parse(b"GET/index HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn missing_space_after_target_rejected() {
        assert!(Request::parse(b"GET /index.html\r\n\r\n").is_err());
        assert!(Request::parse(b"GET /index.html").is_err());
    }

    #[test]
    fn empty_input_rejected() {
        assert!(Request::parse(b"").is_err());
    }

    #[test]
    fn header_value_leading_spaces_skipped() {
        let raw = b"GET / HTTP/1.1\r\nHost:    spaced.example\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.headers()[0].value, b"spaced.example");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nCoNnEcTiOn: keep-alive\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.header("connection"), Some(&b"keep-alive"[..]));
        assert_eq!(req.header("x-missing"), None);
    }

    #[test]
    fn excess_headers_consumed_but_dropped() {
        let mut raw = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        for i in 0..MAX_HEADERS + 10 {
            raw.extend_from_slice(format!("X-H{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\nBODY");
        let req = Request::parse(&raw).unwrap();
        assert_eq!(req.headers().len(), MAX_HEADERS);
        assert_eq!(req.body, Some(&b"BODY"[..]));
    }

    #[test]
    fn bare_lf_line_endings_tolerated() {
        let raw = b"GET / HTTP/1.1\nHost: x\n\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.headers()[0].name, b"Host");
    }

    #[test]
    fn version_minor_resolution() {
        let req = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.version_minor(), 1);
        let req = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.version_minor(), 0);
        let req = Request::parse(b"GET / FTP/9\r\n\r\n").unwrap();
        assert_eq!(req.version_minor(), 0);
    }

    proptest! {
        // A method token never followed by a space must be rejected,
        // whatever else the buffer holds.
        #[test]
        fn method_without_space_always_rejected(
            method in "[A-Z]{1,10}",
            tail in "[\r\n]{0,4}"
        ) {
            let raw = format!("{method}{tail}");
            prop_assert!(Request::parse(raw.as_bytes()).is_err());
        }

        // Arbitrary bytes either parse or error; the parser must not panic.
        #[test]
        fn arbitrary_input_never_panics(input in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = Request::parse(&input);
        }

        // Round-trip over the canonical shape:
        // M SP T SP V CRLF (H ": " V CRLF)* CRLF B
        #[test]
        fn canonical_shape_roundtrip(
            method in "[A-Z]{1,8}",
            target in "/[a-z0-9./]{0,24}",
            body in proptest::collection::vec(1u8..=255, 0..64)
        ) {
            let mut raw = format!("{method} {target} HTTP/1.1\r\nHost: t\r\n\r\n").into_bytes();
            raw.extend_from_slice(&body);
            let req = Request::parse(&raw).unwrap();
            prop_assert_eq!(req.method, method.as_bytes());
            prop_assert_eq!(req.target, target.as_bytes());
            let got_body = req.body.unwrap_or(&[]);
            prop_assert_eq!(got_body.len(), body.len());
            prop_assert_eq!(got_body, &body[..]);
        }
    }
}
