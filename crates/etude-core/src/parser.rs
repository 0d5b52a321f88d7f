// src/parser.rs
//
// Resumable byte-level HTTP/1.1 request parser. Two levels: a line
// scanner that finds CRLF terminators, and a main state machine that
// walks REQUEST_LINE -> HEADERS -> BODY as complete lines appear.
//
// Parsed fields are offset/length pairs into the connection's read
// buffer; no second allocation is made. They stay valid until the buffer
// is reset for the next request.
use std::ops::Range;

use memchr::{memchr, memchr2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    /// Terminator found, cursor advanced past it.
    Ok,
    /// Buffer exhausted mid-line; wait for more bytes.
    Open,
    /// Malformed terminator.
    Bad,
}

/// Terminal result of driving the parser over the bytes read so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Need more I/O before a verdict.
    NoRequest,
    /// A full, well-formed request is buffered.
    Complete,
    /// The request is malformed.
    BadRequest,
}

#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    /// Bytes already scanned; only ever moves forward.
    cursor: usize,
    /// Start of the current (possibly unterminated) line.
    line_start: usize,
    /// First body byte, valid once the header block ended.
    body_start: usize,
    target: Range<usize>,
    host: Range<usize>,
    content_length: usize,
    keep_alive: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            state: ParseState::RequestLine,
            cursor: 0,
            line_start: 0,
            body_start: 0,
            target: 0..0,
            host: 0..0,
            content_length: 0,
            keep_alive: false,
        }
    }

    pub fn reset(&mut self) {
        *self = RequestParser::new();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Whether the client asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Request target, valid only while the buffer is untouched.
    pub fn target<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.target.clone()]
    }

    /// Host header value, empty if the client sent none.
    pub fn host<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.host.clone()]
    }

    /// Bytes of the buffer consumed by the completed request. Anything
    /// past this offset belongs to a pipelined follow-up request.
    pub fn consumed(&self) -> usize {
        match self.state {
            ParseState::Body => self.body_start + self.content_length,
            _ => self.cursor,
        }
    }

    /// Scan `buf[cursor..read_len)` for a CRLF, rewriting it in place to
    /// two NUL bytes so the line reads as a bounded string. On `Open` the
    /// cursor stays at the last fully-scanned position, so no byte is
    /// rescanned when more data arrives.
    fn parse_line(&mut self, buf: &mut [u8], read_len: usize) -> LineStatus {
        if self.cursor >= read_len {
            return LineStatus::Open;
        }
        match memchr2(b'\r', b'\n', &buf[self.cursor..read_len]) {
            None => {
                self.cursor = read_len;
                LineStatus::Open
            }
            Some(off) => {
                let at = self.cursor + off;
                if buf[at] == b'\n' {
                    // A CRLF pair is always consumed in one step, so a
                    // newline found by the scan has no preceding \r.
                    return LineStatus::Bad;
                }
                if at + 1 == read_len {
                    self.cursor = at;
                    return LineStatus::Open;
                }
                if buf[at + 1] != b'\n' {
                    return LineStatus::Bad;
                }
                buf[at] = 0;
                buf[at + 1] = 0;
                self.cursor = at + 2;
                LineStatus::Ok
            }
        }
    }

    /// Drive the state machine as far as the buffered bytes allow.
    pub fn advance(&mut self, buf: &mut [u8], read_len: usize) -> ParseOutcome {
        loop {
            if self.state == ParseState::Body {
                // The body is not interpreted, only counted.
                if read_len - self.body_start >= self.content_length {
                    return ParseOutcome::Complete;
                }
                return ParseOutcome::NoRequest;
            }

            let start = self.cursor;
            match self.parse_line(buf, read_len) {
                LineStatus::Open => return ParseOutcome::NoRequest,
                LineStatus::Bad => return ParseOutcome::BadRequest,
                LineStatus::Ok => {
                    self.line_start = start;
                    let end = self.cursor - 2;
                    match self.state {
                        ParseState::RequestLine => {
                            if !self.parse_request_line(buf, start, end) {
                                return ParseOutcome::BadRequest;
                            }
                            self.state = ParseState::Headers;
                        }
                        ParseState::Headers => {
                            if start == end {
                                // Blank line ends the header block.
                                if self.content_length != 0 {
                                    self.state = ParseState::Body;
                                    self.body_start = self.cursor;
                                } else {
                                    return ParseOutcome::Complete;
                                }
                            } else {
                                self.parse_header(buf, start, end);
                            }
                        }
                        ParseState::Body => unreachable!("body bytes are not line-scanned"),
                    }
                }
            }
        }
    }

    /// `GET /index.html HTTP/1.1`, with the absolute-URI form accepted.
    fn parse_request_line(&mut self, buf: &[u8], start: usize, end: usize) -> bool {
        let line = &buf[start..end];
        let mut parts = line
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|t| !t.is_empty());

        let method = match parts.next() {
            Some(m) => m,
            None => return false,
        };
        let target = match parts.next() {
            Some(t) => t,
            None => return false,
        };
        let version = match parts.next() {
            Some(v) => v,
            None => return false,
        };

        if !method.eq_ignore_ascii_case(b"GET") {
            return false;
        }
        if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
            return false;
        }

        // http://host[:port]/path -> /path
        let mut t = target;
        if t.len() >= 7 && t[..7].eq_ignore_ascii_case(b"http://") {
            t = &t[7..];
            match memchr(b'/', t) {
                Some(i) => t = &t[i..],
                None => return false,
            }
        }
        if t.first() != Some(&b'/') {
            return false;
        }

        let off = t.as_ptr() as usize - buf.as_ptr() as usize;
        self.target = off..off + t.len();
        true
    }

    /// One header line. Only `Connection`, `Content-Length` and `Host`
    /// are recognized; everything else is ignored.
    fn parse_header(&mut self, buf: &[u8], start: usize, end: usize) {
        let line = &buf[start..end];
        let colon = match memchr(b':', line) {
            Some(c) => c,
            None => {
                tracing::trace!("ignoring header line without a colon");
                return;
            }
        };

        let name = &line[..colon];
        let mut v = colon + 1;
        while v < line.len() && (line[v] == b' ' || line[v] == b'\t') {
            v += 1;
        }
        let value = &line[v..];

        if name.eq_ignore_ascii_case(b"Connection") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case(b"Content-Length") {
            self.content_length = parse_decimal_prefix(value);
        } else if name.eq_ignore_ascii_case(b"Host") {
            self.host = (start + v)..(start + v + value.len());
        } else {
            tracing::trace!(
                header = %String::from_utf8_lossy(name),
                "ignoring unrecognized header"
            );
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Leading-digits decimal parse: stops at the first non-digit, 0 if none.
fn parse_decimal_prefix(bytes: &[u8]) -> usize {
    let mut n: usize = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(raw: &[u8]) -> (RequestParser, Vec<u8>, ParseOutcome) {
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();
        let len = buf.len();
        let outcome = parser.advance(&mut buf, len);
        (parser, buf, outcome)
    }

    #[test]
    fn parses_simple_get() {
        let (parser, buf, outcome) =
            parse_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.target(&buf), b"/index.html");
        assert_eq!(parser.host(&buf), b"x");
        assert!(parser.keep_alive());
        assert_eq!(parser.content_length(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_all_at_once() {
        let raw = b"GET /a/b.html HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";
        let (whole, whole_buf, whole_outcome) = parse_all(raw);
        assert_eq!(whole_outcome, ParseOutcome::Complete);

        let mut buf = vec![0u8; raw.len()];
        let mut parser = RequestParser::new();
        let mut outcome = ParseOutcome::NoRequest;
        for n in 1..=raw.len() {
            buf[n - 1] = raw[n - 1];
            outcome = parser.advance(&mut buf, n);
            if n < raw.len() {
                assert_eq!(outcome, ParseOutcome::NoRequest, "early verdict at byte {n}");
            }
        }
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.target(&buf), whole.target(&whole_buf));
        assert_eq!(parser.host(&buf), whole.host(&whole_buf));
        assert_eq!(parser.keep_alive(), whole.keep_alive());
        assert_eq!(parser.consumed(), whole.consumed());
    }

    #[test]
    fn scanner_never_rescans_a_consumed_line() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();
        let len = buf.len();
        assert_eq!(parser.advance(&mut buf, len), ParseOutcome::Complete);
        let consumed = parser.consumed();
        // No new bytes: the verdict must not change, nor the cursor move.
        assert_eq!(parser.advance(&mut buf, len), ParseOutcome::NoRequest);
        assert_eq!(parser.consumed(), consumed);
    }

    #[test]
    fn crlf_split_across_reads() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let split = raw.iter().position(|&b| b == b'\n').unwrap(); // between \r and \n
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();
        assert_eq!(parser.advance(&mut buf, split), ParseOutcome::NoRequest);
        let len = buf.len();
        assert_eq!(parser.advance(&mut buf, len), ParseOutcome::Complete);
    }

    #[test]
    fn lone_newline_is_rejected() {
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\nHost: x\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::BadRequest);
    }

    #[test]
    fn stray_carriage_return_is_rejected() {
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.1\rXHost: x\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::BadRequest);
    }

    #[test]
    fn method_and_version_match_case_insensitively() {
        let (_, _, outcome) = parse_all(b"get / http/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
    }

    #[test]
    fn non_get_method_is_rejected() {
        let (_, _, outcome) = parse_all(b"POST / HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::BadRequest);
    }

    #[test]
    fn http_1_0_is_rejected() {
        let (_, _, outcome) = parse_all(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::BadRequest);
    }

    #[test]
    fn absolute_uri_is_stripped_to_path() {
        let (parser, buf, outcome) =
            parse_all(b"GET http://example.com:8080/idx.html HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.target(&buf), b"/idx.html");
    }

    #[test]
    fn absolute_uri_without_path_is_rejected() {
        let (_, _, outcome) = parse_all(b"GET http://example.com HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::BadRequest);
    }

    #[test]
    fn relative_target_without_slash_is_rejected() {
        let (_, _, outcome) = parse_all(b"GET index.html HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::BadRequest);
    }

    #[test]
    fn body_completes_only_when_fully_buffered() {
        let head = b"GET /u HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let raw = b"GET /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();
        assert_eq!(parser.advance(&mut buf, head.len()), ParseOutcome::NoRequest);
        assert_eq!(parser.state(), ParseState::Body);
        assert_eq!(
            parser.advance(&mut buf, head.len() + 3),
            ParseOutcome::NoRequest
        );
        let len = buf.len();
        assert_eq!(parser.advance(&mut buf, len), ParseOutcome::Complete);
        assert_eq!(parser.consumed(), raw.len());
    }

    #[test]
    fn unrecognized_headers_are_ignored() {
        let (parser, buf, outcome) = parse_all(
            b"GET / HTTP/1.1\r\nAccept: */*\r\nX-Custom: yes\r\nHost: h\r\n\r\n",
        );
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.host(&buf), b"h");
    }

    #[test]
    fn content_length_takes_leading_digits_only() {
        assert_eq!(parse_decimal_prefix(b"42"), 42);
        assert_eq!(parse_decimal_prefix(b"42xyz"), 42);
        assert_eq!(parse_decimal_prefix(b"xyz"), 0);
        assert_eq!(parse_decimal_prefix(b""), 0);
    }

    #[test]
    fn connection_close_does_not_set_keep_alive() {
        let (parser, _, outcome) = parse_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert!(!parser.keep_alive());
    }

    #[test]
    fn header_value_whitespace_is_trimmed() {
        let (parser, buf, outcome) = parse_all(b"GET / HTTP/1.1\r\nHost: \t  spaced.example\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.host(&buf), b"spaced.example");
    }

    #[test]
    fn reset_restores_initial_state() {
        let raw = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let mut buf = raw.to_vec();
        let mut parser = RequestParser::new();
        let len = buf.len();
        assert_eq!(parser.advance(&mut buf, len), ParseOutcome::Complete);
        parser.reset();
        assert_eq!(parser.state(), ParseState::RequestLine);
        assert_eq!(parser.consumed(), 0);
        assert!(!parser.keep_alive());
    }
}
