// src/conn.rs
//
// Per-socket state: read/write buffers, the request parser, response
// construction and the send bookkeeping for scatter-gather transmits.
//
// Raw socket I/O on a connection happens only on the reactor thread;
// pool workers touch nothing but the in-memory buffers and derived
// fields. One-shot epoll re-arming keeps the two from ever running
// concurrently on the same connection.
use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::time::SystemTime;

use crate::docroot::{DocRoot, FileMeta, Lookup, Mapping};
use crate::parser::{ParseOutcome, RequestParser};
use crate::stats::ServerStats;
use crate::syscalls;
use crate::timer::NO_TIMER;

const OK_200_TITLE: &str = "OK";
const ERROR_400_TITLE: &str = "Bad Request";
const ERROR_400_FORM: &str = "Your request has bad syntax or is inherently impossible to satisfy.\n";
const ERROR_403_TITLE: &str = "Forbidden";
const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
const ERROR_404_TITLE: &str = "Not Found";
const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_TITLE: &str = "Internal Error";
const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";

/// Classified result of parsing plus resource resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Need more I/O before a verdict.
    NoRequest,
    /// A servable file was resolved.
    FileRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    InternalError,
}

/// What the pool worker asks the reactor to wait for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    NeedRead,
    NeedWrite,
}

/// Result of one reactor-side transmit pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Kernel send buffer full; re-arm for write and resume later.
    Blocked,
    /// Response fully sent, connection stays open for the next request.
    KeepAlive,
    /// Response fully sent, connection is done.
    Finished,
    /// Send failed; caller closes immediately.
    Error,
}

pub struct Conn {
    pub fd: i32,
    pub peer: SocketAddr,
    /// Slot in the reactor's connection table; doubles as epoll token.
    pub token: usize,
    /// Slot in the reactor's timer list.
    pub timer: usize,

    read_buf: Box<[u8]>,
    read_len: usize,
    parser: RequestParser,

    write_buf: Box<[u8]>,
    write_len: usize,

    outcome: HttpCode,
    resolved: Option<FileMeta>,
    mapping: Option<Mapping>,
    /// Response construction failed; the reactor closes on the next
    /// writable event instead of sending.
    pub respond_failed: bool,
    /// Connection survives this response (keep-alive).
    linger: bool,

    bytes_pending: usize,
    bytes_sent: usize,
    /// Unsent remainder of the header part, offsets into `write_buf`.
    hdr_rest: Range<usize>,
    /// Unsent remainder of the file part, offsets into the mapping.
    file_rest: Range<usize>,
}

impl Conn {
    pub fn new(fd: i32, peer: SocketAddr, token: usize, read_cap: usize, write_cap: usize) -> Self {
        Self {
            fd,
            peer,
            token,
            timer: NO_TIMER,
            read_buf: vec![0u8; read_cap].into_boxed_slice(),
            read_len: 0,
            parser: RequestParser::new(),
            write_buf: vec![0u8; write_cap].into_boxed_slice(),
            write_len: 0,
            outcome: HttpCode::NoRequest,
            resolved: None,
            mapping: None,
            respond_failed: false,
            linger: false,
            bytes_pending: 0,
            bytes_sent: 0,
            hdr_rest: 0..0,
            file_rest: 0..0,
        }
    }

    /// Drain the socket until the receive would block, the peer closes,
    /// or the buffer is full. Does not parse. Returns false on failure;
    /// the caller closes the connection.
    pub fn read(&mut self) -> bool {
        if self.read_len >= self.read_buf.len() {
            // A request that fills the buffer without completing is dropped.
            return false;
        }

        loop {
            match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_len..]) {
                Ok(0) => return false, // peer closed its write end
                Ok(n) => {
                    self.read_len += n;
                    if self.read_len == self.read_buf.len() {
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// Pool-worker entry point: parse what is buffered and, if a verdict
    /// was reached, build the response. The reactor performs the actual
    /// transmission once the socket turns writable.
    pub fn process(&mut self, docroot: &DocRoot, stats: &ServerStats) -> ProcessOutcome {
        let code = self.process_read(docroot, stats);
        if code == HttpCode::NoRequest {
            return ProcessOutcome::NeedRead;
        }
        if !self.process_write(code) {
            self.respond_failed = true;
        }
        ProcessOutcome::NeedWrite
    }

    fn process_read(&mut self, docroot: &DocRoot, stats: &ServerStats) -> HttpCode {
        match self.parser.advance(&mut self.read_buf, self.read_len) {
            ParseOutcome::NoRequest => HttpCode::NoRequest,
            ParseOutcome::BadRequest => HttpCode::BadRequest,
            ParseOutcome::Complete => {
                stats.inc_req();
                self.do_request(docroot)
            }
        }
    }

    /// Resolve the parsed target under the document root. Only metadata
    /// is gathered here; the mapping itself is created by the reactor
    /// right before the first send.
    fn do_request(&mut self, docroot: &DocRoot) -> HttpCode {
        let target = self.parser.target(&self.read_buf);
        match docroot.resolve(target) {
            Lookup::File(meta) => {
                self.resolved = Some(meta);
                HttpCode::FileRequest
            }
            Lookup::NotFound => HttpCode::NoResource,
            Lookup::Forbidden => HttpCode::ForbiddenRequest,
            Lookup::Directory | Lookup::Invalid => HttpCode::BadRequest,
        }
    }

    /// Build the response headers (and error body) into `write_buf` and
    /// set up the scatter-gather accounting.
    fn process_write(&mut self, code: HttpCode) -> bool {
        self.outcome = code;
        // Errors always close after the response is sent.
        self.linger = self.parser.keep_alive() && code == HttpCode::FileRequest;

        let ok = match code {
            HttpCode::FileRequest => {
                let len = self.resolved.as_ref().map(|m| m.len).unwrap_or(0) as usize;
                self.add_status_line(200, OK_200_TITLE) && self.add_headers(len)
            }
            HttpCode::BadRequest => self.error_response(400, ERROR_400_TITLE, ERROR_400_FORM),
            HttpCode::ForbiddenRequest => self.error_response(403, ERROR_403_TITLE, ERROR_403_FORM),
            HttpCode::NoResource => self.error_response(404, ERROR_404_TITLE, ERROR_404_FORM),
            HttpCode::InternalError => self.error_response(500, ERROR_500_TITLE, ERROR_500_FORM),
            HttpCode::NoRequest => return false,
        };
        if !ok {
            return false;
        }

        let file_len = if code == HttpCode::FileRequest {
            self.resolved.as_ref().map(|m| m.len as usize).unwrap_or(0)
        } else {
            0
        };
        self.hdr_rest = 0..self.write_len;
        self.file_rest = 0..file_len;
        self.bytes_pending = self.write_len + file_len;
        self.bytes_sent = 0;
        true
    }

    fn error_response(&mut self, status: u16, title: &str, body: &str) -> bool {
        self.add_status_line(status, title)
            && self.add_headers(body.len())
            && self.push_bytes(body.as_bytes())
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.push_bytes(b"HTTP/1.1 ")
            && self.push_usize(status as usize)
            && self.push_bytes(b" ")
            && self.push_bytes(title.as_bytes())
            && self.push_bytes(b"\r\n")
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        let connection: &[u8] = if self.linger {
            b"Connection: keep-alive\r\n"
        } else {
            b"Connection: close\r\n"
        };
        self.push_bytes(b"Content-Length: ")
            && self.push_usize(content_len)
            && self.push_bytes(b"\r\n")
            && self.push_bytes(b"Content-Type: text/html\r\n")
            && self.add_date()
            && self.push_bytes(connection)
            && self.push_bytes(b"\r\n")
    }

    fn add_date(&mut self) -> bool {
        let date = httpdate::fmt_http_date(SystemTime::now());
        self.push_bytes(b"Date: ") && self.push_bytes(date.as_bytes()) && self.push_bytes(b"\r\n")
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> bool {
        let end = self.write_len + bytes.len();
        if end > self.write_buf.len() {
            return false;
        }
        self.write_buf[self.write_len..end].copy_from_slice(bytes);
        self.write_len = end;
        true
    }

    fn push_usize(&mut self, mut n: usize) -> bool {
        let mut digits = [0u8; 20];
        let mut i = 0;
        if n == 0 {
            digits[0] = b'0';
            i = 1;
        } else {
            while n > 0 {
                digits[i] = b'0' + (n % 10) as u8;
                n /= 10;
                i += 1;
            }
            digits[..i].reverse();
        }
        self.push_bytes(&digits[..i])
    }

    /// The reactor attaches the file mapping lazily, on the first
    /// writable event of a file response.
    pub fn needs_mapping(&self) -> bool {
        self.outcome == HttpCode::FileRequest
            && self.mapping.is_none()
            && !self.file_rest.is_empty()
    }

    pub fn resolved(&self) -> Option<&FileMeta> {
        self.resolved.as_ref()
    }

    pub fn attach_mapping(&mut self, mapping: Mapping) {
        self.mapping = Some(mapping);
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Reactor-context scatter-gather transmit of whatever is pending.
    /// Partial sends shrink the header descriptor in place, then walk the
    /// second descriptor through the mapped file.
    pub fn send(&mut self) -> SendStatus {
        if self.bytes_pending == 0 {
            // Nothing to transmit: ready for the next request.
            return SendStatus::KeepAlive;
        }

        loop {
            let wrote = {
                let header = &self.write_buf[self.hdr_rest.clone()];
                let file: &[u8] = match self.mapping.as_ref() {
                    Some(m) => &m.as_slice()[self.file_rest.clone()],
                    None => &[],
                };
                syscalls::sendv_nonblocking(self.fd, &[header, file])
            };

            match wrote {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return SendStatus::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.mapping = None;
                    return SendStatus::Error;
                }
                Ok(0) => return SendStatus::Blocked,
                Ok(n) => {
                    self.bytes_sent += n;
                    self.bytes_pending -= n;

                    if self.bytes_sent >= self.write_len {
                        // Header fully out; point the second descriptor at
                        // the unsent tail of the file.
                        self.hdr_rest = self.write_len..self.write_len;
                        let file_off = self.bytes_sent - self.write_len;
                        self.file_rest = file_off..file_off + self.bytes_pending;
                    } else {
                        self.hdr_rest = self.bytes_sent..self.write_len;
                    }

                    if self.bytes_pending == 0 {
                        self.mapping = None; // release as soon as the file is out
                        return if self.linger {
                            SendStatus::KeepAlive
                        } else {
                            SendStatus::Finished
                        };
                    }
                }
            }
        }
    }

    /// Reset for the next request on this socket, preserving any
    /// pipelined bytes that arrived behind the completed request.
    /// Returns true when such residual bytes exist.
    pub fn reset(&mut self) -> bool {
        let consumed = self.parser.consumed().min(self.read_len);
        let residual = self.read_len - consumed;
        if residual > 0 {
            self.read_buf.copy_within(consumed..self.read_len, 0);
        }
        self.read_len = residual;
        self.parser.reset();
        self.write_len = 0;
        self.outcome = HttpCode::NoRequest;
        self.resolved = None;
        self.mapping = None;
        self.respond_failed = false;
        self.linger = false;
        self.bytes_pending = 0;
        self.bytes_sent = 0;
        self.hdr_rest = 0..0;
        self.file_rest = 0..0;
        residual > 0
    }

    /// Close the socket and release the mapping. Safe to call twice.
    pub fn close_socket(&mut self) {
        self.mapping = None;
        if self.fd >= 0 {
            syscalls::close_fd(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close_socket();
    }
}
