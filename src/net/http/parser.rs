//! Incremental HTTP/1.1 parsing.
//!
//! The parsers here are pure state machines over a byte stream: sessions
//! feed whatever the socket produced and collect complete messages. No
//! assumption is made about how bytes are split across feeds; the decoded
//! result is identical for every split of the same stream.

use crate::errors::ProtocolError;
use crate::utils::ByteBuffer;

use super::types::{Headers, HttpRequest, HttpResponse, Method};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Guard against unbounded header accumulation from a misbehaving peer.
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Where the body length comes from, per RFC 7230 §3.3.
#[derive(Debug)]
enum BodyKind {
    None,
    Fixed(usize),
    Chunked(ChunkedDecoder),
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// Feed arbitrary byte slices; the decoder consumes what it can and
/// appends decoded payload to `out`. `done` flips when the terminating
/// `0 CRLF CRLF` has been seen.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    out: Vec<u8>,
    done: bool,
}

#[derive(Debug)]
enum ChunkState {
    /// Accumulating the hex size line up to CRLF.
    Size(Vec<u8>),
    /// Reading `remaining` payload bytes.
    Data { remaining: usize },
    /// Expecting the CRLF that closes a chunk's payload.
    DataCrlf { seen_cr: bool },
    /// After the zero chunk: optional trailer lines until a blank line.
    Trailer(Vec<u8>),
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size(Vec::new()),
            out: Vec::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume as much of `input` as possible; returns the number of bytes
    /// consumed. Unparseable hex sizes and oversized bodies are protocol
    /// errors, fatal for the connection.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, ProtocolError> {
        let mut pos = 0;
        while pos < input.len() && !self.done {
            match &mut self.state {
                ChunkState::Size(line) => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == b'\n' {
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        let size = parse_chunk_size(line)?;
                        self.state = if size == 0 {
                            ChunkState::Trailer(Vec::new())
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    } else {
                        if line.len() > 32 {
                            return Err(ProtocolError::Http("chunk size line too long".into()));
                        }
                        line.push(byte);
                    }
                }
                ChunkState::Data { remaining } => {
                    let take = (*remaining).min(input.len() - pos);
                    self.out.extend_from_slice(&input[pos..pos + take]);
                    if self.out.len() > MAX_BODY_BYTES {
                        return Err(ProtocolError::Http("chunked body too large".into()));
                    }
                    pos += take;
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = ChunkState::DataCrlf { seen_cr: false };
                    }
                }
                ChunkState::DataCrlf { seen_cr } => {
                    let byte = input[pos];
                    pos += 1;
                    match (byte, *seen_cr) {
                        (b'\r', false) => *seen_cr = true,
                        (b'\n', true) => self.state = ChunkState::Size(Vec::new()),
                        _ => {
                            return Err(ProtocolError::Http(
                                "chunk payload not terminated by CRLF".into(),
                            ));
                        }
                    }
                }
                ChunkState::Trailer(line) => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == b'\n' {
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        if line.is_empty() {
                            self.done = true;
                        } else {
                            // Trailer headers are tolerated and discarded.
                            line.clear();
                        }
                    } else {
                        line.push(byte);
                    }
                }
            }
        }
        Ok(pos)
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ProtocolError> {
    // Chunk extensions (";ext=val") are tolerated and ignored.
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::Http("chunk size is not ASCII".into()))?;
    let hex = text.split(';').next().unwrap_or("").trim();
    if hex.is_empty() {
        return Err(ProtocolError::Http("empty chunk size".into()));
    }
    usize::from_str_radix(hex, 16)
        .map_err(|_| ProtocolError::Http(format!("unparseable chunk size {hex:?}")))
}

/// Shared header-block parsing: start line plus header lines.
fn parse_header_block(block: &[u8]) -> Result<(String, Headers), ProtocolError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| ProtocolError::Http("header block is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| ProtocolError::Http("missing start line".into()))?
        .to_string();
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Http(format!("malformed header line {line:?}")))?;
        headers.insert(name.trim(), value.trim_start());
    }
    Ok((start_line, headers))
}

fn body_kind(headers: &Headers) -> Result<BodyKind, ProtocolError> {
    if headers.contains_token("Transfer-Encoding", "chunked") {
        return Ok(BodyKind::Chunked(ChunkedDecoder::new()));
    }
    match headers.get("Content-Length") {
        None => Ok(BodyKind::None),
        Some(v) => {
            let n: usize = v
                .trim()
                .parse()
                .map_err(|_| ProtocolError::Http(format!("bad Content-Length {v:?}")))?;
            if n > MAX_BODY_BYTES {
                return Err(ProtocolError::Http("declared body too large".into()));
            }
            if n == 0 {
                Ok(BodyKind::None)
            } else {
                Ok(BodyKind::Fixed(n))
            }
        }
    }
}

enum ParsePhase {
    Headers,
    Body(BodyKind),
}

/// Incremental parser for requests arriving on a server connection.
pub struct RequestParser {
    buffer: ByteBuffer,
    phase: ParsePhase,
    pending: Option<HttpRequest>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buffer: ByteBuffer::new(),
            phase: ParsePhase::Headers,
            pending: None,
        }
    }

    /// Bytes received after the last complete message; handed to the
    /// WebSocket frame decoder when the connection upgrades.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        self.buffer.take()
    }

    /// Feed socket bytes, collecting every request completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<HttpRequest>, ProtocolError> {
        self.buffer.append(data);
        let mut out = Vec::new();
        loop {
            match &mut self.phase {
                ParsePhase::Headers => {
                    let window = self.buffer.data();
                    match find_subsequence(window, HEADER_TERMINATOR) {
                        None => {
                            if window.len() > MAX_HEADER_BYTES {
                                return Err(ProtocolError::Http("header block too large".into()));
                            }
                            break;
                        }
                        Some(end) => {
                            let block = window[..end].to_vec();
                            self.buffer.consume(end + HEADER_TERMINATOR.len());
                            let (start_line, headers) = parse_header_block(&block)?;
                            let request = parse_request_line(&start_line, headers)?;
                            let kind = body_kind(&request.headers)?;
                            self.pending = Some(request);
                            match kind {
                                BodyKind::None => {
                                    out.push(self.pending.take().expect("pending request"));
                                }
                                kind => self.phase = ParsePhase::Body(kind),
                            }
                        }
                    }
                }
                ParsePhase::Body(BodyKind::Fixed(n)) => {
                    if self.buffer.len() < *n {
                        break;
                    }
                    let mut request = self.pending.take().expect("pending request");
                    request.body = self.buffer.data()[..*n].to_vec();
                    self.buffer.consume(*n);
                    self.phase = ParsePhase::Headers;
                    out.push(request);
                }
                ParsePhase::Body(BodyKind::Chunked(decoder)) => {
                    let consumed = decoder.feed(self.buffer.data())?;
                    let finished = decoder.is_done();
                    let body = if finished { decoder.take_body() } else { Vec::new() };
                    self.buffer.consume(consumed);
                    if !finished {
                        break;
                    }
                    let mut request = self.pending.take().expect("pending request");
                    request.body = body;
                    self.phase = ParsePhase::Headers;
                    out.push(request);
                }
                ParsePhase::Body(BodyKind::None) => unreachable!("None bodies complete inline"),
            }
        }
        Ok(out)
    }
}

fn parse_request_line(line: &str, headers: Headers) -> Result<HttpRequest, ProtocolError> {
    let mut parts = line.split(' ');
    let method_token = parts
        .next()
        .ok_or_else(|| ProtocolError::Http("empty request line".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| ProtocolError::Http("request line missing target".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| ProtocolError::Http("request line missing version".into()))?;
    if parts.next().is_some() {
        return Err(ProtocolError::Http(format!("malformed request line {line:?}")));
    }
    let method = Method::parse(method_token)
        .ok_or_else(|| ProtocolError::Http(format!("unsupported method {method_token:?}")))?;
    let mut request = HttpRequest::new(method, target);
    request.version = version.to_string();
    request.headers = headers;
    Ok(request)
}

/// Incremental parser for responses on a client connection. Used for the
/// WebSocket handshake reply, so bodies follow the same rules but
/// 1xx/204/304 are understood to carry none.
pub struct ResponseParser {
    buffer: ByteBuffer,
    phase: ParsePhase,
    pending: Option<HttpResponse>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            buffer: ByteBuffer::new(),
            phase: ParsePhase::Headers,
            pending: None,
        }
    }

    pub fn take_remaining(&mut self) -> Vec<u8> {
        self.buffer.take()
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<HttpResponse>, ProtocolError> {
        self.buffer.append(data);
        let mut out = Vec::new();
        loop {
            match &mut self.phase {
                ParsePhase::Headers => {
                    let window = self.buffer.data();
                    match find_subsequence(window, HEADER_TERMINATOR) {
                        None => {
                            if window.len() > MAX_HEADER_BYTES {
                                return Err(ProtocolError::Http("header block too large".into()));
                            }
                            break;
                        }
                        Some(end) => {
                            let block = window[..end].to_vec();
                            self.buffer.consume(end + HEADER_TERMINATOR.len());
                            let (start_line, headers) = parse_header_block(&block)?;
                            let response = parse_status_line(&start_line, headers)?;
                            let bodyless = response.status < 200
                                || response.status == 204
                                || response.status == 304;
                            let kind = if bodyless {
                                BodyKind::None
                            } else {
                                body_kind(&response.headers)?
                            };
                            self.pending = Some(response);
                            match kind {
                                BodyKind::None => {
                                    out.push(self.pending.take().expect("pending response"));
                                }
                                kind => self.phase = ParsePhase::Body(kind),
                            }
                        }
                    }
                }
                ParsePhase::Body(BodyKind::Fixed(n)) => {
                    if self.buffer.len() < *n {
                        break;
                    }
                    let mut response = self.pending.take().expect("pending response");
                    response.body = self.buffer.data()[..*n].to_vec();
                    self.buffer.consume(*n);
                    self.phase = ParsePhase::Headers;
                    out.push(response);
                }
                ParsePhase::Body(BodyKind::Chunked(decoder)) => {
                    let consumed = decoder.feed(self.buffer.data())?;
                    let finished = decoder.is_done();
                    let body = if finished { decoder.take_body() } else { Vec::new() };
                    self.buffer.consume(consumed);
                    if !finished {
                        break;
                    }
                    let mut response = self.pending.take().expect("pending response");
                    response.body = body;
                    self.phase = ParsePhase::Headers;
                    out.push(response);
                }
                ParsePhase::Body(BodyKind::None) => unreachable!("None bodies complete inline"),
            }
        }
        Ok(out)
    }
}

fn parse_status_line(line: &str, headers: Headers) -> Result<HttpResponse, ProtocolError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| ProtocolError::Http(format!("malformed status line {line:?}")))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::Http(format!("malformed status code in {line:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    let mut response = HttpResponse::new(status, &reason);
    response.version = version.to_string();
    response.headers = headers;
    Ok(response)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
