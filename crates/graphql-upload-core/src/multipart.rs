//! Streaming `multipart/form-data` demultiplexer.
//!
//! [`MultipartDemux`] is a push/pull state machine: callers [`feed`](MultipartDemux::feed)
//! body bytes in and pull [`MultipartEvent`]s out. Part payloads are flushed as
//! they become safe to emit, so memory stays bounded by roughly one body chunk
//! plus the boundary length regardless of the part size.
//!
//! [`PartStream`] drives the state machine from an async byte stream and only
//! suspends when the state machine needs more input.

use std::collections::HashMap;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use memchr::memmem;

/// RFC 2046 recommends multipart boundary length <= 70 characters.
const MAX_BOUNDARY_LEN: usize = 70;

/// Upper bound on the header block of a single part.
pub const MAX_PART_HEADER_SIZE: usize = 16 * 1024;

/// Errors that can occur while demultiplexing a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    /// Missing boundary in Content-Type header.
    MissingBoundary,
    /// Invalid boundary format, or the content type is not `multipart/form-data`.
    InvalidBoundary,
    /// Missing Content-Disposition header.
    MissingContentDisposition,
    /// Invalid Content-Disposition header.
    InvalidContentDisposition { detail: String },
    /// Invalid part headers.
    InvalidPartHeaders { detail: String },
    /// The body ended before the closing boundary.
    UnexpectedEof,
    /// Invalid multipart format.
    InvalidFormat { detail: &'static str },
    /// The underlying body stream failed.
    Io { detail: String },
}

impl std::fmt::Display for MultipartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBoundary => write!(f, "missing boundary in multipart Content-Type"),
            Self::InvalidBoundary => write!(f, "invalid multipart boundary"),
            Self::MissingContentDisposition => {
                write!(f, "missing Content-Disposition header in part")
            }
            Self::InvalidContentDisposition { detail } => {
                write!(f, "invalid Content-Disposition: {detail}")
            }
            Self::InvalidPartHeaders { detail } => write!(f, "invalid part headers: {detail}"),
            Self::UnexpectedEof => write!(f, "unexpected end of multipart data"),
            Self::InvalidFormat { detail } => write!(f, "invalid multipart format: {detail}"),
            Self::Io { detail } => write!(f, "multipart body I/O error: {detail}"),
        }
    }
}

impl std::error::Error for MultipartError {}

/// Headers of a single part, captured when the part starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeaders {
    /// Field name from Content-Disposition.
    pub name: String,
    /// Filename from Content-Disposition (if present).
    pub filename: Option<String>,
    /// Content-Type of the part (if present).
    pub content_type: Option<String>,
    /// Content-Transfer-Encoding of the part (if present).
    pub transfer_encoding: Option<String>,
    /// All part headers, lowercased names.
    pub headers: HashMap<String, String>,
}

impl PartHeaders {
    /// Returns true if this part is a file upload.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    /// Returns true if this part is a regular form field.
    #[must_use]
    pub fn is_field(&self) -> bool {
        self.filename.is_none()
    }
}

/// A demultiplexer event, produced in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartEvent {
    /// A new part begins.
    PartStart(PartHeaders),
    /// A chunk of the current part's payload. Never empty.
    PartData(Bytes),
    /// The current part is complete.
    PartEnd,
    /// The closing boundary was reached.
    Finished,
}

/// Parse boundary from Content-Type header.
///
/// Content-Type format: `multipart/form-data; boundary=----WebKitFormBoundary...`
pub fn parse_boundary(content_type: &str) -> Result<String, MultipartError> {
    let content_type = content_type.trim();
    let main = content_type.split(';').next().unwrap_or("").trim();
    if !main.eq_ignore_ascii_case("multipart/form-data") {
        return Err(MultipartError::InvalidBoundary);
    }

    for part in split_params(content_type).into_iter().skip(1) {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        if k.trim().eq_ignore_ascii_case("boundary") {
            let boundary = unquote(v);
            if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
                return Err(MultipartError::InvalidBoundary);
            }
            return Ok(boundary);
        }
    }

    Err(MultipartError::MissingBoundary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    /// Skipping bytes before the first boundary.
    Preamble,
    /// Buffer starts with a boundary delimiter.
    Boundary,
    /// Inside a part payload.
    Data,
    /// Payload flushed; `PartEnd` still owed.
    PartEnd,
    /// Closing boundary consumed.
    Done,
}

/// Incremental multipart state machine.
#[derive(Debug)]
pub struct MultipartDemux {
    boundary: Vec<u8>,
    finder: memmem::Finder<'static>,
    buffer: BytesMut,
    state: DemuxState,
}

impl MultipartDemux {
    /// Create a demultiplexer for the given boundary (without the leading `--`).
    #[must_use]
    pub fn new(boundary: &str) -> Self {
        let boundary = format!("--{boundary}").into_bytes();
        let finder = memmem::Finder::new(&boundary).into_owned();
        Self {
            boundary,
            finder,
            buffer: BytesMut::new(),
            state: DemuxState::Preamble,
        }
    }

    /// Append body bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.state != DemuxState::Done {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Returns true if the closing boundary has been fully parsed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == DemuxState::Done
    }

    /// Number of bytes currently held back in the internal buffer.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next event out of the buffered bytes.
    ///
    /// Returns `Ok(None)` when more input is required. Pass `eof = true` once the
    /// body has ended to turn an incomplete body into [`MultipartError::UnexpectedEof`].
    pub fn poll_event(&mut self, eof: bool) -> Result<Option<MultipartEvent>, MultipartError> {
        loop {
            match self.state {
                DemuxState::Done => return Ok(Some(MultipartEvent::Finished)),
                DemuxState::PartEnd => {
                    self.state = DemuxState::Boundary;
                    return Ok(Some(MultipartEvent::PartEnd));
                }
                DemuxState::Preamble => match self.find_boundary(0, false) {
                    Ok(pos) => {
                        self.buffer.advance(pos);
                        self.state = DemuxState::Boundary;
                    }
                    Err(MultipartError::UnexpectedEof) => {
                        if eof {
                            return Err(MultipartError::UnexpectedEof);
                        }
                        // Keep only the suffix that could still contain a split boundary.
                        let keep = self.boundary.len().saturating_add(4);
                        if self.buffer.len() > keep {
                            let drop_len = self.buffer.len() - keep;
                            self.buffer.advance(drop_len);
                        }
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                },
                DemuxState::Boundary => return self.poll_part_start(eof),
                DemuxState::Data => return self.poll_part_data(eof),
            }
        }
    }

    fn poll_part_start(&mut self, eof: bool) -> Result<Option<MultipartEvent>, MultipartError> {
        let boundary_end = self.boundary.len();
        if boundary_end + 2 > self.buffer.len() {
            return self.need_more(eof);
        }

        let suffix = &self.buffer[boundary_end..boundary_end + 2];
        if suffix == b"--" {
            self.state = DemuxState::Done;
            self.buffer.clear();
            return Ok(Some(MultipartEvent::Finished));
        }
        if suffix != b"\r\n" {
            return Err(MultipartError::InvalidFormat {
                detail: "expected CRLF after boundary",
            });
        }

        let (headers, data_start) = match parse_part_headers(&self.buffer, boundary_end + 2) {
            Ok(parsed) => parsed,
            Err(MultipartError::UnexpectedEof) => {
                if self.buffer.len() > MAX_PART_HEADER_SIZE + boundary_end {
                    return Err(MultipartError::InvalidPartHeaders {
                        detail: "part header block too large".to_string(),
                    });
                }
                return self.need_more(eof);
            }
            Err(err) => return Err(err),
        };

        let content_disp = headers
            .get("content-disposition")
            .ok_or(MultipartError::MissingContentDisposition)?;
        let (name, filename) = parse_content_disposition(content_disp)?;
        let content_type = headers.get("content-type").cloned();
        let transfer_encoding = headers.get("content-transfer-encoding").cloned();

        self.buffer.advance(data_start);
        self.state = DemuxState::Data;
        Ok(Some(MultipartEvent::PartStart(PartHeaders {
            name,
            filename,
            content_type,
            transfer_encoding,
            headers,
        })))
    }

    fn poll_part_data(&mut self, eof: bool) -> Result<Option<MultipartEvent>, MultipartError> {
        match self.find_boundary(0, true) {
            Ok(data_end) => {
                // The CRLF preceding the delimiter belongs to the delimiter.
                let write_end = data_end - 2;
                if write_end == 0 {
                    self.buffer.advance(data_end);
                    self.state = DemuxState::Boundary;
                    return Ok(Some(MultipartEvent::PartEnd));
                }
                let data = self.buffer.split_to(write_end).freeze();
                self.buffer.advance(2);
                self.state = DemuxState::PartEnd;
                Ok(Some(MultipartEvent::PartData(data)))
            }
            Err(MultipartError::UnexpectedEof) => {
                if eof {
                    return Err(MultipartError::UnexpectedEof);
                }
                // No complete boundary yet: flush the safe prefix.
                let keep = self.boundary.len().saturating_add(4);
                if self.buffer.len() > keep {
                    let flush_len = self.buffer.len() - keep;
                    let data = self.buffer.split_to(flush_len).freeze();
                    return Ok(Some(MultipartEvent::PartData(data)));
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn need_more(&self, eof: bool) -> Result<Option<MultipartEvent>, MultipartError> {
        if eof {
            Err(MultipartError::UnexpectedEof)
        } else {
            Ok(None)
        }
    }

    /// Find a boundary delimiter at or after `start`.
    ///
    /// Delimiters must sit at the start of a CRLF-delimited line (or at the very
    /// start of the body outside part payloads) and be followed by CRLF or `--`.
    fn find_boundary(&self, start: usize, in_part: bool) -> Result<usize, MultipartError> {
        let data = &self.buffer[..];
        let boundary_len = self.boundary.len();
        let mut offset = start;

        while offset < data.len() {
            let Some(found) = self.finder.find(&data[offset..]) else {
                break;
            };
            let i = offset + found;
            offset = i + 1;

            let at_line_start = if i == 0 {
                !in_part
            } else {
                i >= 2 && data[i - 2..i] == *b"\r\n"
            };
            if !at_line_start {
                continue;
            }

            let boundary_end = i + boundary_len;
            if boundary_end + 2 > data.len() {
                return Err(MultipartError::UnexpectedEof);
            }
            let suffix = &data[boundary_end..boundary_end + 2];
            if suffix != b"\r\n" && suffix != b"--" {
                continue;
            }

            return Ok(i);
        }

        Err(MultipartError::UnexpectedEof)
    }
}

/// Async event source over a request body stream.
#[derive(Debug)]
pub struct PartStream<S> {
    body: S,
    demux: MultipartDemux,
    eof: bool,
}

impl<S> PartStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    /// Wrap a body stream for the given boundary.
    pub fn new(body: S, boundary: &str) -> Self {
        Self {
            body,
            demux: MultipartDemux::new(boundary),
            eof: false,
        }
    }

    /// Wrap a body stream, reading the boundary from a Content-Type value.
    pub fn from_content_type(body: S, content_type: &str) -> Result<Self, MultipartError> {
        let boundary = parse_boundary(content_type)?;
        Ok(Self::new(body, &boundary))
    }

    /// Await the next event.
    ///
    /// Cancel-safe: dropping the future between body chunks loses no state.
    pub async fn next_event(&mut self) -> Result<MultipartEvent, MultipartError> {
        loop {
            if let Some(event) = self.demux.poll_event(self.eof)? {
                return Ok(event);
            }
            if self.eof {
                return Err(MultipartError::UnexpectedEof);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.demux.feed(&chunk),
                Some(Err(err)) => {
                    return Err(MultipartError::Io {
                        detail: err.to_string(),
                    });
                }
                None => self.eof = true,
            }
        }
    }

    /// Consume and discard whatever is left of the body.
    pub async fn drain(&mut self) {
        while !self.eof {
            match self.body.next().await {
                Some(Ok(_)) => {}
                Some(Err(_)) | None => self.eof = true,
            }
        }
    }

    /// Returns true once the underlying body stream has ended.
    #[must_use]
    pub fn body_ended(&self) -> bool {
        self.eof
    }
}

fn parse_part_headers(
    data: &[u8],
    start: usize,
) -> Result<(HashMap<String, String>, usize), MultipartError> {
    let mut headers = HashMap::new();
    let mut pos = start;

    loop {
        let line_end = find_crlf(data, pos)?;
        let line = &data[pos..line_end];
        if line.is_empty() {
            return Ok((headers, line_end + 2));
        }

        let line_str =
            std::str::from_utf8(line).map_err(|_| MultipartError::InvalidPartHeaders {
                detail: "invalid UTF-8 in header".to_string(),
            })?;

        if let Some((name, value)) = line_str.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        pos = line_end + 2;
    }
}

fn find_crlf(data: &[u8], start: usize) -> Result<usize, MultipartError> {
    if start >= data.len() {
        return Err(MultipartError::UnexpectedEof);
    }
    memmem::find(&data[start..], b"\r\n")
        .map(|i| start + i)
        .ok_or(MultipartError::UnexpectedEof)
}

/// Parse Content-Disposition header value.
///
/// Format: `form-data; name="field"; filename="file.txt"`
fn parse_content_disposition(value: &str) -> Result<(String, Option<String>), MultipartError> {
    let mut name = None;
    let mut filename = None;

    for part in split_params(value) {
        if part.eq_ignore_ascii_case("form-data") {
            continue;
        }

        if let Some((key, raw_value)) = part.split_once('=') {
            let key = key.trim();
            if key.eq_ignore_ascii_case("name") {
                name = Some(unquote(raw_value));
            } else if key.eq_ignore_ascii_case("filename") {
                filename = Some(unquote(raw_value));
            }
        }
    }

    let name = name.ok_or_else(|| MultipartError::InvalidContentDisposition {
        detail: "missing name parameter".to_string(),
    })?;

    Ok((name, filename))
}

/// Split a header value on `;`, ignoring separators inside quoted strings.
fn split_params(value: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                params.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(value[start..].trim());
    params
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        let inner = &s[1..s.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect_events(body: &[u8], boundary: &str, chunk: usize) -> Vec<MultipartEvent> {
        let mut demux = MultipartDemux::new(boundary);
        let mut events = Vec::new();
        for piece in body.chunks(chunk.max(1)) {
            demux.feed(piece);
            while let Some(event) = demux.poll_event(false).expect("demux") {
                let finished = event == MultipartEvent::Finished;
                events.push(event);
                if finished {
                    return coalesce(events);
                }
            }
        }
        while let Some(event) = demux.poll_event(true).expect("demux at eof") {
            let finished = event == MultipartEvent::Finished;
            events.push(event);
            if finished {
                break;
            }
        }
        coalesce(events)
    }

    /// Merge adjacent data chunks so chunking differences do not matter.
    fn coalesce(events: Vec<MultipartEvent>) -> Vec<MultipartEvent> {
        let mut out: Vec<MultipartEvent> = Vec::new();
        for event in events {
            if let MultipartEvent::PartData(data) = &event {
                if let Some(MultipartEvent::PartData(prev)) = out.last_mut() {
                    let mut merged = prev.to_vec();
                    merged.extend_from_slice(data);
                    *prev = Bytes::from(merged);
                    continue;
                }
            }
            out.push(event);
        }
        out
    }

    const SIMPLE: &str = concat!(
        "------boundary\r\n",
        "Content-Disposition: form-data; name=\"operations\"\r\n",
        "\r\n",
        "{\"a\":1}\r\n",
        "------boundary\r\n",
        "Content-Disposition: form-data; name=\"1\"; filename=\"a.txt\"\r\n",
        "Content-Type: text/plain\r\n",
        "Content-Transfer-Encoding: 7bit\r\n",
        "\r\n",
        "hello\r\n",
        "------boundary--\r\n"
    );

    #[test]
    fn test_parse_boundary() {
        let ct = "multipart/form-data; boundary=----WebKitFormBoundary7MA4YWxkTrZu0gW";
        let boundary = parse_boundary(ct).unwrap();
        assert_eq!(boundary, "----WebKitFormBoundary7MA4YWxkTrZu0gW");
    }

    #[test]
    fn test_parse_boundary_quoted() {
        let ct = r#"multipart/form-data; Boundary="simple-boundary""#;
        assert_eq!(parse_boundary(ct).unwrap(), "simple-boundary");
    }

    #[test]
    fn test_parse_boundary_missing() {
        let result = parse_boundary("multipart/form-data");
        assert_eq!(result, Err(MultipartError::MissingBoundary));
    }

    #[test]
    fn test_parse_boundary_rejects_too_long_value() {
        let too_long = "a".repeat(MAX_BOUNDARY_LEN + 1);
        let ct = format!("multipart/form-data; boundary={too_long}");
        assert_eq!(parse_boundary(&ct), Err(MultipartError::InvalidBoundary));
    }

    #[test]
    fn test_parse_boundary_wrong_content_type() {
        assert_eq!(
            parse_boundary("application/json"),
            Err(MultipartError::InvalidBoundary)
        );
    }

    #[test]
    fn test_parse_content_disposition_quoted_semicolon() {
        let (name, filename) =
            parse_content_disposition(r#"form-data; Name="field"; FileName="a;b \"c\".txt""#)
                .expect("content disposition should parse");
        assert_eq!(name, "field");
        assert_eq!(filename.as_deref(), Some("a;b \"c\".txt"));
    }

    #[test]
    fn test_parse_content_disposition_missing_name() {
        let result = parse_content_disposition("form-data; filename=\"a.txt\"");
        assert!(matches!(
            result,
            Err(MultipartError::InvalidContentDisposition { .. })
        ));
    }

    #[test]
    fn test_events_in_wire_order() {
        let events = collect_events(SIMPLE.as_bytes(), "----boundary", 1024);
        assert_eq!(events.len(), 7);

        let MultipartEvent::PartStart(first) = &events[0] else {
            panic!("expected part start, got {:?}", events[0]);
        };
        assert_eq!(first.name, "operations");
        assert!(first.is_field());
        assert_eq!(events[1], MultipartEvent::PartData(Bytes::from_static(b"{\"a\":1}")));
        assert_eq!(events[2], MultipartEvent::PartEnd);

        let MultipartEvent::PartStart(file) = &events[3] else {
            panic!("expected part start, got {:?}", events[3]);
        };
        assert!(file.is_file());
        assert_eq!(file.filename.as_deref(), Some("a.txt"));
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(file.transfer_encoding.as_deref(), Some("7bit"));
        assert_eq!(events[4], MultipartEvent::PartData(Bytes::from_static(b"hello")));
        assert_eq!(events[5], MultipartEvent::PartEnd);
        assert_eq!(events[6], MultipartEvent::Finished);
    }

    #[test]
    fn test_empty_part_has_no_data_event() {
        let body = concat!(
            "--b\r\n",
            "Content-Disposition: form-data; name=\"empty\"; filename=\"e.txt\"\r\n",
            "\r\n",
            "\r\n",
            "--b--\r\n"
        );
        let events = collect_events(body.as_bytes(), "b", 3);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], MultipartEvent::PartStart(_)));
        assert_eq!(events[1], MultipartEvent::PartEnd);
        assert_eq!(events[2], MultipartEvent::Finished);
    }

    #[test]
    fn test_preamble_is_skipped() {
        let body = format!("this is a preamble\r\n{SIMPLE}");
        let events = collect_events(body.as_bytes(), "----boundary", 7);
        assert_eq!(events.len(), 7);
    }

    #[test]
    fn test_boundary_like_sequence_in_part_body_does_not_terminate_part() {
        let body = concat!(
            "------boundary\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"data.bin\"\r\n",
            "\r\n",
            "line1\r\n",
            "------boundaryX\r\n",
            "line2\r\n",
            "------boundary--\r\n"
        );
        let events = collect_events(body.as_bytes(), "----boundary", 4);
        assert_eq!(
            events[1],
            MultipartEvent::PartData(Bytes::from_static(b"line1\r\n------boundaryX\r\nline2"))
        );
    }

    #[test]
    fn test_truncated_body_is_unexpected_eof() {
        let body = &SIMPLE.as_bytes()[..SIMPLE.len() - 30];
        let mut demux = MultipartDemux::new("----boundary");
        demux.feed(body);
        let mut result = Ok(None);
        for _ in 0..16 {
            result = demux.poll_event(true);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(MultipartError::UnexpectedEof));
    }

    #[test]
    fn test_body_without_boundary_is_unexpected_eof() {
        let mut demux = MultipartDemux::new("b");
        demux.feed(b"--bXX not a delimiter");
        assert_eq!(demux.poll_event(false), Ok(None));
        assert_eq!(demux.poll_event(true), Err(MultipartError::UnexpectedEof));
    }

    #[test]
    fn test_oversized_header_block_is_rejected() {
        let mut demux = MultipartDemux::new("b");
        demux.feed(b"--b\r\nX-Long: ");
        demux.feed(&vec![b'x'; MAX_PART_HEADER_SIZE + 8]);
        assert!(matches!(
            demux.poll_event(false),
            Err(MultipartError::InvalidPartHeaders { .. })
        ));
    }

    #[test]
    fn test_buffer_stays_bounded_for_large_part() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x\"\r\n\r\n");
        body.extend_from_slice(&vec![b'x'; 256 * 1024]);
        body.extend_from_slice(b"\r\n--b--\r\n");

        let mut demux = MultipartDemux::new("b");
        let mut max_buffered = 0;
        let mut total = 0;
        for chunk in body.chunks(513) {
            demux.feed(chunk);
            while let Some(event) = demux.poll_event(false).expect("demux") {
                match event {
                    MultipartEvent::PartData(data) => total += data.len(),
                    MultipartEvent::Finished => break,
                    _ => {}
                }
            }
            max_buffered = max_buffered.max(demux.buffered_len());
        }
        assert!(demux.is_done());
        assert_eq!(total, 256 * 1024);
        assert!(max_buffered < 2 * 1024, "buffer grew to {max_buffered}");
    }

    #[test]
    fn test_part_stream_reports_body_error() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"--b\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nxx")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut parts = PartStream::new(futures_util::stream::iter(chunks), "b");
        futures_executor::block_on(async {
            assert!(matches!(
                parts.next_event().await,
                Ok(MultipartEvent::PartStart(_))
            ));
            loop {
                match parts.next_event().await {
                    Ok(MultipartEvent::PartData(_)) => {}
                    Err(err) => {
                        assert!(matches!(err, MultipartError::Io { .. }));
                        break;
                    }
                    Ok(other) => panic!("unexpected event {other:?}"),
                }
            }
        });
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_events(chunk in 1usize..64) {
            let expected = collect_events(SIMPLE.as_bytes(), "----boundary", SIMPLE.len());
            let actual = collect_events(SIMPLE.as_bytes(), "----boundary", chunk);
            prop_assert_eq!(expected, actual);
        }
    }
}
