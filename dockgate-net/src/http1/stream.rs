use super::parser::{
    parse_header_block, parse_request_line, parse_status_line, CRLF, HEADER_TERMINATOR,
};
use super::types::{
    content_length, header_has_token, is_chunked, status_has_no_body, Header, HttpVersion, Limits,
    ParseError, ParseErrorKind,
};

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<Header>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub connection_close: bool,
    pub expect_continue: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub close_delimited: bool,
    pub connection_close: bool,
}

#[derive(Debug, Clone)]
pub enum RequestStreamEvent {
    Headers(RequestHead),
    BodyBytes { len: usize },
    EndOfMessage,
}

#[derive(Debug, Clone)]
pub enum ResponseStreamEvent {
    Headers(ResponseHead),
    BodyBytes { len: usize },
    EndOfMessage,
}

#[derive(Debug)]
enum Framing {
    Length { remaining: usize },
    Chunked { phase: ChunkPhase },
    UntilEof,
}

#[derive(Debug)]
enum ChunkPhase {
    Size { line: Vec<u8> },
    Data { remaining: usize },
    DataCrlf { remaining: u8 },
    Trailer { line: Vec<u8> },
}

#[derive(Debug)]
enum State {
    Headers,
    Body(Framing),
    Done,
}

/// Body progress for one `consume` call: lengths of payload runs seen, how
/// many input bytes belonged to this message, and whether it ended.
struct BodyProgress {
    data_runs: Vec<usize>,
    consumed: usize,
    done: bool,
}

fn consume_body(framing: &mut Framing, bytes: &[u8]) -> Result<BodyProgress, ParseError> {
    match framing {
        Framing::Length { remaining } => {
            let take = bytes.len().min(*remaining);
            *remaining -= take;
            Ok(BodyProgress {
                data_runs: if take > 0 { vec![take] } else { Vec::new() },
                consumed: take,
                done: *remaining == 0,
            })
        }
        Framing::UntilEof => Ok(BodyProgress {
            data_runs: if bytes.is_empty() {
                Vec::new()
            } else {
                vec![bytes.len()]
            },
            consumed: bytes.len(),
            done: false,
        }),
        Framing::Chunked { phase } => consume_chunked(phase, bytes),
    }
}

fn consume_chunked(phase: &mut ChunkPhase, bytes: &[u8]) -> Result<BodyProgress, ParseError> {
    let mut data_runs = Vec::new();
    let mut run = 0usize;

    for (index, &byte) in bytes.iter().enumerate() {
        match phase {
            ChunkPhase::Size { line } => {
                line.push(byte);
                if line.len() > 128 {
                    return Err(chunk_error(ParseErrorKind::InvalidChunkSize));
                }
                if line.ends_with(CRLF) {
                    let text = std::str::from_utf8(&line[..line.len() - CRLF.len()])
                        .map_err(|_| chunk_error(ParseErrorKind::InvalidChunkSize))?;
                    let size_str = text.split(';').next().unwrap_or("").trim();
                    if size_str.is_empty() {
                        line.clear();
                        continue;
                    }
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| chunk_error(ParseErrorKind::InvalidChunkSize))?;
                    *phase = if size == 0 {
                        ChunkPhase::Trailer { line: Vec::new() }
                    } else {
                        ChunkPhase::Data { remaining: size }
                    };
                }
            }
            ChunkPhase::Data { remaining } => {
                *remaining -= 1;
                run += 1;
                if *remaining == 0 {
                    data_runs.push(run);
                    run = 0;
                    *phase = ChunkPhase::DataCrlf { remaining: 2 };
                }
            }
            ChunkPhase::DataCrlf { remaining } => {
                let expected = if *remaining == 2 { b'\r' } else { b'\n' };
                if byte != expected {
                    return Err(chunk_error(ParseErrorKind::InvalidChunkTerminator));
                }
                *remaining -= 1;
                if *remaining == 0 {
                    *phase = ChunkPhase::Size { line: Vec::new() };
                }
            }
            ChunkPhase::Trailer { line } => {
                line.push(byte);
                if line.ends_with(CRLF) {
                    if line.len() == CRLF.len() {
                        return Ok(BodyProgress {
                            data_runs,
                            consumed: index + 1,
                            done: true,
                        });
                    }
                    line.clear();
                }
            }
        }
    }

    if run > 0 {
        data_runs.push(run);
    }

    Ok(BodyProgress {
        data_runs,
        consumed: bytes.len(),
        done: false,
    })
}

fn chunk_error(kind: ParseErrorKind) -> ParseError {
    ParseError { kind, offset: 0 }
}

pub struct RequestStreamParser {
    state: State,
    buffer: Vec<u8>,
    trailing: Vec<u8>,
    limits: Limits,
}

impl RequestStreamParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            state: State::Headers,
            buffer: Vec::new(),
            trailing: Vec::new(),
            limits,
        }
    }

    /// Bytes received past the end of the current message (pipelined data).
    pub fn take_trailing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.trailing)
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<RequestStreamEvent>, ParseError> {
        let mut events = Vec::new();

        match &mut self.state {
            State::Headers => {
                self.buffer.extend_from_slice(bytes);
                if self.buffer.len() > self.limits.max_header_bytes {
                    return Err(ParseError {
                        kind: ParseErrorKind::HeaderTooLarge,
                        offset: self.limits.max_header_bytes,
                    });
                }
                let Some(header_end) = find_header_end(&self.buffer) else {
                    return Ok(events);
                };
                let body = self.buffer.split_off(header_end + HEADER_TERMINATOR.len());
                self.buffer.truncate(header_end);

                let (head, framing) = parse_request_head(&self.buffer)?;
                self.buffer = Vec::new();
                events.push(RequestStreamEvent::Headers(head));

                match framing {
                    Some(framing) => self.state = State::Body(framing),
                    None => {
                        events.push(RequestStreamEvent::EndOfMessage);
                        self.state = State::Done;
                    }
                }
                self.advance(&body, &mut events)?;
                Ok(events)
            }
            State::Body(_) => {
                self.advance(bytes, &mut events)?;
                Ok(events)
            }
            State::Done => {
                self.trailing.extend_from_slice(bytes);
                Ok(events)
            }
        }
    }

    pub fn push_eof(&mut self) -> Result<(), ParseError> {
        match self.state {
            State::Headers if self.buffer.is_empty() => Ok(()),
            State::Done => Ok(()),
            _ => Err(ParseError {
                kind: ParseErrorKind::UnexpectedEof,
                offset: 0,
            }),
        }
    }

    fn advance(
        &mut self,
        bytes: &[u8],
        events: &mut Vec<RequestStreamEvent>,
    ) -> Result<(), ParseError> {
        if bytes.is_empty() {
            return Ok(());
        }
        match &mut self.state {
            State::Body(framing) => {
                let progress = consume_body(framing, bytes)?;
                for len in progress.data_runs {
                    events.push(RequestStreamEvent::BodyBytes { len });
                }
                if progress.done {
                    events.push(RequestStreamEvent::EndOfMessage);
                    self.state = State::Done;
                    self.trailing.extend_from_slice(&bytes[progress.consumed..]);
                }
                Ok(())
            }
            State::Done => {
                self.trailing.extend_from_slice(bytes);
                Ok(())
            }
            State::Headers => Ok(()),
        }
    }
}

pub struct ResponseStreamParser {
    state: State,
    buffer: Vec<u8>,
    trailing: Vec<u8>,
    limits: Limits,
    close_delimited: bool,
}

impl ResponseStreamParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            state: State::Headers,
            buffer: Vec::new(),
            trailing: Vec::new(),
            limits,
            close_delimited: false,
        }
    }

    /// Bytes received past the end of the current message. After a `101`
    /// response these are the first bytes of the upgraded byte stream.
    pub fn take_trailing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.trailing)
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<ResponseStreamEvent>, ParseError> {
        let mut events = Vec::new();

        match &mut self.state {
            State::Headers => {
                self.buffer.extend_from_slice(bytes);
                if self.buffer.len() > self.limits.max_header_bytes {
                    return Err(ParseError {
                        kind: ParseErrorKind::HeaderTooLarge,
                        offset: self.limits.max_header_bytes,
                    });
                }
                let Some(header_end) = find_header_end(&self.buffer) else {
                    return Ok(events);
                };
                let body = self.buffer.split_off(header_end + HEADER_TERMINATOR.len());
                self.buffer.truncate(header_end);

                let (head, framing) = parse_response_head(&self.buffer)?;
                self.close_delimited = head.close_delimited;
                self.buffer = Vec::new();
                events.push(ResponseStreamEvent::Headers(head));

                match framing {
                    Some(framing) => self.state = State::Body(framing),
                    None => {
                        events.push(ResponseStreamEvent::EndOfMessage);
                        self.state = State::Done;
                    }
                }
                self.advance(&body, &mut events)?;
                Ok(events)
            }
            State::Body(_) => {
                self.advance(bytes, &mut events)?;
                Ok(events)
            }
            State::Done => {
                self.trailing.extend_from_slice(bytes);
                Ok(events)
            }
        }
    }

    pub fn push_eof(&mut self) -> Result<Vec<ResponseStreamEvent>, ParseError> {
        let mut events = Vec::new();
        if matches!(self.state, State::Body(Framing::UntilEof)) {
            events.push(ResponseStreamEvent::EndOfMessage);
            self.state = State::Done;
            return Ok(events);
        }
        if matches!(self.state, State::Done) {
            return Ok(events);
        }
        Err(ParseError {
            kind: ParseErrorKind::UnexpectedEof,
            offset: 0,
        })
    }

    fn advance(
        &mut self,
        bytes: &[u8],
        events: &mut Vec<ResponseStreamEvent>,
    ) -> Result<(), ParseError> {
        if bytes.is_empty() {
            return Ok(());
        }
        match &mut self.state {
            State::Body(framing) => {
                let progress = consume_body(framing, bytes)?;
                for len in progress.data_runs {
                    events.push(ResponseStreamEvent::BodyBytes { len });
                }
                if progress.done {
                    events.push(ResponseStreamEvent::EndOfMessage);
                    self.state = State::Done;
                    self.trailing.extend_from_slice(&bytes[progress.consumed..]);
                }
                Ok(())
            }
            State::Done => {
                self.trailing.extend_from_slice(bytes);
                Ok(())
            }
            State::Headers => Ok(()),
        }
    }
}

fn parse_request_head(bytes: &[u8]) -> Result<(RequestHead, Option<Framing>), ParseError> {
    let (line, header_block) = split_head(bytes);
    let line = parse_request_line(line)?;
    let headers = parse_header_block(header_block)?;
    let length = content_length(&headers);
    let chunked = is_chunked(&headers);

    let head = RequestHead {
        method: line.method,
        target: line.target,
        connection_close: should_close_request(&line.version, &headers),
        expect_continue: header_has_token(&headers, "expect", "100-continue"),
        version: line.version,
        headers,
        content_length: length,
        chunked,
    };

    let framing = if chunked {
        Some(Framing::Chunked {
            phase: ChunkPhase::Size { line: Vec::new() },
        })
    } else {
        match length {
            Some(0) | None => None,
            Some(length) => Some(Framing::Length { remaining: length }),
        }
    };

    Ok((head, framing))
}

fn parse_response_head(bytes: &[u8]) -> Result<(ResponseHead, Option<Framing>), ParseError> {
    let (line, header_block) = split_head(bytes);
    let line = parse_status_line(line)?;
    let headers = parse_header_block(header_block)?;
    let length = content_length(&headers);
    let chunked = is_chunked(&headers);
    let no_body = status_has_no_body(line.status_code);
    let close_delimited = !chunked && length.is_none() && !no_body;

    let head = ResponseHead {
        status_code: line.status_code,
        reason: line.reason,
        connection_close: should_close_response(&line.version, &headers),
        version: line.version,
        headers,
        content_length: length,
        chunked,
        close_delimited,
    };

    let framing = if no_body || length == Some(0) {
        None
    } else if chunked {
        Some(Framing::Chunked {
            phase: ChunkPhase::Size { line: Vec::new() },
        })
    } else if let Some(length) = length {
        Some(Framing::Length { remaining: length })
    } else {
        Some(Framing::UntilEof)
    };

    Ok((head, framing))
}

fn split_head(bytes: &[u8]) -> (&[u8], &[u8]) {
    match twoway::find_bytes(bytes, CRLF) {
        Some(index) => (&bytes[..index], &bytes[index + CRLF.len()..]),
        None => (bytes, &[][..]),
    }
}

fn find_header_end(bytes: &[u8]) -> Option<usize> {
    twoway::find_bytes(bytes, HEADER_TERMINATOR)
}

pub(crate) fn should_close_request(version: &HttpVersion, headers: &[Header]) -> bool {
    match version {
        HttpVersion::Http10 => !header_has_token(headers, "connection", "keep-alive"),
        _ => header_has_token(headers, "connection", "close"),
    }
}

pub(crate) fn should_close_response(version: &HttpVersion, headers: &[Header]) -> bool {
    match version {
        HttpVersion::Http10 => !header_has_token(headers, "connection", "keep-alive"),
        _ => header_has_token(headers, "connection", "close"),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        RequestStreamEvent, RequestStreamParser, ResponseStreamEvent, ResponseStreamParser,
    };

    fn request_events(parser: &mut RequestStreamParser, bytes: &[u8]) -> Vec<RequestStreamEvent> {
        parser.push(bytes).expect("parse")
    }

    #[test]
    fn emits_headers_then_end_for_bodyless_request() {
        let mut parser = RequestStreamParser::new();
        let events = request_events(&mut parser, b"GET /version HTTP/1.1\r\nHost: docker\r\n\r\n");

        assert!(matches!(&events[0], RequestStreamEvent::Headers(head) if head.method == "GET"));
        assert!(matches!(events[1], RequestStreamEvent::EndOfMessage));
    }

    #[test]
    fn tracks_content_length_body_across_pushes() {
        let mut parser = RequestStreamParser::new();
        let events = request_events(
            &mut parser,
            b"POST /containers/create HTTP/1.1\r\nContent-Length: 8\r\n\r\nabc",
        );
        assert!(matches!(&events[0], RequestStreamEvent::Headers(_)));
        assert!(matches!(events[1], RequestStreamEvent::BodyBytes { len: 3 }));

        let events = request_events(&mut parser, b"defgh");
        assert!(matches!(events[0], RequestStreamEvent::BodyBytes { len: 5 }));
        assert!(matches!(events[1], RequestStreamEvent::EndOfMessage));
    }

    #[test]
    fn keeps_pipelined_bytes_as_trailing() {
        let mut parser = RequestStreamParser::new();
        let events = request_events(
            &mut parser,
            b"GET /a HTTP/1.1\r\nHost: docker\r\n\r\nGET /b HTTP/1.1\r\n",
        );
        assert!(matches!(
            events.last(),
            Some(RequestStreamEvent::EndOfMessage)
        ));
        assert_eq!(parser.take_trailing(), b"GET /b HTTP/1.1\r\n");
    }

    #[test]
    fn flags_chunked_request_head() {
        let mut parser = RequestStreamParser::new();
        let events = request_events(
            &mut parser,
            b"POST /build HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let RequestStreamEvent::Headers(head) = &events[0] else {
            panic!("expected headers event");
        };
        assert!(head.chunked);

        let events = request_events(&mut parser, b"3\r\ntar\r\n0\r\n\r\n");
        assert!(matches!(events[0], RequestStreamEvent::BodyBytes { len: 3 }));
        assert!(matches!(events[1], RequestStreamEvent::EndOfMessage));
    }

    #[test]
    fn surfaces_expect_continue() {
        let mut parser = RequestStreamParser::new();
        let events = request_events(
            &mut parser,
            b"POST /images/load HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n",
        );
        let RequestStreamEvent::Headers(head) = &events[0] else {
            panic!("expected headers event");
        };
        assert!(head.expect_continue);
    }

    #[test]
    fn response_chunked_completes_on_last_chunk() {
        let mut parser = ResponseStreamParser::new();
        let events = parser
            .push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .expect("parse");
        let ResponseStreamEvent::Headers(head) = &events[0] else {
            panic!("expected headers event");
        };
        assert!(head.chunked);
        assert!(!head.close_delimited);

        let events = parser.push(b"5\r\nhello\r\n").expect("parse");
        assert!(matches!(events[0], ResponseStreamEvent::BodyBytes { len: 5 }));

        let events = parser.push(b"0\r\n\r\n").expect("parse");
        assert!(matches!(events[0], ResponseStreamEvent::EndOfMessage));
    }

    #[test]
    fn response_101_ends_at_headers_with_trailing_stream() {
        let mut parser = ResponseStreamParser::new();
        let events = parser
            .push(b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\nraw-data")
            .expect("parse");
        let ResponseStreamEvent::Headers(head) = &events[0] else {
            panic!("expected headers event");
        };
        assert_eq!(head.status_code, 101);
        assert!(matches!(events[1], ResponseStreamEvent::EndOfMessage));
        assert_eq!(parser.take_trailing(), b"raw-data");
    }

    #[test]
    fn close_delimited_response_ends_on_eof() {
        let mut parser = ResponseStreamParser::new();
        let events = parser
            .push(b"HTTP/1.1 200 OK\r\nServer: docker\r\n\r\nsome data")
            .expect("parse");
        let ResponseStreamEvent::Headers(head) = &events[0] else {
            panic!("expected headers event");
        };
        assert!(head.close_delimited);
        assert!(matches!(
            events[1],
            ResponseStreamEvent::BodyBytes { len: 9 }
        ));

        let events = parser.push_eof().expect("eof");
        assert!(matches!(events[0], ResponseStreamEvent::EndOfMessage));
    }

    #[test]
    fn eof_mid_body_is_an_error() {
        let mut parser = ResponseStreamParser::new();
        parser
            .push(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .expect("parse");
        assert!(parser.push_eof().is_err());
    }

    #[test]
    fn content_length_trailing_goes_to_next_message() {
        let mut parser = ResponseStreamParser::new();
        let events = parser
            .push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokHTTP/1.1 204")
            .expect("parse");
        assert!(matches!(
            events.last(),
            Some(ResponseStreamEvent::EndOfMessage)
        ));
        assert_eq!(parser.take_trailing(), b"HTTP/1.1 204");
    }
}
