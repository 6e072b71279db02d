use super::types::{
    content_length, is_chunked, Header, HttpVersion, Limits, ParseError, ParseErrorKind, Request,
    RequestLine, Response, StatusLine,
};

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore,
    Complete { message: T },
    Error { error: ParseError },
}

#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    limits: Limits,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Request> {
        self.buffer.extend_from_slice(bytes);
        match parse_request(&self.buffer, self.limits) {
            Ok(Some((message, consumed))) => {
                self.buffer.drain(..consumed);
                ParseStatus::Complete { message }
            }
            Ok(None) => ParseStatus::NeedMore,
            Err(error) => ParseStatus::Error { error },
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    buffer: Vec<u8>,
    limits: Limits,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Response> {
        self.buffer.extend_from_slice(bytes);
        match parse_response(&self.buffer, self.limits) {
            Ok(Some((message, consumed))) => {
                self.buffer.drain(..consumed);
                ParseStatus::Complete { message }
            }
            Ok(None) => ParseStatus::NeedMore,
            Err(error) => ParseStatus::Error { error },
        }
    }
}

fn parse_request(buffer: &[u8], limits: Limits) -> Result<Option<(Request, usize)>, ParseError> {
    let Some(headers_end) = find_headers_end(buffer, limits)? else {
        return Ok(None);
    };

    // With no headers at all the start line runs straight into the
    // terminator, so the line ends at headers_end itself.
    let line_end = find_line_end(buffer, 0)
        .unwrap_or(headers_end)
        .min(headers_end);
    let line = parse_request_line(&buffer[..line_end])?;
    let headers = if line_end + CRLF.len() < headers_end {
        parse_header_block(&buffer[line_end + CRLF.len()..headers_end])?
    } else {
        Vec::new()
    };

    let body_start = headers_end + HEADER_TERMINATOR.len();
    let Some((body, body_len)) = parse_body(buffer, body_start, &headers, false, 0, limits)? else {
        return Ok(None);
    };

    Ok(Some((
        Request {
            line,
            headers,
            body,
        },
        body_start + body_len,
    )))
}

fn parse_response(buffer: &[u8], limits: Limits) -> Result<Option<(Response, usize)>, ParseError> {
    let Some(headers_end) = find_headers_end(buffer, limits)? else {
        return Ok(None);
    };

    let line_end = find_line_end(buffer, 0)
        .unwrap_or(headers_end)
        .min(headers_end);
    let line = parse_status_line(&buffer[..line_end])?;
    let headers = if line_end + CRLF.len() < headers_end {
        parse_header_block(&buffer[line_end + CRLF.len()..headers_end])?
    } else {
        Vec::new()
    };

    let body_start = headers_end + HEADER_TERMINATOR.len();
    let Some((body, body_len)) =
        parse_body(buffer, body_start, &headers, true, line.status_code, limits)?
    else {
        return Ok(None);
    };

    Ok(Some((
        Response {
            line,
            headers,
            body,
        },
        body_start + body_len,
    )))
}

fn find_headers_end(buffer: &[u8], limits: Limits) -> Result<Option<usize>, ParseError> {
    match twoway::find_bytes(buffer, HEADER_TERMINATOR) {
        Some(index) if index > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        Some(index) => Ok(Some(index)),
        None if buffer.len() > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        None => Ok(None),
    }
}

fn find_line_end(buffer: &[u8], start: usize) -> Option<usize> {
    twoway::find_bytes(&buffer[start..], CRLF).map(|offset| start + offset)
}

pub(crate) fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset: 0,
    })?;

    let mut parts = text.split_whitespace();
    let method = parts.next().filter(|part| !part.is_empty());
    let target = parts.next();
    let version_raw = parts.next().unwrap_or("HTTP/1.1");

    let (Some(method), Some(target), None) = (method, target, parts.next()) else {
        return Err(ParseError {
            kind: ParseErrorKind::InvalidStartLine,
            offset: 0,
        });
    };

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: parse_http_version(version_raw),
    })
}

pub(crate) fn parse_status_line(line: &[u8]) -> Result<StatusLine, ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset: 0,
    })?;

    let mut parts = text.splitn(3, ' ');
    let version_raw = parts.next().unwrap_or("HTTP/1.1");
    let status_raw = parts.next().ok_or(ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset: 0,
    })?;
    let reason = parts.next().unwrap_or("");

    let status_code = status_raw.parse::<u16>().map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset: 0,
    })?;

    Ok(StatusLine {
        version: parse_http_version(version_raw),
        status_code,
        reason: reason.to_string(),
    })
}

pub(crate) fn parse_http_version(version_raw: &str) -> HttpVersion {
    match version_raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => HttpVersion::Other(other.to_string()),
    }
}

pub(crate) fn parse_header_block(bytes: &[u8]) -> Result<Vec<Header>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidHeaderBlock,
        offset: 0,
    })?;

    let mut headers: Vec<Header> = Vec::new();

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }

        // Obsolete line folding: continuation of the previous header value.
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
        }

        let mut parts = line.splitn(2, ':');
        let raw_name = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");

        headers.push(Header {
            name: raw_name.trim().to_string(),
            value: value.trim().to_string(),
            raw_name: raw_name.to_string(),
        });
    }

    Ok(headers)
}

fn parse_body(
    buffer: &[u8],
    body_start: usize,
    headers: &[Header],
    is_response: bool,
    status_code: u16,
    limits: Limits,
) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    if is_response && super::types::status_has_no_body(status_code) {
        return Ok(Some((Vec::new(), 0)));
    }

    if let Some(length) = content_length(headers) {
        if length > limits.max_body_bytes {
            return Err(ParseError {
                kind: ParseErrorKind::BodyTooLarge,
                offset: body_start,
            });
        }
        if buffer.len() < body_start + length {
            return Ok(None);
        }
        return Ok(Some((buffer[body_start..body_start + length].to_vec(), length)));
    }

    if is_chunked(headers) {
        return parse_chunked_body(buffer, body_start, limits);
    }

    Ok(Some((Vec::new(), 0)))
}

fn parse_chunked_body(
    buffer: &[u8],
    body_start: usize,
    limits: Limits,
) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    let mut cursor = body_start;
    let mut body = Vec::new();

    loop {
        let Some(line_end) = find_line_end(buffer, cursor) else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buffer[cursor..line_end]).map_err(|_| ParseError {
            kind: ParseErrorKind::InvalidChunkSize,
            offset: cursor,
        })?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| ParseError {
            kind: ParseErrorKind::InvalidChunkSize,
            offset: cursor,
        })?;
        cursor = line_end + CRLF.len();

        if size == 0 {
            if buffer.len() < cursor + CRLF.len() {
                return Ok(None);
            }
            if &buffer[cursor..cursor + CRLF.len()] != CRLF {
                return Err(ParseError {
                    kind: ParseErrorKind::InvalidChunkTerminator,
                    offset: cursor,
                });
            }
            cursor += CRLF.len();
            return Ok(Some((body, cursor - body_start)));
        }

        if body.len() + size > limits.max_body_bytes {
            return Err(ParseError {
                kind: ParseErrorKind::BodyTooLarge,
                offset: cursor,
            });
        }
        if buffer.len() < cursor + size + CRLF.len() {
            return Ok(None);
        }
        body.extend_from_slice(&buffer[cursor..cursor + size]);
        cursor += size;

        if &buffer[cursor..cursor + CRLF.len()] != CRLF {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidChunkTerminator,
                offset: cursor,
            });
        }
        cursor += CRLF.len();
    }
}
