use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use dockgate_net::{
    header_has_token, serialize_request, serialize_response, ParseError, ParseStatus, RequestHead,
    RequestParser, RequestStreamEvent, RequestStreamParser, Response, ResponseHead, ResponseParser,
    ResponseStreamEvent, ResponseStreamParser, StatusLine,
};

use crate::error::ProxyError;
use crate::filter::{
    request_path, run_request_chain, run_response_chain, ChainOutcome, FilterFailure,
};
use crate::listener::BoxedConn;
use crate::proxy::ProxyCore;
use crate::reject;

const READ_BUFFER: usize = 8192;

/// Docker endpoint families whose responses keep flowing until the daemon is
/// done with them: attach/exec streams, build output, the event firehose,
/// followed logs, and the start/wait calls tied to them.
const STREAMING_PATH_MARKERS: &[&str] = &[
    "/attach", "/build", "/events", "/exec", "/logs", "/start", "/wait",
];

pub(crate) fn is_streaming_path(path: &str) -> bool {
    STREAMING_PATH_MARKERS
        .iter()
        .any(|marker| path.contains(marker))
}

enum Served {
    Closed,
    Hijacked,
}

enum ResponseEnd {
    KeepAlive,
    Close,
    Hijacked,
}

pub(crate) struct Engine {
    core: Arc<ProxyCore>,
    downstream: BoxedConn,
    upstream: Option<BoxedConn>,
    pending: Vec<u8>,
    close_after_response: bool,
    log: String,
}

impl Engine {
    pub(crate) fn new(core: Arc<ProxyCore>, downstream: BoxedConn, log: String) -> Self {
        Self {
            core,
            downstream,
            upstream: None,
            pending: Vec::new(),
            close_after_response: false,
            log,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.serve().await {
            Ok(Served::Closed) => debug!(conn = %self.log, "connection finished"),
            Ok(Served::Hijacked) => {
                let Engine {
                    downstream,
                    upstream,
                    log,
                    ..
                } = self;
                if let Some(upstream) = upstream {
                    raw_relay(downstream, upstream, &log).await;
                }
                return;
            }
            Err(ProxyError::Io(err)) => info!(conn = %self.log, "connection closed: {err}"),
            Err(err) => error!(conn = %self.log, "connection failed: {err}"),
        }

        let _ = self.downstream.shutdown().await;
        if let Some(mut upstream) = self.upstream.take() {
            let _ = upstream.shutdown().await;
        }
    }

    async fn serve(&mut self) -> Result<Served, ProxyError> {
        loop {
            let mut parser = RequestStreamParser::with_limits(self.core.limits);
            let mut acc: Vec<u8> = std::mem::take(&mut self.pending);
            let mut found: Option<RequestHead> = None;
            let mut request_done = false;
            let mut buf = vec![0u8; READ_BUFFER];

            if !acc.is_empty() {
                for event in parser.push(&acc).map_err(decode_error)? {
                    collect_request_event(event, &mut found, &mut request_done);
                }
            }

            let head = loop {
                if let Some(head) = found.take() {
                    break head;
                }
                let n = self.downstream.read(&mut buf).await?;
                if n == 0 {
                    return if acc.is_empty() {
                        Ok(Served::Closed)
                    } else {
                        Err(ProxyError::Runtime(
                            "downstream closed mid-request".to_string(),
                        ))
                    };
                }
                acc.extend_from_slice(&buf[..n]);
                for event in parser.push(&buf[..n]).map_err(decode_error)? {
                    collect_request_event(event, &mut found, &mut request_done);
                }
            };

            if head.expect_continue {
                debug!(conn = %self.log, "declining expect-continue request");
                self.downstream
                    .write_all(&reject::expectation_failed_response())
                    .await?;
                self.downstream.flush().await?;
                return Ok(Served::Closed);
            }

            let path = request_path(&head.target);
            debug!(conn = %self.log, method = %head.method, path = %path, "request received");

            if head.connection_close {
                self.close_after_response = true;
            }

            if head.chunked {
                debug!(
                    conn = %self.log,
                    path = %path,
                    "streaming request body, request filters bypassed"
                );
                if !self
                    .forward_streaming_request(&mut parser, acc, request_done)
                    .await?
                {
                    return Ok(Served::Closed);
                }
            } else {
                while !request_done {
                    let n = self.downstream.read(&mut buf).await?;
                    if n == 0 {
                        return Err(ProxyError::Runtime(
                            "downstream closed mid-request".to_string(),
                        ));
                    }
                    acc.extend_from_slice(&buf[..n]);
                    for event in parser.push(&buf[..n]).map_err(decode_error)? {
                        if matches!(event, RequestStreamEvent::EndOfMessage) {
                            request_done = true;
                        }
                    }
                }
                self.pending = parser.take_trailing();
                acc.truncate(acc.len() - self.pending.len());

                let request = match RequestParser::with_limits(self.core.limits).push(&acc) {
                    ParseStatus::Complete { message } => message,
                    ParseStatus::NeedMore => {
                        return Err(ProxyError::Runtime("truncated request".to_string()));
                    }
                    ParseStatus::Error { error } => return Err(decode_error(error)),
                };

                let handlers = self.core.handlers.snapshot();
                let request = match run_request_chain(&handlers, &path, request, &self.log) {
                    ChainOutcome::Forward(request) => request,
                    ChainOutcome::Rejected(failure) => {
                        warn!(conn = %self.log, path = %path, "request rejected: {failure}");
                        reject::write_failure(&mut self.downstream, &failure).await?;
                        return Ok(Served::Closed);
                    }
                };

                if !self.ensure_upstream().await? {
                    return Ok(Served::Closed);
                }
                let wire = serialize_request(&request);
                let upstream = self.upstream_mut()?;
                upstream.write_all(&wire).await?;
                upstream.flush().await?;
            }

            match self.relay_response(&path).await? {
                ResponseEnd::Hijacked => return Ok(Served::Hijacked),
                ResponseEnd::Close => return Ok(Served::Closed),
                ResponseEnd::KeepAlive => {
                    if self.close_after_response {
                        return Ok(Served::Closed);
                    }
                }
            }
        }
    }

    /// Dials the upstream if this connection has none yet. A failed dial is
    /// reported to the client as a synthetic 400 and ends the connection.
    async fn ensure_upstream(&mut self) -> Result<bool, ProxyError> {
        if self.upstream.is_some() {
            return Ok(true);
        }
        match self.core.dial().await {
            Ok(conn) => {
                debug!(conn = %self.log, "dialed upstream");
                self.upstream = Some(conn);
                Ok(true)
            }
            Err(err) => {
                warn!(conn = %self.log, "upstream dial failed: {err}");
                let failure = FilterFailure::critical("Upstream", err.to_string());
                reject::write_failure(&mut self.downstream, &failure).await?;
                Ok(false)
            }
        }
    }

    fn upstream_mut(&mut self) -> Result<&mut BoxedConn, ProxyError> {
        self.upstream
            .as_mut()
            .ok_or_else(|| ProxyError::Runtime("no upstream connection".to_string()))
    }

    /// Relays a chunked request body upstream without buffering it. Bytes
    /// already read past the end of the message stay queued for the next
    /// exchange.
    async fn forward_streaming_request(
        &mut self,
        parser: &mut RequestStreamParser,
        mut acc: Vec<u8>,
        mut done: bool,
    ) -> Result<bool, ProxyError> {
        if !self.ensure_upstream().await? {
            return Ok(false);
        }
        if done {
            self.pending = parser.take_trailing();
            acc.truncate(acc.len() - self.pending.len());
        }

        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| ProxyError::Runtime("no upstream connection".to_string()))?;
        upstream.write_all(&acc).await?;

        let mut buf = vec![0u8; READ_BUFFER];
        while !done {
            let n = self.downstream.read(&mut buf).await?;
            if n == 0 {
                return Err(ProxyError::Runtime(
                    "downstream closed mid-request".to_string(),
                ));
            }
            let events = parser.push(&buf[..n]).map_err(decode_error)?;
            if events
                .iter()
                .any(|event| matches!(event, RequestStreamEvent::EndOfMessage))
            {
                done = true;
                self.pending = parser.take_trailing();
                upstream.write_all(&buf[..n - self.pending.len()]).await?;
            } else {
                upstream.write_all(&buf[..n]).await?;
            }
        }
        upstream.flush().await?;
        Ok(true)
    }

    async fn relay_response(&mut self, path: &str) -> Result<ResponseEnd, ProxyError> {
        let mut parser = ResponseStreamParser::with_limits(self.core.limits);
        let mut acc: Vec<u8> = Vec::new();
        let mut found: Option<ResponseHead> = None;
        let mut done = false;
        let mut buf = vec![0u8; READ_BUFFER];

        let head = loop {
            if let Some(head) = found.take() {
                break head;
            }
            let upstream = self.upstream_mut()?;
            let n = upstream.read(&mut buf).await?;
            if n == 0 {
                return Err(ProxyError::Runtime(
                    "upstream closed before response".to_string(),
                ));
            }
            acc.extend_from_slice(&buf[..n]);
            for event in parser.push(&buf[..n]).map_err(decode_error)? {
                collect_response_event(event, &mut found, &mut done);
            }
        };

        if head.status_code == 101 || header_has_token(&head.headers, "connection", "upgrade") {
            info!(
                conn = %self.log,
                path = %path,
                status = head.status_code,
                "switching to raw byte relay"
            );
            self.downstream.write_all(&acc).await?;
            self.downstream.flush().await?;
            if !self.pending.is_empty() {
                let pending = std::mem::take(&mut self.pending);
                let upstream = self.upstream_mut()?;
                upstream.write_all(&pending).await?;
                upstream.flush().await?;
            }
            return Ok(ResponseEnd::Hijacked);
        }

        if (head.chunked && is_streaming_path(path)) || head.close_delimited {
            return self.stream_response(path, head, parser, acc, done).await;
        }

        while !done {
            let upstream = self.upstream_mut()?;
            let n = upstream.read(&mut buf).await?;
            if n == 0 {
                return Err(ProxyError::Runtime(
                    "upstream closed mid-response".to_string(),
                ));
            }
            acc.extend_from_slice(&buf[..n]);
            for event in parser.push(&buf[..n]).map_err(decode_error)? {
                if matches!(event, ResponseStreamEvent::EndOfMessage) {
                    done = true;
                }
            }
        }
        let trailing = parser.take_trailing();
        acc.truncate(acc.len() - trailing.len());

        let response = match ResponseParser::with_limits(self.core.limits).push(&acc) {
            ParseStatus::Complete { message } => message,
            ParseStatus::NeedMore => {
                return Err(ProxyError::Runtime("truncated response".to_string()));
            }
            ParseStatus::Error { error } => return Err(decode_error(error)),
        };

        let handlers = self.core.handlers.snapshot();
        let response = match run_response_chain(&handlers, path, response, &self.log) {
            ChainOutcome::Forward(response) => response,
            ChainOutcome::Rejected(failure) => {
                warn!(conn = %self.log, path = %path, "response rejected: {failure}");
                reject::write_failure(&mut self.downstream, &failure).await?;
                return Ok(ResponseEnd::Close);
            }
        };

        let wire = serialize_response(&response);
        self.downstream.write_all(&wire).await?;
        self.downstream.flush().await?;

        Ok(if head.connection_close {
            ResponseEnd::Close
        } else {
            ResponseEnd::KeepAlive
        })
    }

    /// Streams a response through unchanged. The filter chain still runs,
    /// against the header frame with an empty body; a replacement returned
    /// here has nowhere to go and is dropped with a warning.
    async fn stream_response(
        &mut self,
        path: &str,
        head: ResponseHead,
        mut parser: ResponseStreamParser,
        acc: Vec<u8>,
        mut done: bool,
    ) -> Result<ResponseEnd, ProxyError> {
        let probe = Response {
            line: StatusLine {
                version: head.version.clone(),
                status_code: head.status_code,
                reason: head.reason.clone(),
            },
            headers: head.headers.clone(),
            body: Vec::new(),
        };

        let handlers = self.core.handlers.snapshot();
        match run_response_chain(&handlers, path, probe.clone(), &self.log) {
            ChainOutcome::Forward(forwarded) => {
                if forwarded != probe {
                    warn!(
                        conn = %self.log,
                        path = %path,
                        "replacement for streaming response ignored"
                    );
                }
            }
            ChainOutcome::Rejected(failure) => {
                warn!(conn = %self.log, path = %path, "response rejected: {failure}");
                reject::write_failure(&mut self.downstream, &failure).await?;
                return Ok(ResponseEnd::Close);
            }
        }

        self.downstream.write_all(&acc).await?;

        let mut buf = vec![0u8; READ_BUFFER];
        let mut upstream_eof = false;
        while !done {
            let upstream = self.upstream_mut()?;
            let n = upstream.read(&mut buf).await?;
            if n == 0 {
                if let Ok(events) = parser.push_eof() {
                    done = events
                        .iter()
                        .any(|event| matches!(event, ResponseStreamEvent::EndOfMessage));
                }
                upstream_eof = true;
                break;
            }
            let events = parser.push(&buf[..n]).map_err(decode_error)?;
            if events
                .iter()
                .any(|event| matches!(event, ResponseStreamEvent::EndOfMessage))
            {
                done = true;
                let trailing = parser.take_trailing();
                self.downstream.write_all(&buf[..n - trailing.len()]).await?;
            } else {
                self.downstream.write_all(&buf[..n]).await?;
            }
        }
        self.downstream.flush().await?;

        if upstream_eof || head.close_delimited || head.connection_close {
            return Ok(ResponseEnd::Close);
        }
        Ok(ResponseEnd::KeepAlive)
    }
}

fn collect_request_event(
    event: RequestStreamEvent,
    found: &mut Option<RequestHead>,
    done: &mut bool,
) {
    match event {
        RequestStreamEvent::Headers(head) => *found = Some(head),
        RequestStreamEvent::EndOfMessage => *done = true,
        RequestStreamEvent::BodyBytes { .. } => {}
    }
}

fn collect_response_event(
    event: ResponseStreamEvent,
    found: &mut Option<ResponseHead>,
    done: &mut bool,
) {
    match event {
        ResponseStreamEvent::Headers(head) => *found = Some(head),
        ResponseStreamEvent::EndOfMessage => *done = true,
        ResponseStreamEvent::BodyBytes { .. } => {}
    }
}

fn decode_error(error: ParseError) -> ProxyError {
    ProxyError::Runtime(format!(
        "HTTP parse error {:?} at offset {}",
        error.kind, error.offset
    ))
}

/// Two unidirectional pumps; when either direction ends the other is torn
/// down and both sockets close with the tasks joined.
async fn raw_relay(downstream: BoxedConn, upstream: BoxedConn, log: &str) {
    let (mut down_read, mut down_write) = tokio::io::split(downstream);
    let (mut up_read, mut up_write) = tokio::io::split(upstream);

    let mut client_to_upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut down_read, &mut up_write).await;
        let _ = up_write.shutdown().await;
        copied
    });
    let mut upstream_to_client = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut up_read, &mut down_write).await;
        let _ = down_write.shutdown().await;
        copied
    });

    tokio::select! {
        _ = &mut client_to_upstream => {
            upstream_to_client.abort();
            let _ = upstream_to_client.await;
        }
        _ = &mut upstream_to_client => {
            client_to_upstream.abort();
            let _ = client_to_upstream.await;
        }
    }
    debug!(conn = %log, "raw relay finished");
}
