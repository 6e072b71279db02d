use std::sync::{Arc, RwLock};

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use dockgate_net::{Request, Response};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Request,
    Response,
}

/// Outcome a filter reports instead of a replacement: `Critical` aborts the
/// exchange with a client-visible 400, `Soft` is logged and the exchange
/// proceeds unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterFailure {
    #[error("{category}: {message}")]
    Critical { category: String, message: String },
    #[error("{category}: {message}")]
    Soft { category: String, message: String },
}

impl FilterFailure {
    pub fn critical(category: impl Into<String>, message: impl Into<String>) -> Self {
        FilterFailure::Critical {
            category: category.into(),
            message: message.into(),
        }
    }

    pub fn soft(category: impl Into<String>, message: impl Into<String>) -> Self {
        FilterFailure::Soft {
            category: category.into(),
            message: message.into(),
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, FilterFailure::Critical { .. })
    }

    pub fn category(&self) -> &str {
        match self {
            FilterFailure::Critical { category, .. } | FilterFailure::Soft { category, .. } => {
                category
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            FilterFailure::Critical { message, .. } | FilterFailure::Soft { message, .. } => {
                message
            }
        }
    }
}

pub type FilterResult<T> = Result<Option<T>, FilterFailure>;

pub(crate) type RequestFilterFn =
    dyn Fn(&Request, &[u8]) -> FilterResult<Request> + Send + Sync;
pub(crate) type ResponseFilterFn =
    dyn Fn(&Response, &[u8]) -> FilterResult<Response> + Send + Sync;

pub(crate) enum FilterFn {
    Request(Box<RequestFilterFn>),
    Response(Box<ResponseFilterFn>),
}

pub(crate) struct Handler {
    pattern: Regex,
    filter: FilterFn,
}

impl Handler {
    pub(crate) fn request<F>(pattern: &str, filter: F) -> Result<Self, ProxyError>
    where
        F: Fn(&Request, &[u8]) -> FilterResult<Request> + Send + Sync + 'static,
    {
        Ok(Self {
            pattern: compile(pattern)?,
            filter: FilterFn::Request(Box::new(filter)),
        })
    }

    pub(crate) fn response<F>(pattern: &str, filter: F) -> Result<Self, ProxyError>
    where
        F: Fn(&Response, &[u8]) -> FilterResult<Response> + Send + Sync + 'static,
    {
        Ok(Self {
            pattern: compile(pattern)?,
            filter: FilterFn::Response(Box::new(filter)),
        })
    }

    pub(crate) fn kind(&self) -> FilterKind {
        match self.filter {
            FilterFn::Request(_) => FilterKind::Request,
            FilterFn::Response(_) => FilterKind::Response,
        }
    }

    fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

fn compile(pattern: &str) -> Result<Regex, ProxyError> {
    Regex::new(pattern).map_err(|err| ProxyError::Config(format!("invalid pattern: {err}")))
}

/// Append-only handler list. Chains run over a snapshot taken when dispatch
/// starts; handlers registered afterwards apply from the next message on.
#[derive(Default)]
pub(crate) struct HandlerSet {
    handlers: RwLock<Vec<Arc<Handler>>>,
}

impl HandlerSet {
    pub(crate) fn append(&self, handler: Handler) {
        self.handlers
            .write()
            .expect("handler list poisoned")
            .push(Arc::new(handler));
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Handler>> {
        self.handlers
            .read()
            .expect("handler list poisoned")
            .clone()
    }
}

pub(crate) enum ChainOutcome<T> {
    Forward(T),
    Rejected(FilterFailure),
}

pub(crate) fn run_request_chain(
    handlers: &[Arc<Handler>],
    path: &str,
    request: Request,
    conn: &str,
) -> ChainOutcome<Request> {
    let mut current = request;

    for handler in handlers {
        let FilterFn::Request(filter) = &handler.filter else {
            continue;
        };
        if !handler.matches(path) {
            continue;
        }
        match filter(&current, &current.body) {
            Ok(Some(replacement)) => current = replacement,
            Ok(None) => {}
            Err(failure) if failure.is_critical() => return ChainOutcome::Rejected(failure),
            Err(failure) => warn!(conn = %conn, path = %path, "request filter warning: {failure}"),
        }
    }

    ChainOutcome::Forward(current)
}

pub(crate) fn run_response_chain(
    handlers: &[Arc<Handler>],
    path: &str,
    response: Response,
    conn: &str,
) -> ChainOutcome<Response> {
    let mut current = response;

    for handler in handlers {
        let FilterFn::Response(filter) = &handler.filter else {
            continue;
        };
        if !handler.matches(path) {
            continue;
        }
        match filter(&current, &current.body) {
            Ok(Some(replacement)) => current = replacement,
            Ok(None) => {}
            Err(failure) if failure.is_critical() => return ChainOutcome::Rejected(failure),
            Err(failure) => warn!(conn = %conn, path = %path, "response filter warning: {failure}"),
        }
    }

    ChainOutcome::Forward(current)
}

/// Path component of a request target, query and fragment excluded.
pub(crate) fn request_path(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        if let Ok(url) = url::Url::parse(target) {
            return url.path().to_string();
        }
    }
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    path.split_once('#').map_or(path, |(path, _)| path).to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{
        request_path, run_request_chain, ChainOutcome, FilterFailure, FilterKind, Handler,
        HandlerSet,
    };
    use dockgate_net::{Header, HttpVersion, Request, RequestLine};

    fn request(target: &str, body: &[u8]) -> Request {
        Request {
            line: RequestLine {
                method: "POST".to_string(),
                target: target.to_string(),
                version: HttpVersion::Http11,
            },
            headers: vec![Header::new("Host", "docker")],
            body: body.to_vec(),
        }
    }

    fn replace_body(request: &Request, body: &[u8]) -> Request {
        Request {
            line: request.line.clone(),
            headers: request.headers.clone(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let set = HandlerSet::default();
        set.append(
            Handler::request("/containers", |request, _body| {
                Ok(Some(replace_body(request, b"first")))
            })
            .expect("handler"),
        );
        set.append(
            Handler::request("", |request, body| {
                assert_eq!(body, b"first");
                let mut body = body.to_vec();
                body.extend_from_slice(b"+second");
                Ok(Some(replace_body(request, &body)))
            })
            .expect("handler"),
        );

        let outcome = run_request_chain(
            &set.snapshot(),
            "/containers/create",
            request("/containers/create", b"original"),
            "test",
        );
        let ChainOutcome::Forward(forwarded) = outcome else {
            panic!("expected forward");
        };
        assert_eq!(forwarded.body, b"first+second");
    }

    #[test]
    fn critical_failure_stops_the_chain() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let late = Arc::clone(&invoked);

        let set = HandlerSet::default();
        set.append(
            Handler::request("", |_request, _body| {
                Err(FilterFailure::critical("Policy", "refused"))
            })
            .expect("handler"),
        );
        set.append(
            Handler::request("", move |_request, _body| {
                late.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .expect("handler"),
        );

        let outcome = run_request_chain(
            &set.snapshot(),
            "/services/create",
            request("/services/create", b"{}"),
            "test",
        );
        let ChainOutcome::Rejected(failure) = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(failure.to_string(), "Policy: refused");
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn soft_failure_keeps_the_original_message() {
        let set = HandlerSet::default();
        set.append(
            Handler::request("", |_request, _body| {
                Err(FilterFailure::soft("Advice", "add replicas"))
            })
            .expect("handler"),
        );

        let outcome = run_request_chain(
            &set.snapshot(),
            "/services/create",
            request("/services/create", b"spec"),
            "test",
        );
        let ChainOutcome::Forward(forwarded) = outcome else {
            panic!("expected forward");
        };
        assert_eq!(forwarded.body, b"spec");
    }

    #[test]
    fn same_handler_registered_twice_runs_twice() {
        let count = Arc::new(AtomicUsize::new(0));
        let set = HandlerSet::default();
        for _ in 0..2 {
            let count = Arc::clone(&count);
            set.append(
                Handler::request("/version", move |_request, _body| {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .expect("handler"),
            );
        }

        run_request_chain(
            &set.snapshot(),
            "/v1.40/version",
            request("/v1.40/version", b""),
            "test",
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pattern_matches_anywhere_in_path() {
        let handler =
            Handler::request("/containers/.+/exec", |_request, _body| Ok(None)).expect("handler");
        assert!(handler.matches("/v1.40/containers/abcd/exec"));
        assert!(!handler.matches("/v1.40/containers/create"));
        assert_eq!(handler.kind(), FilterKind::Request);
    }

    #[test]
    fn empty_pattern_matches_every_path() {
        let handler = Handler::request("", |_request, _body| Ok(None)).expect("handler");
        assert!(handler.matches("/anything"));
        assert!(handler.matches("/"));
    }

    #[test]
    fn registrations_are_visible_to_later_snapshots_only() {
        let set = HandlerSet::default();
        let before = set.snapshot();
        set.append(Handler::request("", |_request, _body| Ok(None)).expect("handler"));
        assert!(before.is_empty());
        assert_eq!(set.snapshot().len(), 1);
    }

    #[test]
    fn path_extraction_strips_query_and_host() {
        assert_eq!(request_path("/v1.40/version?verbose=1"), "/v1.40/version");
        assert_eq!(
            request_path("http://docker/v1.40/containers/json?all=1"),
            "/v1.40/containers/json"
        );
        assert_eq!(request_path("/_ping"), "/_ping");
    }
}
