use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use dockgate_net::{Limits, Request, Response};

use crate::engine::Engine;
use crate::error::ProxyError;
use crate::filter::{FilterResult, Handler, HandlerSet};
use crate::listener::{is_transient_accept_error, BoxedConn, Listener};

pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send>>;
pub type Dialer = Box<dyn Fn() -> DialFuture + Send + Sync>;

pub(crate) struct ProxyCore {
    pub(crate) dialer: Dialer,
    pub(crate) handlers: HandlerSet,
    pub(crate) limits: Limits,
    connections: AtomicU64,
}

impl ProxyCore {
    pub(crate) async fn dial(&self) -> io::Result<BoxedConn> {
        (self.dialer)().await
    }

    fn next_connection_id(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The proxy facade: owns the upstream dialer and the handler registry,
/// accepts connections from every registered listener, and runs one engine
/// task per accepted connection.
pub struct Proxy {
    core: Arc<ProxyCore>,
    listener_tx: mpsc::UnboundedSender<(String, Listener)>,
    listener_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, Listener)>>>,
}

impl Proxy {
    pub fn new(dialer: Dialer) -> Self {
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(ProxyCore {
                dialer,
                handlers: HandlerSet::default(),
                limits: Limits::default(),
                connections: AtomicU64::new(0),
            }),
            listener_tx,
            listener_rx: Mutex::new(Some(listener_rx)),
        }
    }

    /// Dialer for the Docker daemon's Unix socket.
    pub fn unix_dialer(path: impl Into<PathBuf>) -> Dialer {
        let path = path.into();
        Box::new(move || {
            let path = path.clone();
            Box::pin(async move {
                let stream = UnixStream::connect(&path).await?;
                Ok(Box::new(stream) as BoxedConn)
            })
        })
    }

    /// Dialer for a TCP-exposed daemon.
    pub fn tcp_dialer(addr: impl Into<String>) -> Dialer {
        let addr = addr.into();
        Box::new(move || {
            let addr = addr.clone();
            Box::pin(async move {
                let stream = TcpStream::connect(&addr).await?;
                Ok(Box::new(stream) as BoxedConn)
            })
        })
    }

    /// Adds an accepting socket. Works before and during `process`; a
    /// listener added while the proxy runs starts accepting immediately.
    pub fn add_listener(&self, log_prefix: &str, listener: Listener) {
        let _ = self.listener_tx.send((log_prefix.to_string(), listener));
    }

    /// Registers a request filter; alias of `filter_requests`.
    pub fn handle<F>(&self, pattern: &str, filter: F) -> Result<(), ProxyError>
    where
        F: Fn(&Request, &[u8]) -> FilterResult<Request> + Send + Sync + 'static,
    {
        self.filter_requests(pattern, filter)
    }

    pub fn filter_requests<F>(&self, pattern: &str, filter: F) -> Result<(), ProxyError>
    where
        F: Fn(&Request, &[u8]) -> FilterResult<Request> + Send + Sync + 'static,
    {
        self.core.handlers.append(Handler::request(pattern, filter)?);
        Ok(())
    }

    pub fn filter_responses<F>(&self, pattern: &str, filter: F) -> Result<(), ProxyError>
    where
        F: Fn(&Response, &[u8]) -> FilterResult<Response> + Send + Sync + 'static,
    {
        self.core
            .handlers
            .append(Handler::response(pattern, filter)?);
        Ok(())
    }

    /// Accepts connections until every listener has permanently failed, then
    /// returns the last listener error.
    pub async fn process(&self) -> Result<(), ProxyError> {
        let mut listener_rx = self
            .listener_rx
            .lock()
            .expect("listener channel poisoned")
            .take()
            .ok_or_else(|| ProxyError::Config("process() is already running".to_string()))?;

        let mut accept_tasks: JoinSet<(String, ProxyError)> = JoinSet::new();
        let mut last_error: Option<ProxyError> = None;

        loop {
            tokio::select! {
                added = listener_rx.recv() => {
                    if let Some((prefix, listener)) = added {
                        info!(listener = %listener.local_description(), "listener registered");
                        let core = Arc::clone(&self.core);
                        accept_tasks.spawn(accept_loop(core, prefix, listener));
                    }
                }
                finished = accept_tasks.join_next(), if !accept_tasks.is_empty() => {
                    match finished {
                        Some(Ok((listener, err))) => {
                            warn!(listener = %listener, "listener stopped: {err}");
                            last_error = Some(err);
                        }
                        Some(Err(join_err)) => {
                            last_error = Some(ProxyError::Runtime(format!(
                                "listener task failed: {join_err}"
                            )));
                        }
                        None => {}
                    }
                    if accept_tasks.is_empty() {
                        return Err(last_error.unwrap_or_else(|| {
                            ProxyError::Runtime("all listeners stopped".to_string())
                        }));
                    }
                }
            }
        }
    }
}

async fn accept_loop(
    core: Arc<ProxyCore>,
    prefix: String,
    listener: Listener,
) -> (String, ProxyError) {
    let description = listener.local_description();
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                let id = core.next_connection_id();
                let log = if prefix.is_empty() {
                    format!("conn-{id}")
                } else {
                    format!("{prefix}-{id}")
                };
                debug!(conn = %log, peer = %peer, "accepted connection");
                tokio::spawn(Engine::new(Arc::clone(&core), conn, log).run());
            }
            Err(err) if is_transient_accept_error(&err) => {
                warn!(listener = %description, "transient accept failure: {err}");
            }
            Err(err) => {
                warn!(listener = %description, "listener failed: {err}");
                return (description, ProxyError::Io(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Proxy;

    fn null_dialer() -> super::Dialer {
        Box::new(|| {
            Box::pin(async {
                Err::<crate::BoxedConn, _>(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "no upstream in this test",
                ))
            })
        })
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let proxy = Proxy::new(null_dialer());
        let result = proxy.handle("/containers/(unclosed", |_request, _body| Ok(None));
        assert!(matches!(result, Err(crate::ProxyError::Config(_))));
    }

    #[test]
    fn registration_accepts_request_and_response_filters() {
        let proxy = Proxy::new(null_dialer());
        proxy
            .filter_requests("/containers/create", |_request, _body| Ok(None))
            .expect("request filter");
        proxy
            .filter_responses("/.*", |_response, _body| Ok(None))
            .expect("response filter");
    }

    #[tokio::test]
    async fn process_cannot_run_twice() {
        let proxy = std::sync::Arc::new(Proxy::new(null_dialer()));
        let running = std::sync::Arc::clone(&proxy);
        let first = tokio::spawn(async move { running.process().await });
        tokio::task::yield_now().await;

        let second = proxy.process().await;
        assert!(matches!(second, Err(crate::ProxyError::Config(_))));
        first.abort();
    }
}
