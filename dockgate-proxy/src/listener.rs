use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};

use crate::error::ProxyError;

pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// An accepting socket handed to the proxy. Binding stays with the caller
/// (or the `bind_*` helpers); the proxy only accepts.
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind_tcp(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ProxyError::Config(format!("failed to bind {addr}: {err}")))?;
        Ok(Listener::Tcp(listener))
    }

    /// Binds a Unix socket, unlinking a stale socket file first.
    pub fn bind_unix(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ProxyError::Config(format!(
                    "failed to remove stale socket {}: {err}",
                    path.display()
                )));
            }
        }
        let listener = UnixListener::bind(path).map_err(|err| {
            ProxyError::Config(format!("failed to bind {}: {err}", path.display()))
        })?;
        Ok(Listener::Unix {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> io::Result<(BoxedConn, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), format!("unix:{}", path.display())))
            }
        }
    }

    pub fn local_description(&self) -> String {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|addr| format!("tcp:{addr}"))
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Listener::Unix { path, .. } => format!("unix:{}", path.display()),
        }
    }

    pub fn local_tcp_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }
}

pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}
