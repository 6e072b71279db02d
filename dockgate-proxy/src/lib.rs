mod engine;
mod error;
mod filter;
mod json;
mod listener;
pub mod logging;
mod proxy;
mod reject;

pub use error::ProxyError;
pub use filter::{FilterFailure, FilterKind, FilterResult};
pub use json::{as_json_request, as_json_response};
pub use listener::{BoxedConn, Conn, Listener};
pub use logging::LogLevel;
pub use proxy::{DialFuture, Dialer, Proxy};

pub use dockgate_net::{Header, HttpVersion, Request, RequestLine, Response, StatusLine};
