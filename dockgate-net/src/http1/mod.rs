mod parser;
mod stream;
mod types;
mod wire;

pub use parser::{ParseStatus, RequestParser, ResponseParser};
pub use stream::{
    RequestHead, RequestStreamEvent, RequestStreamParser, ResponseHead, ResponseStreamEvent,
    ResponseStreamParser,
};
pub use types::{
    header_has_token, status_has_no_body, Header, HttpVersion, Limits, ParseError, ParseErrorKind,
    Request, RequestLine, Response, StatusLine,
};
pub use wire::{serialize_request, serialize_response};
