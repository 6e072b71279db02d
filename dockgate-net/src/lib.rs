mod http1;

pub use http1::{
    header_has_token, status_has_no_body, Header, HttpVersion, Limits, ParseError, ParseErrorKind,
    ParseStatus, Request, RequestHead, RequestLine, RequestParser, RequestStreamEvent,
    RequestStreamParser, Response, ResponseHead, ResponseParser, ResponseStreamEvent,
    ResponseStreamParser, StatusLine,
};
pub use http1::{serialize_request, serialize_response};
