use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::filter::FilterFailure;

/// The synthetic response served when a filter rejects an exchange or the
/// upstream cannot be reached. Always single-use: the connection closes
/// after it is written.
pub(crate) fn failure_response(category: &str, message: &str) -> Vec<u8> {
    let body = format!("{category}: {message}");
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes()
}

pub(crate) fn expectation_failed_response() -> Vec<u8> {
    b"HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
}

pub(crate) async fn write_failure<W>(writer: &mut W, failure: &FilterFailure) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = failure_response(failure.category(), failure.message());
    writer.write_all(&response).await?;
    writer.flush().await
}
