use serde::de::DeserializeOwned;
use serde::Serialize;

use dockgate_net::{Request, Response};

use crate::filter::{FilterFailure, FilterResult};

/// Wraps a typed mutator into a request filter: the body is decoded as JSON
/// into `T`, the mutator runs, and the result is re-serialized into a
/// replacement request that inherits the original line and headers. A body
/// that does not decode is a critical `JSON` failure; the mutator's own
/// failure is propagated as returned.
pub fn as_json_request<T, F>(
    mutate: F,
) -> impl Fn(&Request, &[u8]) -> FilterResult<Request> + Send + Sync
where
    T: DeserializeOwned + Serialize,
    F: Fn(T) -> Result<T, FilterFailure> + Send + Sync,
{
    move |request, body| {
        let decoded: T = decode(body)?;
        let body = encode(&mutate(decoded)?)?;
        Ok(Some(Request {
            line: request.line.clone(),
            headers: request.headers.clone(),
            body,
        }))
    }
}

pub fn as_json_response<T, F>(
    mutate: F,
) -> impl Fn(&Response, &[u8]) -> FilterResult<Response> + Send + Sync
where
    T: DeserializeOwned + Serialize,
    F: Fn(T) -> Result<T, FilterFailure> + Send + Sync,
{
    move |response, body| {
        let decoded: T = decode(body)?;
        let body = encode(&mutate(decoded)?)?;
        Ok(Some(Response {
            line: response.line.clone(),
            headers: response.headers.clone(),
            body,
        }))
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, FilterFailure> {
    serde_json::from_slice(body).map_err(|err| FilterFailure::critical("JSON", err.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FilterFailure> {
    serde_json::to_vec(value).map_err(|err| FilterFailure::critical("JSON", err.to_string()))
}
