use super::types::{content_length, is_chunked, Header, Request, Response};

/// Serializes a request in HTTP/1.1 wire form. `Content-Length` and
/// `Transfer-Encoding` are dropped from the header list and a Content-Length
/// matching the actual body is written instead, so a message whose body was
/// rewritten never goes out with stale framing.
pub fn serialize_request(request: &Request) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(256 + request.body.len());
    bytes.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            request.line.method,
            request.line.target,
            request.line.version.as_str()
        )
        .as_bytes(),
    );
    write_headers(&mut bytes, &request.headers, &request.body);
    bytes.extend_from_slice(&request.body);
    bytes
}

pub fn serialize_response(response: &Response) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(256 + response.body.len());
    bytes.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            response.line.version.as_str(),
            response.line.status_code,
            response.line.reason
        )
        .as_bytes(),
    );
    write_headers(&mut bytes, &response.headers, &response.body);
    bytes.extend_from_slice(&response.body);
    bytes
}

fn write_headers(bytes: &mut Vec<u8>, headers: &[Header], body: &[u8]) {
    let had_framing = content_length(headers).is_some() || is_chunked(headers);

    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length")
            || header.name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        bytes.extend_from_slice(header.raw_name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(header.value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }

    if !body.is_empty() || had_framing {
        bytes.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    bytes.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::{serialize_request, serialize_response};
    use crate::http1::{Header, HttpVersion, Request, RequestLine, Response, StatusLine};

    fn request(headers: Vec<Header>, body: &[u8]) -> Request {
        Request {
            line: RequestLine {
                method: "POST".to_string(),
                target: "/containers/create".to_string(),
                version: HttpVersion::Http11,
            },
            headers,
            body: body.to_vec(),
        }
    }

    #[test]
    fn recomputes_content_length_for_rewritten_body() {
        let message = request(
            vec![
                Header::new("Host", "docker"),
                Header::new("Content-Length", "2"),
            ],
            b"{\"Image\":\"alpine\"}",
        );

        let bytes = serialize_request(&message);
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("Content-Length: 18\r\n"));
        assert!(!text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"Image\":\"alpine\"}"));
    }

    #[test]
    fn strips_transfer_encoding_when_body_is_buffered() {
        let message = request(
            vec![
                Header::new("Host", "docker"),
                Header::new("Transfer-Encoding", "chunked"),
            ],
            b"hello",
        );

        let text = String::from_utf8(serialize_request(&message)).expect("utf8");
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(text.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn bodyless_request_stays_without_length() {
        let message = Request {
            line: RequestLine {
                method: "GET".to_string(),
                target: "/version".to_string(),
                version: HttpVersion::Http11,
            },
            headers: vec![Header::new("Host", "docker")],
            body: Vec::new(),
        };

        let text = String::from_utf8(serialize_request(&message)).expect("utf8");
        assert_eq!(text, "GET /version HTTP/1.1\r\nHost: docker\r\n\r\n");
    }

    #[test]
    fn preserves_header_order_and_case() {
        let message = request(
            vec![
                Header::new("Host", "docker"),
                Header::new("X-Registry-Auth", "token"),
                Header::new("User-Agent", "docker/24.0"),
            ],
            b"{}",
        );

        let text = String::from_utf8(serialize_request(&message)).expect("utf8");
        let host = text.find("Host:").expect("host");
        let auth = text.find("X-Registry-Auth:").expect("auth");
        let agent = text.find("User-Agent:").expect("agent");
        assert!(host < auth && auth < agent);
    }

    #[test]
    fn serializes_response_with_recomputed_length() {
        let message = Response {
            line: StatusLine {
                version: HttpVersion::Http11,
                status_code: 200,
                reason: "OK".to_string(),
            },
            headers: vec![
                Header::new("Content-Type", "application/json"),
                Header::new("Content-Length", "999"),
            ],
            body: b"{\"Version\":\"24.0.2\"}".to_vec(),
        };

        let text = String::from_utf8(serialize_response(&message)).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 20\r\n"));
    }
}
