use http::{HeaderValue, Method, StatusCode};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::Prebuffered;

/// Parsed HTTP/1.x request head: request line plus header section.
///
/// The relay only ever needs enough of the request to route it (the `Host`
/// header); the head is peeked, never consumed, so the bytes can be replayed
/// verbatim into the paired exposer socket.
#[derive(Debug)]
pub struct HttpHead {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target as received (origin-form for tunneled clients).
    pub target: String,
    /// Raw header map as received.
    pub headers: http::HeaderMap<http::HeaderValue>,
}

impl HttpHead {
    /// The `Host` header with any `:port` suffix stripped.
    pub fn host(&self) -> Option<&str> {
        let raw = self.headers.get(http::header::HOST)?.to_str().ok()?;
        Some(strip_port(raw))
    }

    /// Reads and parses the request line and header section.
    ///
    /// Does not remove the header section from `reader`.
    /// Returns the length of the header section and the head.
    /// Returns [`io::ErrorKind::OutOfMemory`] if the header section exceeds
    /// the buffer limit.
    pub async fn peek(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<(usize, Self)> {
        loop {
            if let Some(head) = Self::parse_with_len(reader.buffer())? {
                return Ok(head);
            }
            if reader.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "Buffer size limit reached before end of request header section",
                )
                .into());
            }
            if reader.buffer_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed before end of request header section",
                )
                .into());
            }
        }
    }

    /// Parses a request head from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the head.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method_str = req.method.context("Missing HTTP method")?;
                let method = method_str.parse().std_context("Invalid HTTP method")?;
                let target = req.path.context("Missing request target")?.to_string();
                let headers = http::HeaderMap::from_iter(req.headers.iter_mut().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        target,
                        headers,
                    },
                )))
            }
        }
    }
}

/// Strips a trailing `:port` from a `Host` header value.
///
/// Bracketed IPv6 literals keep their brackets; a lone colon with a
/// non-numeric suffix is left untouched.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        return match stripped.split_once(']') {
            Some((addr, _)) => addr,
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Whether a complete preface line is a plausible HTTP/1.x request line.
///
/// Anything that is neither a control line nor of the shape
/// `TOKEN SP TARGET SP HTTP/x.y` gets a `400 Bad Request`.
pub(crate) fn is_http_request_line(line: &[u8]) -> bool {
    let Ok(line) = std::str::from_utf8(line) else {
        return false;
    };
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    !method.is_empty()
        && method
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b == b'-' || b == b'_')
        && !target.is_empty()
        && version.starts_with("HTTP/")
}

/// An HTTP/1.1 response the relay or exposer writes by hand.
///
/// Everything the tunnel core says to a misrouted or misbehaving client fits
/// in a status line, a couple of headers, and an optional small body.
#[derive(derive_more::Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received or to be written.
    pub headers: http::HeaderMap<http::HeaderValue>,
    /// Response body, written with a matching `Content-Length`.
    #[debug("{} bytes", body.len())]
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub(crate) fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: http::HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub(crate) fn html(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status).body("text/html; charset=utf-8", body)
    }

    pub(crate) fn text(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status).body("text/plain; charset=utf-8", body)
    }

    pub(crate) fn body(mut self, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
        self
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.reason
                .as_deref()
                .or(self.status.canonical_reason())
                .unwrap_or("")
        )
    }

    /// Writes the complete response, including `Content-Length` and body.
    pub(crate) async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        writer.write_all(self.status_line().as_bytes()).await?;
        for (key, value) in self.headers.iter() {
            writer.write_all(key.as_str().as_bytes()).await?;
            writer.write_all(b": ").await?;
            writer.write_all(value.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer
            .write_all(format!("Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len()).as_bytes())
            .await?;
        writer.write_all(&self.body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Parses a response head from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response; the body is
    /// left in the buffer.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .std_context("Failed to parse HTTP response")?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = http::HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    HttpResponse {
                        status,
                        reason,
                        headers,
                        body: Vec::new(),
                    },
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_head_extracts_host() {
        let buf = b"GET /path HTTP/1.1\r\nHost: couloir.my.test:8080\r\nAccept: */*\r\n\r\nbody";
        let (len, head) = HttpHead::parse_with_len(buf).unwrap().unwrap();
        assert_eq!(len, buf.len() - 4);
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/path");
        assert_eq!(head.host(), Some("couloir.my.test"));
    }

    #[test]
    fn parse_head_incomplete() {
        assert!(
            HttpHead::parse_with_len(b"GET / HTTP/1.1\r\nHost: x")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("my.test"), "my.test");
        assert_eq!(strip_port("my.test:443"), "my.test");
        assert_eq!(strip_port("127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("weird:host"), "weird:host");
    }

    #[test]
    fn request_line_validation() {
        assert!(is_http_request_line(b"GET / HTTP/1.1"));
        assert!(is_http_request_line(b"DELETE /x/y HTTP/1.0"));
        assert!(!is_http_request_line(b"GARBAGE"));
        assert!(!is_http_request_line(b"GET /"));
        assert!(!is_http_request_line(b"get / HTTP/1.1"));
        assert!(!is_http_request_line(b"GET / HTTP/1.1 extra"));
    }

    #[tokio::test]
    async fn write_response_with_body() {
        let mut out = Vec::new();
        HttpResponse::html(StatusCode::NOT_FOUND, "<html>gone</html>")
            .write(&mut out)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 17\r\n"));
        assert!(text.ends_with("\r\n\r\n<html>gone</html>"));
    }
}
