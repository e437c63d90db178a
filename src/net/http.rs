//! Literal HTTP/1.1 request text and response parsing over registry sockets.
//!
//! Requests are always sent with `Connection: close`, so a response is read
//! to end of stream and then parsed. Bodies may be delimited by
//! `Content-Length`, by chunked transfer coding, or by the end of the stream.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, warn};

use super::registry::{AddressFamily, SocketKind, SocketRegistry};
use crate::error::{AppError, AppResult};

const USER_AGENT: &str = concat!("twitchsub/", env!("CARGO_PKG_VERSION"));

/// Unreserved characters stay literal; everything else is percent-encoded.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a query or form value.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// `k1=v1&k2=v2` with both sides percent-encoded.
pub fn form_encode(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: &'static str,
    path: String,
    host: String,
    headers: Vec<(String, String)>,
    body: Option<(String, Vec<u8>)>,
}

impl HttpRequest {
    pub fn new(method: &'static str, host: &str, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            host: host.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(host: &str, path: &str) -> Self {
        Self::new("GET", host, path)
    }

    pub fn post(host: &str, path: &str) -> Self {
        Self::new("POST", host, path)
    }

    pub fn delete(host: &str, path: &str) -> Self {
        Self::new("DELETE", host, path)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", &format!("Bearer {}", token))
    }

    /// `application/x-www-form-urlencoded` body.
    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        self.body = Some((
            "application/x-www-form-urlencoded".to_string(),
            form_encode(pairs).into_bytes(),
        ));
        self
    }

    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.body = Some(("application/json".to_string(), value.to_string().into_bytes()));
        self
    }

    pub fn method(&self) -> &str {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full request text: request line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, self.path, self.host);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("User-Agent: {}\r\nConnection: close\r\n", USER_AGENT));
        match &self.body {
            Some((content_type, body)) => {
                head.push_str(&format!(
                    "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
                    content_type,
                    body.len()
                ));
                let mut out = head.into_bytes();
                out.extend_from_slice(body);
                out
            }
            None => {
                head.push_str("\r\n");
                head.into_bytes()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Parse a complete response (head and body) as read until EOF.
    pub fn parse(raw: &[u8]) -> AppResult<Self> {
        let head_end = find_head_end(raw)
            .ok_or_else(|| AppError::Protocol("HTTP response head is incomplete".to_string()))?;
        let (status, reason, headers) = parse_head(&raw[..head_end])?;
        let rest = &raw[head_end..];

        let head = Self {
            status,
            reason,
            headers,
            body: Vec::new(),
        };
        let body = if head
            .header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            decode_chunked(rest)?
        } else if let Some(length) = head.header("Content-Length") {
            let length: usize = length
                .trim()
                .parse()
                .map_err(|_| AppError::Protocol(format!("invalid Content-Length '{}'", length)))?;
            if rest.len() < length {
                return Err(AppError::Protocol(format!(
                    "body truncated: {} of {} bytes",
                    rest.len(),
                    length
                )));
            }
            rest[..length].to_vec()
        } else {
            rest.to_vec()
        };
        Ok(Self { body, ..head })
    }

    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `AppError::Http` carrying the status and body, for non-success responses.
    pub fn into_error(self) -> AppError {
        AppError::Http {
            status: self.status,
            message: self.body_text(),
        }
    }
}

/// Offset just past the `\r\n\r\n` that ends a message head.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Status code, reason phrase and headers from a response head.
pub fn parse_head(head: &[u8]) -> AppResult<(u16, String, Vec<(String, String)>)> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(AppError::Protocol(format!("invalid status line '{}'", status_line)));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AppError::Protocol(format!("invalid status line '{}'", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    Ok((status, reason, headers))
}

fn decode_chunked(mut data: &[u8]) -> AppResult<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| AppError::Protocol("chunk size line is incomplete".to_string()))?;
        let line = String::from_utf8_lossy(&data[..line_end]);
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| AppError::Protocol(format!("invalid chunk size '{}'", size_text)))?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if data.len() < size {
            return Err(AppError::Protocol(format!(
                "chunk truncated: {} of {} bytes",
                data.len(),
                size
            )));
        }
        body.extend_from_slice(&data[..size]);
        data = data[size..].strip_prefix(b"\r\n").unwrap_or(&data[size..]);
    }
}

/// Send one request on a fresh registry socket named `socket`, read the
/// response to EOF and remove the socket again, whatever the outcome.
pub async fn exchange(
    registry: &SocketRegistry,
    socket: &str,
    port: u16,
    use_tls: bool,
    request: &HttpRequest,
) -> AppResult<HttpResponse> {
    registry
        .create(socket, SocketKind::Stream, AddressFamily::Ipv4)
        .await?;
    let result = send_and_read(registry, socket, port, use_tls, request).await;
    if let Err(e) = registry.remove(socket.into()).await {
        warn!(socket, error = %e, "failed to remove request socket");
    }
    let response = HttpResponse::parse(&result?)?;
    debug!(
        socket,
        method = request.method,
        path = %request.path,
        status = response.status,
        bytes = response.body.len(),
        "http exchange"
    );
    Ok(response)
}

async fn send_and_read(
    registry: &SocketRegistry,
    socket: &str,
    port: u16,
    use_tls: bool,
    request: &HttpRequest,
) -> AppResult<Vec<u8>> {
    registry
        .connect(socket.into(), &request.host, port, use_tls)
        .await?;
    registry
        .send(socket.into(), &request.to_bytes(), use_tls)
        .await?;
    registry.receive_to_end(socket.into(), use_tls).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_values_are_percent_encoded() {
        assert_eq!(
            form_encode(&[("redirect_uri", "http://localhost:3000"), ("scope", "a:b c")]),
            "redirect_uri=http%3A%2F%2Flocalhost%3A3000&scope=a%3Ab%20c"
        );
    }

    #[test]
    fn request_text_has_length_and_close() {
        let req = HttpRequest::post("id.twitch.tv", "/oauth2/token").form(&[("a", "1")]);
        let text = String::from_utf8(req.to_bytes()).unwrap();
        assert!(text.starts_with("POST /oauth2/token HTTP/1.1\r\nHost: id.twitch.tv\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(text.ends_with("Content-Length: 3\r\n\r\na=1"));
    }

    #[test]
    fn get_has_no_body_headers() {
        let req = HttpRequest::get("api.twitch.tv", "/helix/users")
            .header("Client-ID", "abc")
            .bearer("tok");
        let text = String::from_utf8(req.to_bytes()).unwrap();
        assert!(text.contains("Client-ID: abc\r\nAuthorization: Bearer tok\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parses_content_length_body() {
        let raw = b"HTTP/1.1 202 Accepted\r\ncontent-length: 2\r\n\r\n{}trailing";
        let resp = HttpResponse::parse(raw).unwrap();
        assert_eq!(resp.status, 202);
        assert_eq!(resp.reason, "Accepted");
        assert_eq!(resp.header("Content-Length"), Some("2"));
        assert_eq!(resp.body, b"{}");
    }

    #[test]
    fn parses_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n";
        let resp = HttpResponse::parse(raw).unwrap();
        assert_eq!(resp.body_text(), "Wikipedia");
    }

    #[test]
    fn body_runs_to_eof_without_length() {
        let resp = HttpResponse::parse(b"HTTP/1.0 400 Bad Request\r\n\r\nnope").unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.body_text(), "nope");
        assert!(matches!(resp.into_error(), AppError::Http { status: 400, .. }));
    }

    #[test]
    fn rejects_malformed_responses() {
        assert!(HttpResponse::parse(b"HTTP/1.1 200 OK\r\n").is_err());
        assert!(HttpResponse::parse(b"garbage\r\n\r\n").is_err());
        assert!(HttpResponse::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").is_err());
        assert!(HttpResponse::parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n").is_err());
    }
}
