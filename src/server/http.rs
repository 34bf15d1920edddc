//! Minimal HTTP/1.1 request-head parsing and response writing.
//!
//! Request heads are peeked rather than read so that a WebSocket upgrade can
//! hand the untouched stream to the handshake.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

const MAX_REQUEST_BYTES: usize = 8192;
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
    /// Bytes up to and including the blank line ending the head.
    pub head_len: usize,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|value| value.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        upgrade && connection
    }
}

/// Parse a request head. `Ok(None)` means the head is not complete yet.
pub(crate) fn parse_request_head(data: &[u8]) -> Result<Option<HttpRequest>> {
    let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let head_len = end + 4;
    let text = String::from_utf8_lossy(&data[..end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(Some(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        head_len,
    }))
}

/// Wait for a complete request head without consuming it.
pub(crate) fn peek_request(stream: &TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
    let deadline = Instant::now() + REQUEST_TIMEOUT;
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    loop {
        let n = stream.peek(&mut buf).context("read request head")?;
        if n == 0 {
            return Err(anyhow!("connection closed before a request arrived"));
        }
        if let Some(request) = parse_request_head(&buf[..n])? {
            return Ok(request);
        }
        if n == buf.len() {
            return Err(anyhow!("request too large"));
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for request head"));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Drain a peeked head from the socket before answering it directly.
pub(crate) fn consume_head(stream: &mut TcpStream, request: &HttpRequest) -> Result<()> {
    let mut head = vec![0u8; request.head_len];
    stream.read_exact(&mut head).context("consume request head")?;
    Ok(())
}

pub(crate) fn write_json_response<W: Write>(stream: &mut W, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

pub(crate) fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
