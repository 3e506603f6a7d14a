//! Minimal HTTP/1.1 proxy engine.
//!
//! Parses one request per client connection and hands it to a [`ProxyHooks`]
//! implementation at two points: before a plain request is forwarded, and
//! before a CONNECT tunnel is established (where the hooks then take raw
//! ownership of the client stream). No TLS: `https://` absolute targets are
//! rejected, encrypted traffic only ever passes through CONNECT tunnels.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::HttpError;

/// Upper bound for a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for a buffered request or response body.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// A parsed inbound request. `body` is filled in only for plain requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    /// Raw request-target: `host:port` for CONNECT, usually an absolute URL otherwise.
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    /// First header with this name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn proxy_authorization(&self) -> Option<&str> {
        self.header("Proxy-Authorization")
    }

    fn expects_continue(&self) -> bool {
        self.header("Expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Where this request is headed.
    pub fn request_target(&self) -> Result<RequestTarget, HttpError> {
        if self.is_connect() {
            let (host, port) = parse_authority(&self.target, 443)?;
            return Ok(RequestTarget {
                host,
                port,
                path: String::new(),
            });
        }

        if let Some(rest) = strip_prefix_ignore_case(&self.target, "http://") {
            let split = rest.find(['/', '?']).unwrap_or(rest.len());
            let (authority, path) = rest.split_at(split);
            let path = if path.is_empty() {
                "/".to_string()
            } else if path.starts_with('?') {
                format!("/{}", path)
            } else {
                path.to_string()
            };
            let (host, port) = parse_authority(authority, 80)?;
            return Ok(RequestTarget { host, port, path });
        }

        if self.target.starts_with('/') {
            let host = self
                .header("Host")
                .ok_or_else(|| HttpError::UnsupportedTarget(self.target.clone()))?;
            let (host, port) = parse_authority(host, 80)?;
            return Ok(RequestTarget {
                host,
                port,
                path: self.target.clone(),
            });
        }

        Err(HttpError::UnsupportedTarget(self.target.clone()))
    }
}

/// Destination of a request: host (IPv6 literals without brackets), port and
/// origin-form path (empty for CONNECT).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RequestTarget {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for a `Host` header: the port is omitted when it is 80.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

/// A response, either synthesized by the proxy or read from a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Plain-text response.
    pub fn text(status: u16, reason: &str, body: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ],
            body: body.as_bytes().to_vec(),
        }
    }

    /// 407 with a Basic challenge.
    pub fn proxy_auth_required() -> Self {
        let mut resp = Self::text(
            407,
            "Proxy Authentication Required",
            "Proxy Authentication Required",
        );
        resp.headers.insert(
            0,
            (
                "Proxy-Authenticate".to_string(),
                "Basic realm=\"egress6\"".to_string(),
            ),
        );
        resp
    }

    pub fn bad_gateway() -> Self {
        Self::text(502, "Bad Gateway", "Bad Gateway")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace any `Connection` header with `close`: each client connection
    /// carries exactly one exchange.
    pub fn set_connection_close(&mut self) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("Connection"));
        self.headers.push(("Connection".to_string(), "close".to_string()));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason).into_bytes();
        for (k, v) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", k, v).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// The client side of a hijacked CONNECT request.
#[derive(Debug)]
pub struct ClientConn {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Bytes the client sent after the request head, not yet consumed.
    pub pending: Vec<u8>,
}

/// Hook points of the engine.
#[async_trait]
pub trait ProxyHooks: Send + Sync {
    /// Before a plain request is forwarded. `Some` short-circuits with that response.
    fn on_request(&self, req: &InboundRequest) -> Option<HttpResponse>;

    /// Forward a plain request. `None` means the exchange failed; the engine
    /// answers 502.
    async fn forward(&self, req: InboundRequest, target: RequestTarget) -> Option<HttpResponse>;

    /// Before a tunnel is accepted. `Some` rejects it with that response.
    fn on_connect(&self, req: &InboundRequest) -> Option<HttpResponse>;

    /// Take over the client stream of an accepted CONNECT request. The hook
    /// acknowledges (or fails) the tunnel itself and must close the stream.
    async fn hijack_connect(&self, req: InboundRequest, target: RequestTarget, client: ClientConn);
}

/// Serve one client connection: one request, one response or one tunnel.
pub async fn serve_connection<H>(
    hooks: &H,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), HttpError>
where
    H: ProxyHooks + ?Sized,
{
    let (head, leftover) = match read_head(&mut stream).await {
        Ok(v) => v,
        // Client connected and left without sending anything.
        Err(HttpError::ConnectionClosed) => return Ok(()),
        Err(e) => return reply_error(&mut stream, e).await,
    };
    let mut req = match parse_request_head(&head) {
        Ok(req) => req,
        Err(e) => return reply_error(&mut stream, e).await,
    };

    tracing::trace!(client = %peer, method = %req.method, target = %req.target, "Inbound request");

    if req.is_connect() {
        if let Some(resp) = hooks.on_connect(&req) {
            return write_response(&mut stream, resp).await;
        }
        let target = match req.request_target() {
            Ok(t) => t,
            Err(e) => return reply_error(&mut stream, e).await,
        };
        let client = ClientConn {
            stream,
            peer,
            pending: leftover,
        };
        hooks.hijack_connect(req, target, client).await;
        return Ok(());
    }

    if let Some(resp) = hooks.on_request(&req) {
        return write_response(&mut stream, resp).await;
    }
    let target = match req.request_target() {
        Ok(t) => t,
        Err(e) => return reply_error(&mut stream, e).await,
    };

    if req.expects_continue() {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    }
    req.body = match read_body(&mut stream, &req.headers, leftover).await {
        Ok((body, _)) => body,
        Err(e) => return reply_error(&mut stream, e).await,
    };

    let resp = hooks
        .forward(req, target)
        .await
        .unwrap_or_else(HttpResponse::bad_gateway);
    write_response(&mut stream, resp).await
}

async fn write_response<W>(stream: &mut W, mut resp: HttpResponse) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    resp.set_connection_close();
    stream.write_all(&resp.to_bytes()).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn reply_error<W>(stream: &mut W, err: HttpError) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    if let Some((status, reason)) = err.status() {
        let _ = write_response(stream, HttpResponse::text(status, reason, reason)).await;
    }
    Err(err)
}

/// Read up to and including the blank line ending a message head.
/// Returns `(head, leftover)` where `leftover` is whatever followed it.
pub async fn read_head<R>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
{
    read_head_buffered(reader, Vec::new()).await
}

/// Like [`read_head`], starting from bytes already read off the stream.
async fn read_head_buffered<R>(
    reader: &mut R,
    mut buf: Vec<u8>,
) -> Result<(Vec<u8>, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut scanned = 0;
    loop {
        if let Some(pos) = find(&buf[scanned..], b"\r\n\r\n") {
            let leftover = buf.split_off(scanned + pos + 4);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        // The terminator may straddle two reads.
        scanned = buf.len().saturating_sub(3);
        if fill(reader, &mut buf).await? == 0 {
            return Err(if buf.is_empty() {
                HttpError::ConnectionClosed
            } else {
                HttpError::Malformed("connection closed inside message head".to_string())
            });
        }
    }
}

/// Split a head into its start line and headers.
fn parse_head_lines(head: &[u8]) -> Result<(&str, Vec<(String, String)>), HttpError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| HttpError::Malformed("message head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or("");
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("invalid header line '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((start, headers))
}

pub fn parse_request_head(head: &[u8]) -> Result<InboundRequest, HttpError> {
    let (request_line, headers) = parse_head_lines(head)?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !matches!(parts[2], "HTTP/1.0" | "HTTP/1.1") {
        return Err(HttpError::Malformed(format!(
            "invalid request line '{}'",
            request_line
        )));
    }
    Ok(InboundRequest {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
        body: Vec::new(),
    })
}

fn parse_status_head(head: &[u8]) -> Result<HttpResponse, HttpError> {
    let (status_line, headers) = parse_head_lines(head)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let status = parts.next().and_then(|s| s.parse::<u16>().ok());
    let reason = parts.next().unwrap_or("").trim();
    match status {
        Some(status) if version.starts_with("HTTP/") => Ok(HttpResponse {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers,
            body: Vec::new(),
        }),
        _ => Err(HttpError::Malformed(format!(
            "invalid status line '{}'",
            status_line
        ))),
    }
}

/// Read a message body framed by `headers`. Chunked bodies are returned raw,
/// framing included, so they can be forwarded with their headers untouched.
/// Without framing headers the body is empty. Returns `(body, rest)`.
pub async fn read_body<R>(
    reader: &mut R,
    headers: &[(String, String)],
    leftover: Vec<u8>,
) -> Result<(Vec<u8>, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
{
    if is_chunked(headers) {
        return read_chunked_raw(reader, leftover).await;
    }
    match content_length(headers)? {
        Some(len) => read_exact_body(reader, leftover, len).await,
        None => Ok((Vec::new(), leftover)),
    }
}

/// Read a target response. Interim 1xx responses (other than 101) are
/// skipped. Without framing headers the body runs until the target closes.
pub async fn read_response<R>(reader: &mut R, head_request: bool) -> Result<HttpResponse, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let (mut resp, leftover) = loop {
        let (head, rest) = read_head_buffered(reader, buf).await?;
        let resp = parse_status_head(&head)?;
        if (100..200).contains(&resp.status) && resp.status != 101 {
            buf = rest;
            continue;
        }
        break (resp, rest);
    };

    if head_request || matches!(resp.status, 101 | 204 | 304) {
        return Ok(resp);
    }

    resp.body = if is_chunked(&resp.headers) {
        read_chunked_raw(reader, leftover).await?.0
    } else if let Some(len) = content_length(&resp.headers)? {
        read_exact_body(reader, leftover, len).await?.0
    } else {
        read_to_close(reader, leftover).await?
    };
    Ok(resp)
}

async fn fill<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let n = reader.read(&mut chunk).await?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

async fn read_exact_body<R>(
    reader: &mut R,
    mut buf: Vec<u8>,
    len: usize,
) -> Result<(Vec<u8>, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
{
    if len > MAX_BODY_SIZE {
        return Err(HttpError::BodyTooLarge(MAX_BODY_SIZE));
    }
    while buf.len() < len {
        if fill(reader, &mut buf).await? == 0 {
            return Err(HttpError::Malformed(format!(
                "connection closed after {} of {} body bytes",
                buf.len(),
                len
            )));
        }
    }
    let rest = buf.split_off(len);
    Ok((buf, rest))
}

async fn read_chunked_raw<R>(
    reader: &mut R,
    mut buf: Vec<u8>,
) -> Result<(Vec<u8>, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut pos = 0;
    loop {
        let line_end = read_line_end(reader, &mut buf, pos).await?;
        let line = std::str::from_utf8(&buf[pos..line_end])
            .map_err(|_| HttpError::Malformed("invalid chunk size line".to_string()))?;
        let size_hex = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| HttpError::Malformed(format!("invalid chunk size '{}'", size_hex)))?;
        pos = line_end + 2;

        if size == 0 {
            // Trailers, terminated by an empty line.
            loop {
                let end = read_line_end(reader, &mut buf, pos).await?;
                let empty = end == pos;
                pos = end + 2;
                if empty {
                    let rest = buf.split_off(pos);
                    return Ok((buf, rest));
                }
                if pos > MAX_BODY_SIZE {
                    return Err(HttpError::BodyTooLarge(MAX_BODY_SIZE));
                }
            }
        }

        if pos.saturating_add(size) > MAX_BODY_SIZE {
            return Err(HttpError::BodyTooLarge(MAX_BODY_SIZE));
        }
        while buf.len() < pos + size + 2 {
            if fill(reader, &mut buf).await? == 0 {
                return Err(HttpError::Malformed(
                    "connection closed inside chunked body".to_string(),
                ));
            }
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(HttpError::Malformed("chunk not terminated by CRLF".to_string()));
        }
        pos += size + 2;
    }
}

/// Index of the next CRLF at or after `from`, reading more as needed.
async fn read_line_end<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    from: usize,
) -> Result<usize, HttpError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find(&buf[from..], b"\r\n") {
            return Ok(from + pos);
        }
        if buf.len() - from > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        if fill(reader, buf).await? == 0 {
            return Err(HttpError::Malformed(
                "connection closed inside chunked body".to_string(),
            ));
        }
    }
}

async fn read_to_close<R>(reader: &mut R, mut buf: Vec<u8>) -> Result<Vec<u8>, HttpError>
where
    R: AsyncRead + Unpin,
{
    while fill(reader, &mut buf).await? > 0 {
        if buf.len() > MAX_BODY_SIZE {
            return Err(HttpError::BodyTooLarge(MAX_BODY_SIZE));
        }
    }
    Ok(buf)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    find_header(headers, "Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, HttpError> {
    match find_header(headers, "Content-Length") {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| HttpError::Malformed(format!("invalid Content-Length '{}'", v))),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&s[prefix.len()..]),
        _ => None,
    }
}

/// Split `host[:port]` (IPv6 literals bracketed) into host and port.
fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), HttpError> {
    // userinfo is never forwarded
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    let malformed = || HttpError::Malformed(format!("invalid authority '{}'", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(malformed)?;
        match after {
            "" => (host, None),
            p => (host, Some(p.strip_prefix(':').ok_or_else(malformed)?)),
        }
    } else {
        match authority.split_once(':') {
            Some((_, p)) if p.contains(':') => return Err(malformed()),
            Some((host, p)) => (host, Some(p)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(malformed());
    }
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| malformed())?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}
