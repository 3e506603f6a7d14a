//! Proxy core: authentication, plain-request forwarding and CONNECT tunnels,
//! every outbound connection leaving from a fresh address of the pool.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::address_pool::{AddressPool, CidrBlock};
use crate::auth::{AuthGate, Credential};
use crate::dialer::{DialOptions, EgressDialer};
use crate::http::{
    read_response, ClientConn, HttpResponse, InboundRequest, ProxyHooks, RequestTarget,
};
use crate::info_log;
use crate::relay::{relay, RelayOptions};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Request headers that only concern the client/proxy hop.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "expect"];

/// How much of a request body is echoed at trace level.
const BODY_PREVIEW: usize = 256;

/// Everything needed to run a proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub cidr: CidrBlock,
    /// Empty username and password disable authentication.
    pub credential: Credential,
    pub dial: DialOptions,
    pub relay: RelayOptions,
}

impl ProxyConfig {
    pub fn new(listen: SocketAddr, cidr: CidrBlock) -> Self {
        Self {
            listen,
            cidr,
            credential: Credential::default(),
            dial: DialOptions::default(),
            relay: RelayOptions::default(),
        }
    }
}

/// Implements the engine hooks. Shared read-only by every connection task.
#[derive(Debug)]
pub struct ProxyCore {
    auth: AuthGate,
    dialer: EgressDialer,
    relay: RelayOptions,
}

impl ProxyCore {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            auth: AuthGate::new(config.credential.clone()),
            dialer: EgressDialer::new(AddressPool::new(config.cidr), config.dial.clone()),
            relay: config.relay.clone(),
        }
    }

    fn check_auth(&self, req: &InboundRequest) -> Option<HttpResponse> {
        if self.auth.authorize(req.proxy_authorization()) {
            return None;
        }
        info_log!(
            method = %req.method,
            target = %req.target,
            credentials_sent = req.proxy_authorization().is_some(),
            "[Proxy] Authentication failed"
        );
        Some(HttpResponse::proxy_auth_required())
    }
}

#[async_trait]
impl ProxyHooks for ProxyCore {
    fn on_request(&self, req: &InboundRequest) -> Option<HttpResponse> {
        self.check_auth(req)
    }

    async fn forward(&self, req: InboundRequest, target: RequestTarget) -> Option<HttpResponse> {
        tracing::debug!(
            method = %req.method,
            url = %req.target,
            body_len = req.body.len(),
            "[Proxy] Forwarding request"
        );
        if !req.body.is_empty() {
            let preview = &req.body[..req.body.len().min(BODY_PREVIEW)];
            tracing::trace!(body = %String::from_utf8_lossy(preview), "[Proxy] Request body");
        }

        let authority = target.authority();
        let mut conn = match self.dialer.dial(&authority).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("[Proxy] Failed to connect to {}: {}", authority, e);
                return None;
            }
        };

        if let Err(e) = conn.stream.write_all(&forward_request_bytes(&req, &target)).await {
            tracing::warn!("[Proxy] Failed to send request to {}: {}", authority, e);
            return None;
        }

        let head_request = req.method.eq_ignore_ascii_case("HEAD");
        match read_response(&mut conn.stream, head_request).await {
            Ok(resp) => {
                info_log!(
                    method = %req.method,
                    url = %req.target,
                    status = resp.status,
                    egress = %conn.local.ip(),
                    "[Proxy] Request forwarded"
                );
                Some(resp)
            }
            Err(e) => {
                tracing::warn!("[Proxy] Bad response from {}: {}", authority, e);
                None
            }
        }
    }

    fn on_connect(&self, req: &InboundRequest) -> Option<HttpResponse> {
        self.check_auth(req)
    }

    async fn hijack_connect(
        &self,
        _req: InboundRequest,
        target: RequestTarget,
        mut client: ClientConn,
    ) {
        let authority = target.authority();
        let conn = match self.dialer.dial(&authority).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("[Proxy] CONNECT {} from {} failed: {}", authority, client.peer, e);
                let mut resp = HttpResponse::bad_gateway();
                resp.set_connection_close();
                let _ = client.stream.write_all(&resp.to_bytes()).await;
                let _ = client.stream.shutdown().await;
                return;
            }
        };

        if let Err(e) = client.stream.write_all(CONNECT_ESTABLISHED).await {
            tracing::debug!("[Proxy] Client {} left before tunnel start: {}", client.peer, e);
            return;
        }
        let mut target_stream = conn.stream;
        // Bytes the client pipelined behind the CONNECT head belong to the target.
        if !client.pending.is_empty() {
            if let Err(e) = target_stream.write_all(&client.pending).await {
                tracing::debug!(
                    "[Proxy] Failed to flush early tunnel bytes to {}: {}",
                    authority,
                    e
                );
                return;
            }
        }

        info_log!(
            client = %client.peer,
            target = %authority,
            egress = %conn.local.ip(),
            "[Proxy] Tunnel established"
        );
        let summary = relay(client.stream, target_stream, &self.relay).await;
        tracing::debug!(
            target = %authority,
            sent = summary.client_to_target + client.pending.len() as u64,
            received = summary.target_to_client,
            end = ?summary.end,
            "[Proxy] Tunnel closed"
        );
    }
}

/// Origin-form request for the target: proxy and hop-by-hop headers dropped,
/// `Host` guaranteed, one exchange per connection.
fn forward_request_bytes(req: &InboundRequest, target: &RequestTarget) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", req.method, target.path, req.version).into_bytes();
    let mut has_host = false;
    for (name, value) in &req.headers {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("proxy-") || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        has_host |= lower == "host";
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !has_host {
        out.extend_from_slice(format!("Host: {}\r\n", target.host_header()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&req.body);
    out
}
