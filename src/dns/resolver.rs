//! Upstream resolution of allowed queries.
//!
//! The packet proxy hands every allowed query to an [`UpstreamResolver`].
//! [`UdpForwarder`] sends the raw query to the real server from a protected
//! socket tracked by the session; [`DohResolver`] resolves it over
//! DNS-over-HTTPS on a spawned task and hands the answer back through the
//! session's completion queue.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::pending::{Completion, MAX_PENDING, ResponseCallback};
use crate::config::{UpstreamMode, UpstreamSettings};
use crate::error::{Error, NetworkError, Result};
use crate::vpn::session::SessionState;

const DNS_MESSAGE: &str = "application/dns-message";
const HTTPS_PORT: u16 = 443;

/// A query on its way to the real DNS server.
pub struct UpstreamQuery {
    /// Real server and port the client addressed.
    pub server: SocketAddr,
    /// Raw DNS message as sent by the client.
    pub payload: Vec<u8>,
    /// Assembles the tunnel packet from the raw answer. `None` when the
    /// answer is to be ignored.
    pub reply: Option<ResponseCallback>,
}

/// Outcome of handing a query upstream.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The answer will arrive later through the session.
    Pending,
    /// The raw answer is already known.
    Immediate(Vec<u8>),
    /// The query was given up; the client will retry.
    Dropped,
}

/// Capability to resolve allowed queries.
pub trait UpstreamResolver: Send + Sync {
    /// Start resolving `query`.
    ///
    /// Only transport failures that require a new tunnel are returned as
    /// errors; anything else drops the query.
    fn resolve(&self, query: UpstreamQuery, session: &mut SessionState) -> Result<Resolution>;
}

/// Build the resolver selected by the `[upstream]` configuration.
pub fn from_settings(settings: &UpstreamSettings) -> Result<Box<dyn UpstreamResolver>> {
    match settings.mode {
        UpstreamMode::Udp => Ok(Box::new(UdpForwarder)),
        UpstreamMode::Doh => Ok(Box::new(DohResolver::new(settings)?)),
    }
}

/// Forwards raw queries over UDP.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpForwarder;

impl UdpForwarder {
    fn send(query: &UpstreamQuery, session: &SessionState) -> Result<Option<std::net::UdpSocket>> {
        let socket = match open_socket(query.server, session) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(server = %query.server, error = %e, "Failed to open upstream socket");
                return Ok(None);
            }
        };

        match socket.send_to(&query.payload, query.server) {
            Ok(_) => Ok(Some(socket)),
            Err(e) if is_unreachable(&e) => Err(NetworkError::Unreachable(e).into()),
            Err(e) => {
                warn!(server = %query.server, error = %e, "Failed to forward query");
                Ok(None)
            }
        }
    }
}

/// Non-blocking socket of the server's family, kept outside the tunnel.
fn open_socket(server: SocketAddr, session: &SessionState) -> io::Result<std::net::UdpSocket> {
    let bind_addr = match server.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = std::net::UdpSocket::bind(bind_addr)?;
    if let Err(e) = session.protector.protect(socket.as_raw_fd()) {
        warn!(error = %e, "Failed to protect upstream socket");
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Errors after which the network path is gone and the tunnel must be rebuilt.
fn is_unreachable(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::ENETUNREACH) | Some(libc::EPERM)
    )
}

impl UpstreamResolver for UdpForwarder {
    fn resolve(&self, query: UpstreamQuery, session: &mut SessionState) -> Result<Resolution> {
        let Some(socket) = Self::send(&query, session)? else {
            return Ok(Resolution::Dropped);
        };

        match query.reply {
            Some(reply) => match UdpSocket::from_std(socket) {
                Ok(socket) => {
                    session.pending.add(socket, reply);
                    Ok(Resolution::Pending)
                }
                Err(e) => {
                    warn!(server = %query.server, error = %e, "Failed to register upstream socket");
                    Ok(Resolution::Dropped)
                }
            },
            // Nobody waits for the answer; dropping the socket closes it.
            None => Ok(Resolution::Dropped),
        }
    }
}

/// Resolves queries over DNS-over-HTTPS (RFC 8484).
///
/// At most [`MAX_PENDING`] requests are in flight by default; further
/// queries are dropped until one finishes. Requests run on the session's
/// task set and are aborted when the session ends.
pub struct DohResolver {
    client: reqwest::Client,
    url: reqwest::Url,
    permits: Arc<Semaphore>,
}

impl DohResolver {
    /// Build a client reaching the endpoint through the bootstrap addresses.
    pub fn new(settings: &UpstreamSettings) -> Result<Self> {
        Self::with_limit(settings, MAX_PENDING)
    }

    /// Like [`DohResolver::new`] with at most `limit` requests in flight.
    pub fn with_limit(settings: &UpstreamSettings, limit: usize) -> Result<Self> {
        let url = reqwest::Url::parse(&settings.url)
            .map_err(|e| Error::Resolver(format!("invalid DoH URL {:?}: {e}", settings.url)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Resolver(format!("DoH URL has no host: {:?}", settings.url)))?
            .to_string();
        let port = url.port().unwrap_or(HTTPS_PORT);
        let bootstrap: Vec<SocketAddr> = settings
            .bootstrap
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .resolve_to_addrs(&host, &bootstrap)
            .build()
            .map_err(|e| Error::Resolver(e.to_string()))?;

        Ok(Self {
            client,
            url,
            permits: Arc::new(Semaphore::new(limit)),
        })
    }

    async fn query(client: reqwest::Client, url: reqwest::Url, payload: Vec<u8>) -> Result<Vec<u8>> {
        let response = client
            .post(url)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| NetworkError::Doh(e.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::Doh(e.to_string()))?;
        Ok(body.to_vec())
    }
}

impl UpstreamResolver for DohResolver {
    fn resolve(&self, query: UpstreamQuery, session: &mut SessionState) -> Result<Resolution> {
        // Keep-alive probes carry no question; they only need to leave the
        // device, so they take the plain UDP path.
        let Some(reply) = query.reply else {
            return UdpForwarder.resolve(query, session);
        };

        while session.tasks.try_join_next().is_some() {}
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            warn!("Too many DoH queries in flight, dropping query");
            return Ok(Resolution::Dropped);
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let completions = session.completions.clone();
        let payload = query.payload;

        session.tasks.spawn(async move {
            let _permit = permit;
            match Self::query(client, url, payload).await {
                Ok(answer) => {
                    let completion = Completion {
                        answer,
                        callback: reply,
                    };
                    if completions.send(completion).await.is_err() {
                        debug!("Session ended before DoH answer arrived");
                    }
                }
                Err(e) => warn!(error = %e, "DoH query failed"),
            }
        });

        Ok(Resolution::Pending)
    }
}
