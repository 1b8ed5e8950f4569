//! DNS packet proxy.
//!
//! Turns DNS request packets read from the tunnel into tunnel-ready
//! responses: blocked and redirected names are answered locally, allowed
//! ones are handed to the configured [`UpstreamResolver`]. Every response
//! appears to come from the synthetic address the client queried.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::Message;
use tracing::{debug, instrument};

use super::pending::ResponseCallback;
use super::resolver::{Resolution, UpstreamQuery, UpstreamResolver};
use super::response::{blocked_response, redirected_response};
use super::rules::{Classification, Classifier, normalize_host};
use crate::error::Result;
use crate::network::{PacketBuilder, PacketInfo, extract_udp_datagram};
use crate::vpn::session::SessionState;

/// Classifies DNS requests and produces their responses.
pub struct DnsPacketProxy {
    classifier: Arc<dyn Classifier>,
    resolver: Box<dyn UpstreamResolver>,
    builder: PacketBuilder,
}

impl DnsPacketProxy {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        resolver: Box<dyn UpstreamResolver>,
        builder: PacketBuilder,
    ) -> Self {
        Self {
            classifier,
            resolver,
            builder,
        }
    }

    /// Handle one IP packet read from the tunnel.
    ///
    /// Locally answered responses are queued on the session's outbound
    /// queue. Packets that are not DNS requests to a synthetic server are
    /// dropped without a response. Only transport failures are returned.
    #[instrument(skip_all, fields(host))]
    pub fn handle_request(&self, packet: &[u8], session: &mut SessionState) -> Result<()> {
        let Some((info, payload)) = extract_udp_datagram(packet) else {
            dropped("not a UDP datagram");
            return Ok(());
        };
        let Some(upstream) = session.mapper.reverse_lookup(info.dest_ip) else {
            dropped("no server behind destination");
            return Ok(());
        };
        let server = SocketAddr::new(upstream, info.dest_port);

        if payload.is_empty() {
            debug!(server = %server, "Forwarding empty datagram");
            let query = UpstreamQuery {
                server,
                payload,
                reply: None,
            };
            self.resolver.resolve(query, session)?;
            return Ok(());
        }

        let request = match Message::from_vec(&payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Unparsable DNS message");
                dropped("malformed DNS message");
                return Ok(());
            }
        };
        let Some(question) = request.queries().first() else {
            dropped("no question");
            return Ok(());
        };
        let host = normalize_host(&question.name().to_ascii());
        tracing::Span::current().record("host", host.as_str());

        match self.classifier.classify(&host) {
            Classification::Blocked => {
                debug!("Blocked");
                record("blocked");
                self.answer_locally(&blocked_response(&request), &info, session);
            }
            Classification::Redirected(target) => {
                debug!(redirect = %target, "Redirected");
                record("redirected");
                self.answer_locally(&redirected_response(&request, &target), &info, session);
            }
            Classification::Allowed => {
                record("allowed");
                self.forward(server, payload, &info, session)?;
            }
        }

        Ok(())
    }

    fn forward(
        &self,
        server: SocketAddr,
        payload: Vec<u8>,
        info: &PacketInfo,
        session: &mut SessionState,
    ) -> Result<()> {
        let builder = self.builder.clone();
        let request = *info;
        let reply: ResponseCallback =
            Box::new(move |answer: &[u8]| -> Result<Vec<u8>> { builder.build_response(answer, &request) });

        let query = UpstreamQuery {
            server,
            payload,
            reply: Some(reply),
        };
        match self.resolver.resolve(query, session)? {
            Resolution::Immediate(answer) => self.queue(&answer, info, session),
            Resolution::Pending => {}
            Resolution::Dropped => debug!(server = %server, "Upstream query dropped"),
        }
        Ok(())
    }

    fn answer_locally(&self, response: &Message, info: &PacketInfo, session: &mut SessionState) {
        match response.to_vec() {
            Ok(bytes) => self.queue(&bytes, info, session),
            Err(e) => debug!(error = %e, "Failed to encode local answer"),
        }
    }

    fn queue(&self, dns: &[u8], info: &PacketInfo, session: &mut SessionState) {
        match self.builder.build_response(dns, info) {
            Ok(packet) => session.outbound.push_back(packet),
            Err(e) => debug!(error = %e, "Failed to build response packet"),
        }
    }
}

fn record(action: &'static str) {
    metrics::counter!("nullroute_queries_total", "action" => action).increment(1);
}

fn dropped(reason: &'static str) {
    debug!(reason, "Dropping packet");
    record("dropped");
}
