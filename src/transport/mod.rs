//! Transport layer implementations for DNS proxy.
//!
//! Provides UDP and TCP listeners that decode client queries, hand them to
//! the [`Resolver`] and write back a well-formed reply, even when the
//! query could not be answered.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::dns::{Message, OPCODE_QUERY, RCODE_NOTIMP, Record};
use crate::error::Error;
use crate::resolver::{Outcome, Resolver};
use crate::stats::Stats;
use crate::upstream::Exchange;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Logger for DNS query events.
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn answered(&self, domain: &str, outcome: Outcome, answer: Option<&Record>, elapsed: Duration) {
        let source = match outcome {
            Outcome::Local => "LOCAL".to_string(),
            Outcome::Cached => "CACHED".to_string(),
            Outcome::Forwarded(upstream) => format!("FORWARDED via {}", upstream),
            Outcome::Empty => {
                debug!("[{}] query without question", self.protocol.as_str());
                return;
            }
        };
        let answer = match answer {
            Some(record) => match record.ip() {
                Some(ip) => ip.to_string(),
                None => format!("type {} record", record.rtype),
            },
            None => "nothing".to_string(),
        };
        info!(
            "[{}] {} -> {} {} total={:.3}ms",
            self.protocol.as_str(),
            domain,
            answer,
            source,
            elapsed.as_secs_f64() * 1000.0
        );
    }

    pub fn failed(&self, domain: &str, err: &Error, elapsed: Duration) {
        warn!(
            "[{}] lookup for {} failed: {} total={:.3}ms",
            self.protocol.as_str(),
            domain,
            err,
            elapsed.as_secs_f64() * 1000.0
        );
    }

    pub fn rejected(&self, reason: &str) {
        debug!("[{}] dropping query: {}", self.protocol.as_str(), reason);
    }
}

/// Decode `query`, resolve it and encode the reply.
///
/// Returns `None` only when nothing sensible can be sent back: the packet
/// did not parse or was itself a response.
pub(crate) async fn answer_query<E: Exchange>(
    resolver: &Resolver<E>,
    stats: &Stats,
    logger: &QueryLogger,
    query: &[u8],
) -> Option<Vec<u8>> {
    let start_time = Instant::now();

    let request = match Message::parse(query) {
        Ok(request) => request,
        Err(e) => {
            logger.rejected(&e.to_string());
            return None;
        }
    };
    if request.is_response() {
        logger.rejected("packet is a response");
        return None;
    }

    let domain = request
        .questions
        .first()
        .map_or("<none>", |q| q.name.as_str());

    let response = if request.opcode() != OPCODE_QUERY {
        logger.rejected(&format!("opcode {} not implemented", request.opcode()));
        stats.record_other(start_time.elapsed());
        let mut reply = Message::reply(&request);
        reply.set_rcode(RCODE_NOTIMP);
        reply
    } else {
        match resolver.resolve(&request).await {
            Ok(resolution) => {
                let elapsed = start_time.elapsed();
                match resolution.outcome {
                    Outcome::Local => stats.record_local(elapsed),
                    Outcome::Cached => stats.record_cached(elapsed),
                    Outcome::Forwarded(_) => stats.record_forwarded(elapsed),
                    Outcome::Empty => stats.record_other(elapsed),
                }
                logger.answered(
                    domain,
                    resolution.outcome,
                    resolution.response.answers.first(),
                    elapsed,
                );
                resolution.response
            }
            Err(e) => {
                let elapsed = start_time.elapsed();
                stats.record_failed(elapsed);
                logger.failed(domain, &e, elapsed);
                Message::reply(&request)
            }
        }
    };

    let limit = match logger.protocol {
        Protocol::Udp => Some(request.max_udp_payload()),
        Protocol::Tcp => None,
    };
    match encode_reply(response, limit) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("failed to encode reply for {}: {}", domain, e);
            None
        }
    }
}

/// Encode `response`, dropping its answers and setting TC when it does
/// not fit in `limit` bytes.
fn encode_reply(mut response: Message, limit: Option<usize>) -> crate::error::Result<Vec<u8>> {
    let bytes = response.to_bytes()?;
    match limit {
        Some(limit) if bytes.len() > limit => {
            debug!("{} byte reply exceeds {} bytes, truncating", bytes.len(), limit);
            response.answers.clear();
            response.set_truncated();
            response.to_bytes()
        }
        _ => Ok(bytes),
    }
}
