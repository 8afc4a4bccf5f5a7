//! DNS query resolution logic.
//!
//! Handles the core query processing pipeline:
//! 1. Pick the upstream server for the question name
//! 2. For A questions: cache, then the local alias chain, then variables
//! 3. Otherwise forward to upstream, caching A answers
//!
//! Transports handle the actual I/O, resolver handles decisions.

use std::net::{IpAddr, SocketAddr};

use log::{debug, trace};

use crate::cache::CacheHandle;
use crate::dns::{LOCAL_ANSWER_TTL, Message, Question, Record, TYPE_A};
use crate::error::{Error, Result};
use crate::hostmap::{CompiledHostMap, HostTarget, fqdn};
use crate::upstream::Exchange;

/// Alias hops followed before a chain is treated as a cycle.
pub const MAX_ALIAS_DEPTH: usize = 50;

/// How a query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// From the local override tables.
    Local,
    /// From the answer cache.
    Cached,
    /// From an upstream server.
    Forwarded(SocketAddr),
    /// The request carried no question.
    Empty,
}

/// A reply ready for the transport, plus how it was produced.
#[derive(Debug)]
pub struct Resolution {
    pub response: Message,
    pub outcome: Outcome,
}

/// Local override tables and upstream routing.
pub struct HostMaps {
    pub domains: CompiledHostMap<HostTarget>,
    pub vars: CompiledHostMap<HostTarget>,
    pub servers: CompiledHostMap<SocketAddr>,
}

/// Resolver handles DNS query processing decisions.
///
/// Shared between all transports; the host maps are immutable and the cache
/// does its own locking, so queries never serialize on the resolver.
pub struct Resolver<E> {
    exchange: E,
    cache: CacheHandle<Record>,
    maps: HostMaps,
    default_upstream: SocketAddr,
}

impl<E: Exchange> Resolver<E> {
    pub fn new(
        exchange: E,
        cache: CacheHandle<Record>,
        maps: HostMaps,
        default_upstream: SocketAddr,
    ) -> Self {
        Self {
            exchange,
            cache,
            maps,
            default_upstream,
        }
    }

    /// Answer a standard query.
    ///
    /// Only the first question is processed. A request without questions
    /// gets an empty reply.
    pub async fn resolve(&self, request: &Message) -> Result<Resolution> {
        let mut response = Message::reply(request);
        let Some(question) = request.questions.first() else {
            return Ok(Resolution {
                response,
                outcome: Outcome::Empty,
            });
        };

        let name = fqdn(&question.name);
        let upstream = self.upstream_for(&name);

        let (answer, outcome) = if question.qtype == TYPE_A {
            self.resolve_a(request, question, &name, upstream).await?
        } else {
            let answer = self.forward(request, question, upstream).await?.swap_remove(0);
            (answer, Outcome::Forwarded(upstream))
        };

        response.answers.push(answer);
        Ok(Resolution { response, outcome })
    }

    pub fn cache(&self) -> &CacheHandle<Record> {
        &self.cache
    }

    fn upstream_for(&self, name: &str) -> SocketAddr {
        self.maps
            .servers
            .find(name)
            .copied()
            .unwrap_or(self.default_upstream)
    }

    async fn resolve_a(
        &self,
        request: &Message,
        question: &Question,
        name: &str,
        upstream: SocketAddr,
    ) -> Result<(Record, Outcome)> {
        if let Some(cached) = self.cache.get(name) {
            return Ok((cached, Outcome::Cached));
        }

        if let Some(ip) = self.resolve_local(name)? {
            let IpAddr::V4(v4) = ip else {
                debug!("{} resolves locally to {}, not usable for an A answer", name, ip);
                return Err(Error::NotFound);
            };
            return Ok((
                Record::a(question.name.clone(), v4, LOCAL_ANSWER_TTL),
                Outcome::Local,
            ));
        }

        let mut answers = self.forward(request, question, upstream).await?;
        let Some(answer) = answers.pop() else {
            return Err(Error::NotFound);
        };
        self.cache.set(name, answer.clone());
        Ok((answer, Outcome::Forwarded(upstream)))
    }

    /// Walk the domains alias chain from `name`, then try the variables
    /// table once with whatever name the chain stopped at.
    ///
    /// `Ok(None)` means no local answer; a chain longer than
    /// [`MAX_ALIAS_DEPTH`] is reported as [`Error::NotFound`].
    fn resolve_local(&self, name: &str) -> Result<Option<IpAddr>> {
        let mut current = name;

        for _ in 0..MAX_ALIAS_DEPTH {
            match self.maps.domains.find(current) {
                Some(HostTarget::Ip(ip)) => return Ok(Some(*ip)),
                Some(HostTarget::Alias(alias)) => {
                    trace!("{} aliased to {}", current, alias);
                    current = alias;
                }
                None => {
                    return Ok(match self.maps.vars.find(current) {
                        Some(HostTarget::Ip(ip)) => Some(*ip),
                        _ => None,
                    });
                }
            }
        }

        debug!("alias chain from {} exceeded {} hops", name, MAX_ALIAS_DEPTH);
        Err(Error::NotFound)
    }

    /// Send the single-question copy of `request` upstream. Never empty on
    /// success.
    async fn forward(
        &self,
        request: &Message,
        question: &Question,
        upstream: SocketAddr,
    ) -> Result<Vec<Record>> {
        let query = request.with_question(question);
        let response = self.exchange.exchange(&query, upstream).await?;
        if response.answers.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(response.answers)
    }
}
