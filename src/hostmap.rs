//! Local override tables.
//!
//! A [`HostMap`] is the raw `pattern -> target` table from the
//! configuration. Compiling it yields a [`CompiledHostMap`], an ordered list
//! of glob matchers where the first matching pattern wins.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};

use crate::error::{Error, Result};
use crate::glob::Glob;

/// Hierarchy separator for domain patterns.
const LABEL_SEPARATOR: char = '.';

/// Port used for upstream addresses given without one.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Canonical form of a domain name: lower-case with a trailing dot.
pub fn fqdn(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Parse an upstream address, `ip` or `ip:port`.
pub fn parse_upstream(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok(socket);
    }
    addr.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| Error::Config(format!("invalid upstream address {addr:?}")))
}

/// Raw override table, kept in the order the entries were written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostMap(Vec<(String, String)>);

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. A repeated pattern replaces the earlier target in place.
    pub fn insert(&mut self, pattern: impl Into<String>, target: impl Into<String>) {
        let pattern = pattern.into();
        let target = target.into();
        match self.0.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = target,
            None => self.0.push((pattern, target)),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, t)| (p.as_str(), t.as_str()))
    }

    /// Compile into a domain/variable map: literal IP targets become
    /// terminal entries, anything else an alias to look up next.
    pub fn compile(&self) -> Result<CompiledHostMap<HostTarget>> {
        self.compile_with(|target| {
            Ok(match target.trim().parse::<IpAddr>() {
                Ok(ip) => HostTarget::Ip(ip),
                Err(_) => HostTarget::Alias(fqdn(target)),
            })
        })
    }

    /// Compile into an upstream routing map whose targets are server
    /// addresses.
    pub fn compile_servers(&self) -> Result<CompiledHostMap<SocketAddr>> {
        self.compile_with(parse_upstream)
    }

    fn compile_with<T>(
        &self,
        mut parse_target: impl FnMut(&str) -> Result<T>,
    ) -> Result<CompiledHostMap<T>> {
        let mut entries = Vec::with_capacity(self.0.len());
        for (pattern, target) in &self.0 {
            let glob = Glob::compile(&fqdn(pattern), LABEL_SEPARATOR)?;
            entries.push(CompiledHostEntry {
                pattern: glob,
                target: parse_target(target)?,
            });
        }
        Ok(CompiledHostMap { entries })
    }
}

impl<P: Into<String>, T: Into<String>> FromIterator<(P, T)> for HostMap {
    fn from_iter<I: IntoIterator<Item = (P, T)>>(iter: I) -> Self {
        let mut map = HostMap::new();
        for (pattern, target) in iter {
            map.insert(pattern, target);
        }
        map
    }
}

impl<'de> Deserialize<'de> for HostMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HostMapVisitor;

        impl<'de> Visitor<'de> for HostMapVisitor {
            type Value = HostMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of pattern to target strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<HostMap, A::Error> {
                let mut map = HostMap::new();
                while let Some((pattern, target)) = access.next_entry::<String, String>()? {
                    map.insert(pattern, target);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(HostMapVisitor)
    }
}

/// What a domain or variable pattern resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTarget {
    /// A literal address, ending resolution.
    Ip(IpAddr),
    /// Another name to look up.
    Alias(String),
}

#[derive(Debug, Clone)]
pub struct CompiledHostEntry<T> {
    pub pattern: Glob,
    pub target: T,
}

/// Ordered list of compiled entries. Immutable once built.
#[derive(Debug, Clone)]
pub struct CompiledHostMap<T> {
    entries: Vec<CompiledHostEntry<T>>,
}

impl<T> CompiledHostMap<T> {
    /// Target of the first entry, in compile order, whose pattern matches
    /// the canonical `name`.
    pub fn find(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|entry| entry.pattern.is_match(name))
            .map(|entry| &entry.target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for CompiledHostMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn fqdn_appends_dot_and_lowercases() {
        assert_eq!(fqdn("Example.COM"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
    }

    #[test]
    fn compile_splits_ips_and_aliases() {
        let map: HostMap = [("a.com", "b.net"), ("b.net", "1.2.3.4")].into_iter().collect();
        let compiled = map.compile().unwrap();

        assert_eq!(
            compiled.find("a.com."),
            Some(&HostTarget::Alias("b.net.".into()))
        );
        assert_eq!(
            compiled.find("b.net."),
            Some(&HostTarget::Ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))))
        );
        assert_eq!(compiled.find("c.org."), None);
    }

    #[test]
    fn find_is_first_match_wins() {
        let map: HostMap = [
            ("**.test.com", "10.0.0.1"),
            ("**.com", "10.0.0.2"),
            ("yo.test.com", "10.0.0.3"),
        ]
        .into_iter()
        .collect();
        let compiled = map.compile().unwrap();

        assert_eq!(
            compiled.find("yo.test.com."),
            Some(&HostTarget::Ip("10.0.0.1".parse().unwrap()))
        );
    }

    #[test]
    fn deserialize_keeps_document_order() {
        let map: HostMap =
            serde_json::from_str(r#"{"z.com": "1.1.1.1", "a.com": "2.2.2.2", "m.com": "x"}"#)
                .unwrap();
        let patterns: Vec<_> = map.iter().map(|(p, _)| p).collect();

        assert_eq!(patterns, ["z.com", "a.com", "m.com"]);
    }

    #[test]
    fn compile_servers_defaults_port() {
        let map: HostMap = [("a.com", "5.6.7.8"), ("b.com", "9.9.9.9:5353")]
            .into_iter()
            .collect();
        let compiled = map.compile_servers().unwrap();

        assert_eq!(compiled.find("a.com."), Some(&"5.6.7.8:53".parse::<SocketAddr>().unwrap()));
        assert_eq!(compiled.find("b.com."), Some(&"9.9.9.9:5353".parse::<SocketAddr>().unwrap()));
    }

    #[test]
    fn compile_reports_bad_patterns() {
        let map: HostMap = [("[oops", "1.2.3.4")].into_iter().collect();

        assert!(matches!(map.compile(), Err(Error::Compile { .. })));
    }

    #[test]
    fn compile_servers_rejects_bad_address() {
        let map: HostMap = [("a.com", "not-an-address")].into_iter().collect();

        assert!(matches!(map.compile_servers(), Err(Error::Config(_))));
    }
}
