//! DNS forwarding proxy with local overrides.
//!
//! Queries are answered from glob-matched local tables when possible and
//! forwarded upstream otherwise, with upstream A answers kept in a
//! time-sharded cache.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod glob;
pub mod hostmap;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use error::{Error, Result};
