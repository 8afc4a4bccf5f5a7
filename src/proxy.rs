//! DNS proxy orchestration.
//!
//! Builds the cache and resolver, binds transports and runs the proxy
//! server.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use log::{error, info};

use crate::cache::{CacheHandle, ShardCache};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::stats::Stats;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};
use crate::upstream::UdpExchange;

/// How often the stats line is logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Run the DNS proxy with the given settings.
///
/// Starts UDP and TCP transports on the bind address. Runs until one of
/// them fails.
pub async fn run(settings: Settings) -> Result<()> {
    let cache = CacheHandle::new(ShardCache::new(settings.expiration));
    let resolver = Arc::new(Resolver::new(
        UdpExchange::new(settings.exchange_timeout),
        cache,
        settings.maps,
        settings.default_upstream,
    ));
    let stats = Arc::new(Stats::new());

    info!("DNS proxy listening on {}", settings.bind_addr);
    info!("Default upstream: {}", settings.default_upstream);
    match settings.expiration {
        Some(expiration) => info!("Cache expiration: {:?}", expiration),
        None => info!("Cache expiration disabled"),
    }

    let udp = UdpTransport::bind(settings.bind_addr).await?;
    let tcp = TcpTransport::bind(settings.bind_addr).await?;

    let transports = vec![
        udp.start(Arc::clone(&resolver), Arc::clone(&stats)),
        tcp.start(Arc::clone(&resolver), Arc::clone(&stats)),
    ];

    // Log stats every minute
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = stats.snapshot_and_reset();
            let cache = resolver.cache();
            info!(
                "[stats] uptime={}s cache={} shards={} requests={} forwarded={} cached={} local={} failed={} other={} avg_response={:.2}ms",
                stats.uptime_secs,
                cache.len(),
                cache.shard_count(),
                stats.requests,
                stats.forwarded,
                stats.cached,
                stats.local,
                stats.failed,
                stats.other,
                stats.avg_response_ms
            );
        }
    });

    let (finished, _, _) = select_all(transports).await;
    let reason = match finished {
        Ok(()) => "transport stopped".to_string(),
        Err(e) => e.to_string(),
    };
    error!("{}", reason);
    Err(Error::Transport(io::Error::other(reason)))
}
