//! UDP transport for DNS queries.
//!
//! Each datagram is answered by its own task, so a slow upstream never holds
//! up other clients.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::resolver::Resolver;
use crate::stats::Stats;
use crate::upstream::Exchange;

use super::{MAX_DNS_PACKET_SIZE, Protocol, QueryLogger, answer_query};

/// Shortest datagram that can hold a DNS header.
const MIN_DNS_PACKET_SIZE: usize = 12;

/// UDP transport for DNS proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the UDP transport.
    ///
    /// Spawns the receive loop; the returned handle only completes if the
    /// loop dies.
    pub fn start<E: Exchange + 'static>(
        self,
        resolver: Arc<Resolver<E>>,
        stats: Arc<Stats>,
    ) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver, stats))
    }
}

/// Main receive loop for UDP transport.
async fn run<E: Exchange + 'static>(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver<E>>,
    stats: Arc<Stats>,
) {
    let logger = Arc::new(QueryLogger::new(Protocol::Udp));
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    if let Ok(addr) = socket.local_addr() {
        info!("UDP listening on {}", addr);
    }

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("UDP recv error: {}", e);
                continue;
            }
        };

        if len < MIN_DNS_PACKET_SIZE {
            continue;
        }

        let query = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let resolver = Arc::clone(&resolver);
        let stats = Arc::clone(&stats);
        let logger = Arc::clone(&logger);

        tokio::spawn(async move {
            let Some(response) = answer_query(&resolver, &stats, &logger, &query).await else {
                return;
            };
            if let Err(e) = socket.send_to(&response, src).await {
                error!("UDP response error: {}", e);
            }
        });
    }
}
