//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently and may carry several
//! queries in a row. TCP DNS messages are prefixed with a 2-byte length.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::resolver::Resolver;
use crate::stats::Stats;
use crate::upstream::Exchange;

use super::{Protocol, QueryLogger, answer_query};

/// TCP transport for DNS proxy.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start<E: Exchange + 'static>(
        self,
        resolver: Arc<Resolver<E>>,
        stats: Arc<Stats>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, resolver, stats))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop<E: Exchange + 'static>(
    listener: TcpListener,
    resolver: Arc<Resolver<E>>,
    stats: Arc<Stats>,
) {
    let logger = Arc::new(QueryLogger::new(Protocol::Tcp));

    if let Ok(addr) = listener.local_addr() {
        info!("TCP listening on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                let resolver = Arc::clone(&resolver);
                let stats = Arc::clone(&stats);
                let logger = Arc::clone(&logger);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(client, &resolver, &stats, &logger).await {
                        debug!("TCP connection from {} closed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("TCP accept error: {}", e);
            }
        }
    }
}

/// Serve queries from one connection until the client hangs up.
async fn handle_connection<E: Exchange>(
    mut client: TcpStream,
    resolver: &Resolver<E>,
    stats: &Stats,
    logger: &QueryLogger,
) -> io::Result<()> {
    loop {
        let Some(query) = read_dns_message(&mut client).await? else {
            return Ok(());
        };

        let Some(response) = answer_query(resolver, stats, logger, &query).await else {
            continue;
        };

        let len = u16::try_from(response.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "reply too large"))?;
        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&response);
        client.write_all(&framed).await?;
    }
}

/// Read a length-prefixed DNS message from a TCP stream.
///
/// Returns the message without its length prefix, or `None` on a clean
/// end of stream.
async fn read_dns_message(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let msg_len = match stream.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await?;

    Ok(Some(buf))
}
