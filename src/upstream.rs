//! Upstream exchange.
//!
//! The resolver talks to upstream servers only through [`Exchange`], so tests
//! can swap the network for a recording double.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::dns::{Header, Message};
use crate::error::{Error, Result};
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Default time allowed for one upstream round trip.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends a request to an upstream server and returns its response.
pub trait Exchange: Send + Sync {
    fn exchange(
        &self,
        request: &Message,
        server: SocketAddr,
    ) -> impl Future<Output = Result<Message>> + Send;
}

enum UdpReply {
    Complete(Message),
    Truncated,
}

/// Plain DNS over UDP, retrying over TCP when the answer is truncated.
#[derive(Debug, Clone)]
pub struct UdpExchange {
    timeout: Duration,
}

impl UdpExchange {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange_udp(&self, query: &[u8], id: u16, server: SocketAddr) -> Result<UdpReply> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        socket.send(query).await?;

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let len = socket.recv(&mut buf).await?;
            let reply = &buf[..len];
            let Some(header) = Header::peek(reply) else {
                debug!("dropping {} byte reply from {}", len, server);
                continue;
            };
            if header.id != id {
                debug!("dropping reply with id {} from {}, expected {}", header.id, server, id);
                continue;
            }
            // A truncated body may not parse, the header alone decides the retry
            if header.is_truncated() {
                return Ok(UdpReply::Truncated);
            }
            match Message::parse(reply) {
                Ok(response) => return Ok(UdpReply::Complete(response)),
                Err(e) => debug!("dropping unparsable reply from {}: {}", server, e),
            }
        }
    }

    async fn exchange_tcp(&self, query: &[u8], server: SocketAddr) -> Result<Message> {
        let len = u16::try_from(query.len())
            .map_err(|_| Error::Protocol(format!("{} byte query", query.len())))?;
        let mut stream = TcpStream::connect(server).await?;

        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(query);
        stream.write_all(&framed).await?;

        let response_len = stream.read_u16().await? as usize;
        let mut response = vec![0u8; response_len];
        stream.read_exact(&mut response).await?;

        Message::parse(&response)
    }
}

impl Default for UdpExchange {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_TIMEOUT)
    }
}

impl Exchange for UdpExchange {
    fn exchange(
        &self,
        request: &Message,
        server: SocketAddr,
    ) -> impl Future<Output = Result<Message>> + Send {
        let encoded = request.to_bytes();
        let id = request.id;

        async move {
            let query = encoded?;
            let reply = timeout(self.timeout, self.exchange_udp(&query, id, server))
                .await
                .map_err(|_| Error::Timeout(server))??;
            if let UdpReply::Complete(response) = reply {
                return Ok(response);
            }

            debug!("truncated reply from {}, retrying over TCP", server);
            timeout(self.timeout, self.exchange_tcp(&query, server))
                .await
                .map_err(|_| Error::Timeout(server))?
        }
    }
}
