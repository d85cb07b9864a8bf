//! DNS proxy: forwards guest queries to configured
//! upstreams over UDP and TCP, falling through to the next upstream on
//! `SERVFAIL` and only returning `SERVFAIL` once every upstream has.

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use matchlock_shared::{MatchlockError, MatchlockResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DnsProxy {
    upstreams: Vec<SocketAddr>,
    stopped: Arc<AtomicBool>,
}

impl DnsProxy {
    pub fn new(upstreams: Vec<SocketAddr>) -> Self {
        Self {
            upstreams,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind UDP and TCP on the same port and spawn both accept loops.
    pub async fn spawn(&self, bind_addr: SocketAddr) -> MatchlockResult<Vec<tokio::task::JoinHandle<()>>> {
        let udp = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| MatchlockError::Network(format!("binding DNS UDP {bind_addr}: {e}")))?;
        let tcp = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| MatchlockError::Network(format!("binding DNS TCP {bind_addr}: {e}")))?;

        let udp_handle = spawn_udp_loop(udp, self.upstreams.clone(), self.stopped.clone());
        let tcp_handle = spawn_tcp_loop(tcp, self.upstreams.clone(), self.stopped.clone());
        Ok(vec![udp_handle, tcp_handle])
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn spawn_udp_loop(socket: UdpSocket, upstreams: Vec<SocketAddr>, stopped: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; 4096];
        loop {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "DNS UDP recv failed; retrying");
                    continue;
                }
            };
            let query = buf[..len].to_vec();
            let socket = socket.clone();
            let upstreams = upstreams.clone();
            tokio::spawn(async move {
                if let Some(reply) = resolve_via_upstreams_udp(&query, &upstreams).await {
                    let _ = socket.send_to(&reply, peer).await;
                }
            });
        }
    })
}

fn spawn_tcp_loop(listener: TcpListener, upstreams: Vec<SocketAddr>, stopped: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "DNS TCP accept failed; retrying");
                    continue;
                }
            };
            let upstreams = upstreams.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_tcp_query(stream, &upstreams).await {
                    tracing::debug!(error = %e, "DNS TCP connection ended with error");
                }
            });
        }
    })
}

async fn handle_tcp_query(mut stream: TcpStream, upstreams: &[SocketAddr]) -> MatchlockResult<()> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| MatchlockError::Network(format!("reading DNS TCP length: {e}")))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut query = vec![0u8; len];
    stream
        .read_exact(&mut query)
        .await
        .map_err(|e| MatchlockError::Network(format!("reading DNS TCP body: {e}")))?;

    if let Some(reply) = resolve_via_upstreams_tcp(&query, upstreams).await {
        stream
            .write_all(&(reply.len() as u16).to_be_bytes())
            .await
            .map_err(|e| MatchlockError::Network(format!("writing DNS TCP length: {e}")))?;
        stream
            .write_all(&reply)
            .await
            .map_err(|e| MatchlockError::Network(format!("writing DNS TCP body: {e}")))?;
    }
    Ok(())
}

/// Try each upstream in order over UDP; only return `SERVFAIL` (or give
/// up silently) once every upstream has returned it or failed to answer.
async fn resolve_via_upstreams_udp(query: &[u8], upstreams: &[SocketAddr]) -> Option<Vec<u8>> {
    let mut last_servfail: Option<Vec<u8>> = None;
    for upstream in upstreams {
        match query_one_udp(query, *upstream).await {
            Some(reply) => {
                if is_servfail(&reply) {
                    last_servfail = Some(reply);
                    continue;
                }
                return Some(reply);
            }
            None => continue,
        }
    }
    last_servfail
}

async fn resolve_via_upstreams_tcp(query: &[u8], upstreams: &[SocketAddr]) -> Option<Vec<u8>> {
    let mut last_servfail: Option<Vec<u8>> = None;
    for upstream in upstreams {
        match query_one_tcp(query, *upstream).await {
            Some(reply) => {
                if is_servfail(&reply) {
                    last_servfail = Some(reply);
                    continue;
                }
                return Some(reply);
            }
            None => continue,
        }
    }
    last_servfail
}

fn is_servfail(reply: &[u8]) -> bool {
    Message::from_bytes(reply)
        .map(|m| m.response_code() == ResponseCode::ServFail)
        .unwrap_or(false)
}

async fn query_one_udp(query: &[u8], upstream: SocketAddr) -> Option<Vec<u8>> {
    let fut = async {
        let local_bind = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local_bind).await.ok()?;
        socket.connect(upstream).await.ok()?;
        socket.send(query).await.ok()?;
        let mut buf = vec![0u8; 4096];
        let len = socket.recv(&mut buf).await.ok()?;
        buf.truncate(len);
        Some(buf)
    };
    tokio::time::timeout(UPSTREAM_TIMEOUT, fut).await.ok().flatten()
}

async fn query_one_tcp(query: &[u8], upstream: SocketAddr) -> Option<Vec<u8>> {
    let fut = async {
        let mut stream = TcpStream::connect(upstream).await.ok()?;
        stream.write_all(&(query.len() as u16).to_be_bytes()).await.ok()?;
        stream.write_all(query).await.ok()?;
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.ok()?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.ok()?;
        Some(buf)
    };
    tokio::time::timeout(UPSTREAM_TIMEOUT, fut).await.ok().flatten()
}

/// Guest UDP to non-DNS addresses is dropped: the firewall only steers
/// port-53 UDP to this proxy's bind address, so nothing else reaches it
/// by construction.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servfail_detection_on_malformed_bytes_is_false() {
        assert!(!is_servfail(b"not a dns message"));
    }
}
