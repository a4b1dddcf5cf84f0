use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

pub const MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

/// One inbound datagram, tagged with when it was received so the engine can
/// stamp cached records without calling the wall clock itself.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub source: SocketAddr,
    pub recv_time_ms: u64,
}

/// The transport the engine drives: send a reply, receive the next
/// datagram, join the multicast group, tear down.
///
/// Mirrors the split between [`donos_server`]'s `Receiver`/`Sender`, folded
/// into one trait object so the engine can hold either the live
/// [`UdpTransport`] or a test double.
#[async_trait::async_trait]
pub trait Socket: Send + Sync {
    async fn send(&self, bytes: &[u8], addr: SocketAddr) -> std::io::Result<()>;
    async fn recv(&self) -> std::io::Result<Datagram>;
    async fn join_multicast(&self, group: Ipv4Addr, iface: Ipv4Addr) -> std::io::Result<()>;
    /// Recreates the underlying socket at the same bind address and rejoins
    /// whatever multicast group was last joined — the engine's §7 recovery
    /// path after a recv/send IoError.
    async fn rebind(&self) -> std::io::Result<()>;
    async fn close(&self);
}

pub struct UdpTransport {
    address: SocketAddr,
    socket: tokio::sync::RwLock<Arc<UdpSocket>>,
    multicast: tokio::sync::Mutex<Option<(Ipv4Addr, Ipv4Addr)>>,
}

impl UdpTransport {
    pub async fn bind(address: SocketAddr) -> std::io::Result<Self> {
        let socket = Self::bind_socket(address).await?;
        Ok(Self {
            address,
            socket: tokio::sync::RwLock::new(Arc::new(socket)),
            multicast: tokio::sync::Mutex::new(None),
        })
    }

    async fn bind_socket(address: SocketAddr) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind(address).await?;
        socket.set_multicast_loop_v4(true)?;
        Ok(socket)
    }
}

/// Milliseconds since the epoch, the one place this crate calls the wall
/// clock directly; everywhere else a timestamp is threaded in as a value.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait::async_trait]
impl Socket for UdpTransport {
    async fn send(&self, bytes: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        tracing::debug!(?addr, len = bytes.len(), "sending message");
        self.socket.read().await.send_to(bytes, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<Datagram> {
        // Sized to the protocol ceiling, not our own configured send size:
        // a peer advertising a larger sender UDP payload size must not be
        // truncated just because we chose to send smaller messages.
        let mut buf = vec![0u8; mdns_proto::buffer::MAX_PAYLOAD_SIZE];
        let socket = self.socket.read().await.clone();
        let (size, source) = socket.recv_from(&mut buf).await?;
        buf.truncate(size);
        tracing::debug!(?source, len = size, "received message");
        Ok(Datagram {
            bytes: buf,
            source,
            recv_time_ms: now_ms(),
        })
    }

    async fn join_multicast(&self, group: Ipv4Addr, iface: Ipv4Addr) -> std::io::Result<()> {
        self.socket.read().await.join_multicast_v4(group, iface)?;
        *self.multicast.lock().await = Some((group, iface));
        Ok(())
    }

    async fn rebind(&self) -> std::io::Result<()> {
        tracing::warn!(address = %self.address, "rebinding mdns socket");
        let fresh = Self::bind_socket(self.address).await?;
        if let Some((group, iface)) = *self.multicast.lock().await {
            fresh.join_multicast_v4(group, iface)?;
        }
        *self.socket.write().await = Arc::new(fresh);
        Ok(())
    }

    async fn close(&self) {
        tracing::info!("closing mdns socket");
    }
}

pub fn multicast_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(MULTICAST_V4), MDNS_PORT)
}

#[cfg(test)]
pub struct MockSocket {
    pub sent: tokio::sync::Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    pub inbox: tokio::sync::Mutex<std::collections::VecDeque<Datagram>>,
    pub rebinds: std::sync::atomic::AtomicUsize,
    pub fail_recv_once: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl Default for MockSocket {
    fn default() -> Self {
        Self {
            sent: tokio::sync::Mutex::new(Vec::new()),
            inbox: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            rebinds: std::sync::atomic::AtomicUsize::new(0),
            fail_recv_once: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl Socket for MockSocket {
    async fn send(&self, bytes: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        self.sent.lock().await.push((bytes.to_vec(), addr));
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<Datagram> {
        if self.fail_recv_once.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::other("simulated recv failure"));
        }
        loop {
            if let Some(datagram) = self.inbox.lock().await.pop_front() {
                return Ok(datagram);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn join_multicast(&self, _group: Ipv4Addr, _iface: Ipv4Addr) -> std::io::Result<()> {
        Ok(())
    }

    async fn rebind(&self) -> std::io::Result<()> {
        self.rebinds.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {}
}
