//! Datagram transports: UDP multicast for real networks, an in-process hub
//! for tests.
//!
//! Send and receive errors are plain `std::io::Error`. The dissemination
//! loop treats any of them as one missed opportunity.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::NetworkSection;

/// A multicast medium: everything sent reaches every other member.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, datagram: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    fn recv(&self) -> impl Future<Output = io::Result<Bytes>> + Send;

    fn max_datagram_bytes(&self) -> usize;
}

fn oversize(len: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("datagram of {len} bytes exceeds {max}"),
    )
}

// ----------------------------------------------------------------------
// UDP multicast
// ----------------------------------------------------------------------

#[derive(Debug)]
pub struct UdpMulticastTransport {
    socket: UdpSocket,
    group: SocketAddr,
    max_datagram: usize,
}

impl UdpMulticastTransport {
    /// Bind and join the configured group. Must be called inside a tokio
    /// runtime.
    pub fn join(network: &NetworkSection) -> anyhow::Result<Self> {
        let group = network.group_addr()?;
        let bind = network.bind_addr()?;
        let std_sock = std::net::UdpSocket::bind(bind)?;

        match group.ip() {
            IpAddr::V4(addr) => {
                let interface = match &network.interface {
                    Some(iface) => iface.parse::<Ipv4Addr>().map_err(|e| {
                        anyhow::anyhow!("invalid IPv4 interface address {iface:?}: {e}")
                    })?,
                    None => Ipv4Addr::UNSPECIFIED,
                };
                std_sock.join_multicast_v4(&addr, &interface)?;
                std_sock.set_multicast_ttl_v4(network.ttl)?;
                std_sock.set_multicast_loop_v4(network.loopback)?;
            }
            IpAddr::V6(addr) => {
                let index = match &network.interface {
                    Some(iface) => iface.parse::<u32>().map_err(|e| {
                        anyhow::anyhow!("invalid IPv6 interface index {iface:?}: {e}")
                    })?,
                    None => 0,
                };
                std_sock.join_multicast_v6(&addr, index)?;
                std_sock.set_multicast_loop_v6(network.loopback)?;
            }
        }
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;

        tracing::info!(
            %group,
            %bind,
            interface = network.interface.as_deref().unwrap_or("any"),
            "joined multicast group"
        );
        Ok(Self {
            socket,
            group,
            max_datagram: network.max_datagram_bytes,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpMulticastTransport {
    async fn send(&self, datagram: Bytes) -> io::Result<()> {
        if datagram.len() > self.max_datagram {
            return Err(oversize(datagram.len(), self.max_datagram));
        }
        self.socket.send_to(&datagram, self.group).await?;
        Ok(())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        // One spare byte so oversize datagrams show up as oversize, not truncated.
        let mut buf = vec![0u8; self.max_datagram + 1];
        let (n, _from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn max_datagram_bytes(&self) -> usize {
        self.max_datagram
    }
}

// ----------------------------------------------------------------------
// In-memory hub
// ----------------------------------------------------------------------

/// Returns true when a datagram from `from` to `to` should be lost.
pub type DropFilter = Box<dyn FnMut(usize, usize, &Bytes) -> bool + Send>;

#[derive(Default)]
struct Hub {
    members: Vec<(usize, mpsc::UnboundedSender<Bytes>)>,
    blocked: HashSet<(usize, usize)>,
    filter: Option<DropFilter>,
    next_id: usize,
    delivered: u64,
    dropped: u64,
}

/// Shared medium connecting every `MemoryTransport` joined to it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hub = self.lock();
        f.debug_struct("MemoryNetwork")
            .field("members", &hub.members.len())
            .field("delivered", &hub.delivered)
            .field("dropped", &hub.dropped)
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn join(&self, max_datagram: usize) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.lock();
        let id = hub.next_id;
        hub.next_id += 1;
        hub.members.push((id, tx));
        MemoryTransport {
            id,
            network: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
            max_datagram,
        }
    }

    pub fn set_filter(&self, filter: DropFilter) {
        self.lock().filter = Some(filter);
    }

    /// Cut the link between two members, both ways.
    pub fn partition(&self, a: usize, b: usize) {
        let mut hub = self.lock();
        hub.blocked.insert((a, b));
        hub.blocked.insert((b, a));
    }

    pub fn heal(&self) {
        self.lock().blocked.clear();
    }

    /// (delivered, dropped) datagram counts across all links.
    pub fn counters(&self) -> (u64, u64) {
        let hub = self.lock();
        (hub.delivered, hub.dropped)
    }

    fn broadcast(&self, from: usize, datagram: Bytes) {
        let mut hub = self.lock();
        let Hub {
            members,
            blocked,
            filter,
            delivered,
            dropped,
            ..
        } = &mut *hub;
        members.retain(|(_, tx)| !tx.is_closed());
        for (to, tx) in members.iter() {
            if *to == from {
                continue;
            }
            let lost = blocked.contains(&(from, *to))
                || filter.as_mut().is_some_and(|f| f(from, *to, &datagram));
            if lost || tx.send(datagram.clone()).is_err() {
                *dropped += 1;
            } else {
                *delivered += 1;
            }
        }
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    id: usize,
    network: MemoryNetwork,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    max_datagram: usize,
}

impl MemoryTransport {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Transport for MemoryTransport {
    async fn send(&self, datagram: Bytes) -> io::Result<()> {
        if datagram.len() > self.max_datagram {
            return Err(oversize(datagram.len(), self.max_datagram));
        }
        self.network.broadcast(self.id, datagram);
        Ok(())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "memory network closed"))
    }

    fn max_datagram_bytes(&self) -> usize {
        self.max_datagram
    }
}
