//! UDP presence discovery. A broadcaster announces this node every few
//! seconds; a listener folds everyone else's announcements into the peer
//! table. Liveness is lease-based: peers silent past the timeout are
//! evicted on the next `get_active_peers` call.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use uuid::Uuid;

use crate::protocol::{Announce, ANNOUNCE_KIND};

pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(3);
/// A peer unheard for this long is considered offline.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DATAGRAM: usize = 1024;

/// Table entry for one remote node, keyed by its session id. Only the
/// discovery listener and eviction mutate these; inbound chat and file
/// frames never do.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub nickname: String,
    pub room_name: String,
    pub is_private: bool,
    pub last_seen: Instant,
}

pub struct PeerDiscovery {
    session_id: String,
    local_ip: IpAddr,
    port: u16,
    broadcast_interval: Duration,
    announce: Mutex<Announce>,
    running: Arc<AtomicBool>,
    socket: UdpSocket,
    peers: DashMap<String, Peer>,
}

impl PeerDiscovery {
    pub fn new(
        nickname: &str,
        tcp_port: u16,
        room_name: &str,
        is_private: bool,
        port: u16,
        broadcast_interval: Duration,
    ) -> Result<Self> {
        // uuid4 prefix: 8 hex chars is plenty for one broadcast domain.
        let session_id = Uuid::new_v4().to_string()[..8].to_string();

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("create discovery socket")?;
        socket
            .set_reuse_address(true)
            .context("set SO_REUSEADDR")?;
        socket.set_broadcast(true).context("set SO_BROADCAST")?;
        socket
            .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())
            .with_context(|| format!("bind discovery socket on UDP {port}"))?;
        let socket: UdpSocket = socket.into();
        socket.set_nonblocking(true)?;
        info!("[Discovery] UDP bound (port {port})");

        let announce = Announce {
            kind: ANNOUNCE_KIND.to_string(),
            nickname: nickname.to_string(),
            session_id: session_id.clone(),
            tcp_port,
            room_name: room_name.to_string(),
            is_private,
        };

        Ok(Self {
            session_id,
            local_ip: detect_local_ip(),
            port,
            broadcast_interval,
            announce: Mutex::new(announce),
            running: Arc::new(AtomicBool::new(false)),
            socket,
            peers: DashMap::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Nickname changes take effect on the next broadcast tick.
    pub fn set_nickname(&self, nickname: &str) {
        self.announce.lock().nickname = nickname.to_string();
    }

    /// Launch listener and broadcaster threads. Non-blocking.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let listener = Arc::clone(self);
        thread::spawn(move || listener.listen_loop());
        let broadcaster = Arc::clone(self);
        thread::spawn(move || broadcaster.broadcast_loop());
        let nickname = self.announce.lock().nickname.clone();
        info!("[Discovery] started ({}_{})", nickname, self.session_id);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("[Discovery] stopped");
    }

    fn broadcast_loop(&self) {
        while self.running.load(Ordering::Relaxed) {
            // Serialize fresh each tick so nickname changes propagate.
            let announce = self.announce.lock().clone();
            if let Ok(data) = serde_json::to_vec(&announce) {
                let _ = self
                    .socket
                    .send_to(&data, (Ipv4Addr::BROADCAST, self.port));
            }
            thread::sleep(self.broadcast_interval);
        }
    }

    fn listen_loop(&self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        while self.running.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, addr)) => self.handle_datagram(&buf[..n], addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        warn!("[Discovery] recv error: {e}");
                    }
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        // Malformed or foreign datagrams are dropped without comment.
        let Ok(announce) = serde_json::from_slice::<Announce>(data) else {
            return;
        };
        if announce.kind != ANNOUNCE_KIND || announce.session_id == self.session_id {
            return;
        }
        self.peers.insert(
            announce.session_id,
            Peer {
                ip: addr.ip(),
                tcp_port: announce.tcp_port,
                nickname: announce.nickname,
                room_name: announce.room_name,
                is_private: announce.is_private,
                last_seen: Instant::now(),
            },
        );
    }

    /// Live peers, evicting everything past `timeout` as a side effect.
    pub fn get_active_peers(&self, timeout: Duration) -> HashMap<String, Peer> {
        let now = Instant::now();
        self.peers
            .retain(|_, peer| now.duration_since(peer.last_seen) <= timeout);
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Display-only disambiguator: last two IPv4 octets, zero padded.
    pub fn ip_short_id(ip: IpAddr) -> String {
        match ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                format!("{:03}.{:03}", o[2], o[3])
            }
            IpAddr::V6(_) => "???.???".to_string(),
        }
    }
}

/// First non-loopback IPv4 interface address, falling back to loopback.
fn detect_local_ip() -> IpAddr {
    if let Ok(ifaces) = get_if_addrs::get_if_addrs() {
        for iface in ifaces {
            if iface.is_loopback() {
                continue;
            }
            if let IpAddr::V4(v4) = iface.ip() {
                return IpAddr::V4(v4);
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn discovery() -> PeerDiscovery {
        // Port 0 keeps tests off the real discovery port.
        PeerDiscovery::new("Tester", 50001, "R", false, 0, DEFAULT_BROADCAST_INTERVAL).unwrap()
    }

    fn announce_json(session_id: &str, room: &str) -> Vec<u8> {
        serde_json::to_vec(&Announce {
            kind: ANNOUNCE_KIND.to_string(),
            nickname: "Bob".to_string(),
            session_id: session_id.to_string(),
            tcp_port: 50002,
            room_name: room.to_string(),
            is_private: false,
        })
        .unwrap()
    }

    #[test]
    fn short_id_formats_last_two_octets() {
        let ip: IpAddr = "192.168.0.121".parse().unwrap();
        assert_eq!(PeerDiscovery::ip_short_id(ip), "000.121");
        let ip6: IpAddr = "::1".parse().unwrap();
        assert_eq!(PeerDiscovery::ip_short_id(ip6), "???.???");
    }

    #[test]
    fn datagram_upserts_peer() {
        let d = discovery();
        let addr: SocketAddr = "10.0.0.9:50000".parse().unwrap();
        d.handle_datagram(&announce_json("bbbb2222", "R"), addr);
        let peers = d.get_active_peers(PEER_TIMEOUT);
        assert_eq!(peers.len(), 1);
        let peer = &peers["bbbb2222"];
        assert_eq!(peer.ip, addr.ip());
        assert_eq!(peer.tcp_port, 50002);
        assert_eq!(peer.room_name, "R");
    }

    #[test]
    fn own_announce_and_garbage_are_ignored() {
        let d = discovery();
        let addr: SocketAddr = "10.0.0.9:50000".parse().unwrap();
        let own = announce_json(&d.session_id().to_string(), "R");
        d.handle_datagram(&own, addr);
        d.handle_datagram(b"{not json", addr);
        d.handle_datagram(b"{\"type\":\"OTHER\"}", addr);
        assert!(d.get_active_peers(PEER_TIMEOUT).is_empty());
    }

    #[test]
    fn stale_peer_is_evicted_on_access() {
        let d = discovery();
        let addr: SocketAddr = "10.0.0.9:50000".parse().unwrap();
        d.handle_datagram(&announce_json("bbbb2222", "R"), addr);
        d.peers.get_mut("bbbb2222").unwrap().last_seen =
            Instant::now() - Duration::from_secs(11);
        assert!(d.get_active_peers(PEER_TIMEOUT).is_empty());
        // Eviction is a side effect, not just a filter.
        assert!(d.peers.is_empty());
    }

    #[test]
    fn session_id_is_eight_chars() {
        assert_eq!(discovery().session_id().len(), 8);
    }
}
