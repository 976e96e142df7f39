// Per-transfer peer list: every peer we know about, sorted by address, with
// connect-candidate bookkeeping and duplicate/self-connection resolution.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Server,
    Incoming,
    Callback,
    Resume,
}

/// Endpoints of one TCP connection to a peer, as the policy sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDesc {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub outgoing: bool,
    /// An outgoing attempt that has not completed yet.
    pub connecting: bool,
}

impl ConnectionDesc {
    pub fn connecting_to(remote: SocketAddr) -> Self {
        Self {
            local: SocketAddr::from(([0, 0, 0, 0], 0)),
            remote,
            outgoing: true,
            connecting: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    /// Incoming peers that never advertised a listen port cannot be
    /// connected back to.
    pub connectable: bool,
    pub seed: bool,
    pub banned: bool,
    pub failcount: u32,
    pub connection: Option<ConnectionDesc>,
    next_connect: Option<Instant>,
}

impl PolicyPeer {
    fn new(addr: SocketAddr, source: PeerSource, connectable: bool) -> Self {
        Self {
            addr,
            source,
            connectable,
            seed: false,
            banned: false,
            failcount: 0,
            connection: None,
            next_connect: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PolicyOptions {
    pub max_peerlist_size: usize,
    pub allow_multiple_connections_per_ip: bool,
    pub max_failcount: u32,
    pub min_reconnect_time: Duration,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            max_peerlist_size: 4000,
            allow_multiple_connections_per_ip: false,
            max_failcount: 3,
            min_reconnect_time: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum NewConnectionOutcome {
    Accepted,
    /// The new connection wins over a half-open one; the caller must close
    /// the returned connection.
    ReplacedExisting(ConnectionDesc),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConnectError {
    /// Both ends of the pair are us; the caller must also close the
    /// returned, previously-registered connection.
    #[error("connection to ourselves")]
    SelfConnection { existing: ConnectionDesc },
    #[error("duplicate peer connection")]
    DuplicatePeer,
    #[error("too many peers in list")]
    TooManyConnections,
    #[error("peer is banned")]
    Banned,
}

impl From<ConnectError> for Error {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::SelfConnection { .. } => Error::SelfConnection,
            ConnectError::DuplicatePeer => Error::DuplicatePeer,
            ConnectError::TooManyConnections => Error::TooManyConnections,
            ConnectError::Banned => Error::Banned,
        }
    }
}

pub struct Policy {
    /// Sorted by address.
    peers: VecDeque<PolicyPeer>,
    round_robin: usize,
    num_connect_candidates: usize,
    finished: bool,
    opts: PolicyOptions,
}

impl Policy {
    pub fn new(opts: PolicyOptions) -> Self {
        Self {
            peers: VecDeque::new(),
            round_robin: 0,
            num_connect_candidates: 0,
            finished: false,
            opts,
        }
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn num_connect_candidates(&self) -> usize {
        self.num_connect_candidates
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyPeer> {
        self.peers.iter()
    }

    fn is_connect_candidate(peer: &PolicyPeer, finished: bool, opts: &PolicyOptions) -> bool {
        peer.connection.is_none()
            && peer.connectable
            && !peer.banned
            && peer.failcount < opts.max_failcount
            && !(peer.seed && finished)
    }

    fn recount(&mut self) {
        self.num_connect_candidates = self
            .peers
            .iter()
            .filter(|p| Self::is_connect_candidate(p, self.finished, &self.opts))
            .count();
    }

    /// Apply `f` to the peer at `idx`, keeping the candidate count in step.
    fn mutate<R>(&mut self, idx: usize, f: impl FnOnce(&mut PolicyPeer) -> R) -> R {
        let was = Self::is_connect_candidate(&self.peers[idx], self.finished, &self.opts);
        let r = f(&mut self.peers[idx]);
        let now = Self::is_connect_candidate(&self.peers[idx], self.finished, &self.opts);
        match (was, now) {
            (true, false) => self.num_connect_candidates -= 1,
            (false, true) => self.num_connect_candidates += 1,
            _ => {}
        }
        r
    }

    /// Index of the peer entry this remote address belongs to: exact match
    /// when multiple connections per ip are allowed, by-ip otherwise.
    fn find_index(&self, remote: SocketAddr) -> Option<usize> {
        if self.opts.allow_multiple_connections_per_ip {
            self.peers
                .binary_search_by(|p| p.addr.cmp(&remote))
                .ok()
        } else {
            self.peers.iter().position(|p| p.addr.ip() == remote.ip())
        }
    }

    fn insert_sorted(&mut self, peer: PolicyPeer) {
        let idx = self
            .peers
            .binary_search_by(|p| p.addr.cmp(&peer.addr))
            .unwrap_or_else(|i| i);
        if Self::is_connect_candidate(&peer, self.finished, &self.opts) {
            self.num_connect_candidates += 1;
        }
        if self.round_robin >= idx && !self.peers.is_empty() {
            self.round_robin += 1;
        }
        self.peers.insert(idx, peer);
    }

    /// Called once for every peer learned from the server, resume data or a
    /// callback. Returns whether a new entry was created.
    pub fn add_peer(&mut self, addr: SocketAddr, source: PeerSource, connectable: bool) -> bool {
        if let Some(idx) = self.find_index(addr) {
            self.mutate(idx, |p| {
                p.connectable |= connectable;
            });
            return false;
        }
        if self.peers.len() >= self.opts.max_peerlist_size && !self.erase_one() {
            debug!(?addr, "peer list full, dropping peer");
            return false;
        }
        self.insert_sorted(PolicyPeer::new(addr, source, connectable));
        true
    }

    /// Drop the most erasable entry: not connected, preferring high
    /// failcounts and non-seeds.
    fn erase_one(&mut self) -> bool {
        let victim = self
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.connection.is_none())
            .max_by_key(|(_, p)| (p.failcount, !p.seed as u32))
            .map(|(i, _)| i);
        match victim {
            Some(idx) => {
                if Self::is_connect_candidate(&self.peers[idx], self.finished, &self.opts) {
                    self.num_connect_candidates -= 1;
                }
                self.peers.remove(idx);
                if self.round_robin > idx {
                    self.round_robin -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Register a connection, outbound completion and inbound accept alike.
    pub fn new_connection(
        &mut self,
        desc: ConnectionDesc,
        source: PeerSource,
    ) -> Result<NewConnectionOutcome, ConnectError> {
        let idx = match self.find_index(desc.remote) {
            Some(idx) => idx,
            None => {
                if self.peers.len() >= self.opts.max_peerlist_size && !self.erase_one() {
                    return Err(ConnectError::TooManyConnections);
                }
                // Incoming peers don't advertise a listen port.
                let mut peer = PolicyPeer::new(desc.remote, source, desc.outgoing);
                peer.connection = Some(desc);
                self.insert_sorted(peer);
                return Ok(NewConnectionOutcome::Accepted);
            }
        };

        if self.peers[idx].banned {
            return Err(ConnectError::Banned);
        }

        let existing = match self.peers[idx].connection {
            Some(existing) => existing,
            None => {
                self.mutate(idx, |p| p.connection = Some(desc));
                return Ok(NewConnectionOutcome::Accepted);
            }
        };

        // Our own outgoing attempt completing: fill in the real endpoints.
        if existing.connecting && desc.outgoing && existing.remote == desc.remote {
            self.peers[idx].connection = Some(desc);
            return Ok(NewConnectionOutcome::Accepted);
        }

        // When one socket's remote is the other's local, we connected to
        // our own listener. Both sides go.
        if existing.remote == desc.local || existing.local == desc.remote {
            trace!(remote = %desc.remote, "self connection detected");
            self.mutate(idx, |p| p.connection = None);
            return Err(ConnectError::SelfConnection { existing });
        }

        // Duplicate: keep the established (or outgoing) side.
        if !existing.connecting || desc.outgoing {
            return Err(ConnectError::DuplicatePeer);
        }
        self.peers[idx].connection = Some(desc);
        Ok(NewConnectionOutcome::ReplacedExisting(existing))
    }

    /// The connection to `remote` went away.
    pub fn connection_closed(&mut self, remote: SocketAddr, failed: bool, now: Instant) {
        let idx = match self
            .peers
            .iter()
            .position(|p| p.connection.map(|c| c.remote) == Some(remote))
        {
            Some(idx) => idx,
            None => return,
        };
        let min_reconnect = self.opts.min_reconnect_time;
        self.mutate(idx, |p| {
            p.connection = None;
            if failed {
                p.failcount += 1;
            }
            p.next_connect = Some(now + min_reconnect);
        });
    }

    /// Next outbound candidate under the round-robin cursor, marked as
    /// connecting. Respects the per-peer cool-down.
    pub fn connect_one_peer(&mut self, now: Instant) -> Option<SocketAddr> {
        if self.peers.is_empty() {
            return None;
        }
        for step in 0..self.peers.len() {
            let idx = (self.round_robin + step) % self.peers.len();
            let p = &self.peers[idx];
            if !Self::is_connect_candidate(p, self.finished, &self.opts) {
                continue;
            }
            if p.next_connect.map(|t| t > now).unwrap_or(false) {
                continue;
            }
            let addr = p.addr;
            self.mutate(idx, |p| {
                p.connection = Some(ConnectionDesc::connecting_to(addr));
            });
            self.round_robin = (idx + 1) % self.peers.len();
            return Some(addr);
        }
        None
    }

    pub fn inc_failcount(&mut self, remote: SocketAddr) {
        if let Some(idx) = self.peers.iter().position(|p| p.addr == remote) {
            self.mutate(idx, |p| p.failcount += 1);
        }
    }

    pub fn ban_peer(&mut self, remote: SocketAddr) {
        if let Some(idx) = self.peers.iter().position(|p| p.addr == remote) {
            self.mutate(idx, |p| p.banned = true);
        }
    }

    pub fn set_seed(&mut self, remote: SocketAddr, seed: bool) {
        if let Some(idx) = self.peers.iter().position(|p| p.addr == remote) {
            self.mutate(idx, |p| p.seed = seed);
        }
    }

    /// Seeds stop being candidates once we are finished ourselves.
    pub fn set_finished(&mut self, finished: bool) {
        if self.finished != finished {
            self.finished = finished;
            self.recount();
        }
    }

    #[cfg(test)]
    fn assert_candidate_count(&self) {
        let expected = self
            .peers
            .iter()
            .filter(|p| Self::is_connect_candidate(p, self.finished, &self.opts))
            .count();
        assert_eq!(self.num_connect_candidates, expected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], port))
    }

    fn policy() -> Policy {
        Policy::new(PolicyOptions::default())
    }

    #[test]
    fn test_add_peer_dedups_and_counts() {
        let mut p = policy();
        assert!(p.add_peer(addr(1, 4662), PeerSource::Server, true));
        assert!(!p.add_peer(addr(1, 4662), PeerSource::Server, true));
        assert!(p.add_peer(addr(2, 4662), PeerSource::Server, false));
        assert_eq!(p.num_peers(), 2);
        // Only the connectable peer is a candidate.
        assert_eq!(p.num_connect_candidates(), 1);
        p.assert_candidate_count();
    }

    #[test]
    fn test_connect_one_peer_round_robin() {
        let mut p = policy();
        for i in 1..=3 {
            p.add_peer(addr(i, 4662), PeerSource::Server, true);
        }
        let now = Instant::now();
        let first = p.connect_one_peer(now).unwrap();
        let second = p.connect_one_peer(now).unwrap();
        let third = p.connect_one_peer(now).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        // All are marked connecting; nothing left to hand out.
        assert_eq!(p.connect_one_peer(now), None);
        assert_eq!(p.num_connect_candidates(), 0);
        p.assert_candidate_count();
    }

    #[test]
    fn test_cooldown_respected() {
        let mut p = policy();
        p.add_peer(addr(1, 4662), PeerSource::Server, true);
        let now = Instant::now();
        let peer = p.connect_one_peer(now).unwrap();
        p.connection_closed(peer, true, now);
        // Still cooling down.
        assert_eq!(p.connect_one_peer(now + Duration::from_secs(1)), None);
        assert_eq!(
            p.connect_one_peer(now + Duration::from_secs(61)),
            Some(peer)
        );
        p.assert_candidate_count();
    }

    #[test]
    fn test_failcount_exhausts_candidate() {
        let mut p = policy();
        p.add_peer(addr(1, 4662), PeerSource::Server, true);
        let mut now = Instant::now();
        for _ in 0..3 {
            let peer = p.connect_one_peer(now).unwrap();
            p.connection_closed(peer, true, now);
            now += Duration::from_secs(120);
        }
        // failcount reached the limit; no longer a candidate (I4).
        assert_eq!(p.num_connect_candidates(), 0);
        assert_eq!(p.connect_one_peer(now), None);
        p.assert_candidate_count();
    }

    #[test]
    fn test_incoming_connection_creates_entry() {
        let mut p = policy();
        let desc = ConnectionDesc {
            local: addr(9, 4662),
            remote: addr(1, 50000),
            outgoing: false,
            connecting: false,
        };
        assert_eq!(
            p.new_connection(desc, PeerSource::Incoming),
            Ok(NewConnectionOutcome::Accepted)
        );
        assert_eq!(p.num_peers(), 1);
        // Incoming peers are not connectable, so not candidates.
        assert_eq!(p.num_connect_candidates(), 0);
        p.assert_candidate_count();
    }

    #[test]
    fn test_self_connection_detected_and_both_dropped() {
        let mut p = policy();
        p.add_peer(addr(1, 4662), PeerSource::Server, true);
        let now = Instant::now();
        let remote = p.connect_one_peer(now).unwrap();

        // The accept side of our own outgoing socket: its local address is
        // the listener we dialed.
        let incoming = ConnectionDesc {
            local: addr(1, 4662),
            remote: addr(1, 51111),
            outgoing: false,
            connecting: false,
        };
        match p.new_connection(incoming, PeerSource::Incoming) {
            Err(ConnectError::SelfConnection { existing }) => {
                assert_eq!(existing.remote, remote);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // No peer remains connected.
        assert!(p.iter().all(|peer| peer.connection.is_none()));
        p.assert_candidate_count();
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let mut p = policy();
        let established = ConnectionDesc {
            local: addr(9, 4662),
            remote: addr(1, 50000),
            outgoing: false,
            connecting: false,
        };
        p.new_connection(established, PeerSource::Incoming).unwrap();
        // A second concurrent connection from the same address loses.
        let second = ConnectionDesc {
            local: addr(9, 4662),
            remote: addr(1, 50001),
            outgoing: false,
            connecting: false,
        };
        assert_eq!(
            p.new_connection(second, PeerSource::Incoming),
            Err(ConnectError::DuplicatePeer)
        );
        p.assert_candidate_count();
    }

    #[test]
    fn test_incoming_wins_over_half_open_outgoing() {
        let mut p = policy();
        p.add_peer(addr(1, 4662), PeerSource::Server, true);
        let now = Instant::now();
        let remote = p.connect_one_peer(now).unwrap();
        // While our dial is in flight the same peer connects in. Their
        // socket's local address is theirs, not ours, so this is not a
        // self-connection.
        let incoming = ConnectionDesc {
            local: addr(9, 4662),
            remote: addr(1, 50000),
            outgoing: false,
            connecting: false,
        };
        match p.new_connection(incoming, PeerSource::Incoming) {
            Ok(NewConnectionOutcome::ReplacedExisting(existing)) => {
                assert_eq!(existing.remote, remote);
                assert!(existing.connecting);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        p.assert_candidate_count();
    }

    #[test]
    fn test_multiple_connections_per_ip_allowed_when_configured() {
        let mut p = Policy::new(PolicyOptions {
            allow_multiple_connections_per_ip: true,
            ..Default::default()
        });
        let first = ConnectionDesc {
            local: addr(9, 4662),
            remote: addr(1, 50000),
            outgoing: false,
            connecting: false,
        };
        let second = ConnectionDesc {
            local: addr(9, 4662),
            remote: addr(1, 50001),
            outgoing: false,
            connecting: false,
        };
        assert_eq!(
            p.new_connection(first, PeerSource::Incoming),
            Ok(NewConnectionOutcome::Accepted)
        );
        assert_eq!(
            p.new_connection(second, PeerSource::Incoming),
            Ok(NewConnectionOutcome::Accepted)
        );
        assert_eq!(p.num_peers(), 2);
    }

    #[test]
    fn test_erase_pass_prefers_failed_peers() {
        let mut p = Policy::new(PolicyOptions {
            max_peerlist_size: 2,
            ..Default::default()
        });
        p.add_peer(addr(1, 4662), PeerSource::Server, true);
        p.add_peer(addr(2, 4662), PeerSource::Server, true);
        p.inc_failcount(addr(2, 4662));
        // Full: inserting a third erases the failed one.
        assert!(p.add_peer(addr(3, 4662), PeerSource::Server, true));
        assert_eq!(p.num_peers(), 2);
        assert!(p.iter().all(|peer| peer.addr != addr(2, 4662)));
        p.assert_candidate_count();
    }

    #[test]
    fn test_seeds_not_candidates_when_finished() {
        let mut p = policy();
        p.add_peer(addr(1, 4662), PeerSource::Server, true);
        p.add_peer(addr(2, 4662), PeerSource::Server, true);
        p.set_seed(addr(1, 4662), true);
        assert_eq!(p.num_connect_candidates(), 2);
        p.set_finished(true);
        assert_eq!(p.num_connect_candidates(), 1);
        p.set_finished(false);
        assert_eq!(p.num_connect_candidates(), 2);
        p.assert_candidate_count();
    }

    #[test]
    fn test_banned_peer_rejected() {
        let mut p = policy();
        p.add_peer(addr(1, 4662), PeerSource::Server, true);
        p.ban_peer(addr(1, 4662));
        assert_eq!(p.num_connect_candidates(), 0);
        let desc = ConnectionDesc {
            local: addr(9, 4662),
            remote: addr(1, 50000),
            outgoing: false,
            connecting: false,
        };
        assert_eq!(
            p.new_connection(desc, PeerSource::Incoming),
            Err(ConnectError::Banned)
        );
    }
}
