use std::num::NonZeroU32;
use std::time::Duration;

use libed2k_core::hash_id::Md4Hash;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A fresh client hash: random, with the classic eMule marker bytes so
/// other clients recognise the dialect.
pub fn random_client_hash() -> Md4Hash {
    let mut h = [0u8; 16];
    rand::rng().fill_bytes(&mut h);
    h[5] = 14;
    h[14] = 111;
    Md4Hash::new(h)
}

/// Session-wide configuration. Field defaults follow the reference client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Index server to log into. Empty means no server connection.
    pub server_hostname: String,
    pub server_port: u16,
    /// Port for incoming peer connections.
    pub listen_port: u16,
    pub client_name: String,
    /// The 16-byte hash identifying this client to servers and peers.
    pub client_hash: Md4Hash,

    /// Inactivity timeout on the server wire.
    pub server_timeout: Duration,
    /// Inactivity timeout on a peer wire.
    pub peer_timeout: Duration,
    /// Timeout for an outgoing peer connect attempt.
    pub peer_connect_timeout: Duration,
    /// Idle interval after which a keep-alive is sent to the server.
    pub server_keep_alive_timeout: Duration,
    /// Delay before reconnecting after losing the server.
    pub server_reconnect_timeout: Duration,

    pub allow_multiple_connections_per_ip: bool,
    /// Socket buffer sizes; 0 leaves the OS default.
    pub recv_socket_buffer_size: usize,
    pub send_socket_buffer_size: usize,

    /// Max peers remembered per transfer (known, not connected).
    pub max_peerlist_size: usize,
    /// Connect attempts after which a peer stops being a candidate.
    pub max_failcount: u32,
    /// Cool-down between connect attempts to the same peer.
    pub min_reconnect_time: Duration,
    /// New outgoing connections initiated per transfer tick.
    pub connect_speed: usize,
    /// Max concurrent peer connections per transfer.
    pub max_connections_per_transfer: usize,

    /// Outstanding block requests per peer.
    pub request_queue_size: usize,
    /// Duplicate outstanding requests once fewer than this many blocks
    /// remain unfinished.
    pub endgame_block_threshold: u32,
    /// Deadline for an outstanding block request before it is re-queued.
    pub block_request_timeout: Duration,

    /// `None` is unlimited.
    pub download_rate_limit: Option<NonZeroU32>,
    pub upload_rate_limit: Option<NonZeroU32>,

    /// Disk buffers the pool may hold at once.
    pub max_disk_buffers: usize,

    pub transfer_tick_interval: Duration,
    /// Bound on blocking work during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_hostname: String::new(),
            server_port: 4661,
            listen_port: 4662,
            client_name: "libed2k".to_owned(),
            client_hash: random_client_hash(),
            server_timeout: Duration::from_secs(220),
            peer_timeout: Duration::from_secs(120),
            peer_connect_timeout: Duration::from_secs(7),
            server_keep_alive_timeout: Duration::from_secs(200),
            server_reconnect_timeout: Duration::from_secs(5),
            allow_multiple_connections_per_ip: false,
            recv_socket_buffer_size: 0,
            send_socket_buffer_size: 0,
            max_peerlist_size: 4000,
            max_failcount: 3,
            min_reconnect_time: Duration::from_secs(60),
            connect_speed: 2,
            max_connections_per_transfer: 32,
            request_queue_size: 4,
            endgame_block_threshold: 8,
            block_request_timeout: Duration::from_secs(60),
            download_rate_limit: None,
            upload_rate_limit: None,
            max_disk_buffers: 256,
            transfer_tick_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_client() {
        let s = SessionSettings::default();
        assert_eq!(s.server_port, 4661);
        assert_eq!(s.listen_port, 4662);
        assert_eq!(s.server_timeout, Duration::from_secs(220));
        assert_eq!(s.peer_timeout, Duration::from_secs(120));
        assert_eq!(s.peer_connect_timeout, Duration::from_secs(7));
        assert_eq!(s.max_peerlist_size, 4000);
        assert!(!s.allow_multiple_connections_per_ip);
        assert!(s.download_rate_limit.is_none());
        assert!(s.upload_rate_limit.is_none());
    }

    #[test]
    fn test_client_hash_has_marker_bytes() {
        let a = SessionSettings::default().client_hash;
        let b = SessionSettings::default().client_hash;
        assert_eq!(a.0[5], 14);
        assert_eq!(a.0[14], 111);
        // Two sessions must not mistake each other for a self-connection.
        assert_ne!(a, b);
    }
}
