// Alerts are the only path by which engine events reach the embedding
// application. Producers post into a single FIFO queue; the consumer drains
// it with `pop_alert` or waits on `wait_for_alert`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use libed2k_core::hash_id::Md4Hash;
use parking_lot::Mutex;
use tokio::sync::Notify;
use wire_protocol::server::SharedFileEntry;

pub mod category {
    pub const STATUS: u32 = 1 << 0;
    pub const SERVER: u32 = 1 << 1;
    pub const SEARCH: u32 = 1 << 2;
    pub const PEER: u32 = 1 << 3;
    pub const TRANSFER: u32 = 1 << 4;
    pub const STORAGE: u32 = 1 << 5;
    pub const ALL: u32 = u32::MAX;
}

#[derive(Debug, Clone)]
pub enum Alert {
    ServerConnectionInitialized {
        client_id: u32,
        users: u32,
        files: u32,
    },
    ServerMessage {
        text: String,
    },
    ServerConnectionFailed {
        error: String,
    },
    SearchResult {
        results: Vec<SharedFileEntry>,
    },
    TransferAdded {
        hash: Md4Hash,
    },
    TransferFinished {
        hash: Md4Hash,
    },
    TransferPaused {
        hash: Md4Hash,
    },
    TransferError {
        hash: Md4Hash,
        error: String,
    },
    PeerConnected {
        hash: Md4Hash,
        addr: SocketAddr,
    },
    PeerDisconnected {
        hash: Md4Hash,
        addr: SocketAddr,
        reason: String,
    },
    ListenFailed {
        port: u16,
        error: String,
    },
}

impl Alert {
    pub fn category(&self) -> u32 {
        match self {
            Alert::ServerConnectionInitialized { .. }
            | Alert::ServerMessage { .. }
            | Alert::ServerConnectionFailed { .. } => category::SERVER,
            Alert::SearchResult { .. } => category::SEARCH,
            Alert::TransferAdded { .. }
            | Alert::TransferFinished { .. }
            | Alert::TransferPaused { .. } => category::TRANSFER,
            Alert::TransferError { .. } => category::TRANSFER | category::STORAGE,
            Alert::PeerConnected { .. } | Alert::PeerDisconnected { .. } => category::PEER,
            Alert::ListenFailed { .. } => category::STATUS,
        }
    }
}

const QUEUE_LIMIT: usize = 1000;

pub struct AlertManager {
    queue: Mutex<VecDeque<Alert>>,
    mask: AtomicU32,
    notify: Notify,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(category::ALL)
    }
}

impl AlertManager {
    pub fn new(mask: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            mask: AtomicU32::new(mask),
            notify: Notify::new(),
        }
    }

    pub fn set_mask(&self, mask: u32) {
        self.mask.store(mask, Ordering::Relaxed);
    }

    pub fn should_post(&self, category: u32) -> bool {
        self.mask.load(Ordering::Relaxed) & category != 0
    }

    pub fn post(&self, alert: Alert) {
        if !self.should_post(alert.category()) {
            return;
        }
        let mut q = self.queue.lock();
        if q.len() >= QUEUE_LIMIT {
            // Oldest alerts give way; the queue must not grow without a
            // consumer.
            q.pop_front();
        }
        q.push_back(alert);
        drop(q);
        self.notify.notify_waiters();
    }

    pub fn pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub fn pop_alert(&self) -> Option<Alert> {
        self.queue.lock().pop_front()
    }

    pub async fn wait_for_alert(&self, timeout: Duration) -> Option<Alert> {
        loop {
            let notified = self.notify.notified();
            if let Some(alert) = self.pop_alert() {
                return Some(alert);
            }
            if tokio::time::timeout(timeout, notified).await.is_err() {
                return self.pop_alert();
            }
        }
    }
}
