//! The orchestrator-facing slice of the hub layer: which users are currently
//! visible on a hub, and the channel through which the download queue asks
//! for a peer session to be opened. Protocol handling lives outside the
//! engine; whoever drives the hubs feeds this registry.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Request to open a client-client connection to a user, emitted by the
/// download queue when it selects a `NotConnected` candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub uid: u64,
}

#[derive(Debug)]
pub struct HubRegistry {
    // uid -> hubs on which the user is currently online.
    online: Mutex<HashMap<u64, HashSet<u64>>>,
    connect_tx: mpsc::UnboundedSender<ConnectRequest>,
}

impl HubRegistry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectRequest>) {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        (
            Self {
                online: Mutex::new(HashMap::new()),
                connect_tx,
            },
            connect_rx,
        )
    }

    pub fn user_online(&self, hub: u64, uid: u64) {
        self.online
            .lock()
            .expect("hub registry")
            .entry(uid)
            .or_default()
            .insert(hub);
    }

    pub fn user_offline(&self, hub: u64, uid: u64) {
        let mut online = self.online.lock().expect("hub registry");
        if let Some(hubs) = online.get_mut(&uid) {
            hubs.remove(&hub);
            if hubs.is_empty() {
                online.remove(&uid);
            }
        }
    }

    /// Drops every user seen only on this hub (hub closed).
    pub fn hub_closed(&self, hub: u64) {
        let mut online = self.online.lock().expect("hub registry");
        online.retain(|_, hubs| {
            hubs.remove(&hub);
            !hubs.is_empty()
        });
    }

    /// True when at least one open hub currently knows the user.
    pub fn is_online(&self, uid: u64) -> bool {
        self.online.lock().expect("hub registry").contains_key(&uid)
    }

    /// Asks the hub layer to open a peer session. Returns false when nobody
    /// is listening (shutdown).
    pub fn request_connect(&self, uid: u64) -> bool {
        self.connect_tx.send(ConnectRequest { uid }).is_ok()
    }
}
