use crate::{BackendKind, BrokerError, Queue, QueueFactory, RawDelivery};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    inflight: BTreeMap<u64, Vec<u8>>,
    next_tag: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredQueue {
    messages: Vec<String>,
}

/// In-process queue of the peer backend. A queue with a store file writes
/// every change through to it, so a crash loses nothing already accepted.
#[derive(Default)]
pub struct PeerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    file: Option<PathBuf>,
    writing: Mutex<()>,
}

impl PeerQueue {
    fn stored(file: Option<PathBuf>, messages: Vec<Vec<u8>>) -> Self {
        let queue = Self {
            file,
            ..Self::default()
        };
        queue.state.lock().ready.extend(messages);
        queue
    }

    fn persist(&self) -> Result<(), BrokerError> {
        let Some(file) = self.file.as_deref() else {
            return Ok(());
        };
        let _writing = self.writing.lock();
        write_queue(file, &self.snapshot())
    }

    fn take(&self, auto_ack: bool) -> Option<RawDelivery> {
        let mut guard = self.state.lock();
        let payload = guard.ready.pop_front()?;
        if auto_ack {
            return Some(RawDelivery { payload, tag: None });
        }
        guard.next_tag += 1;
        let tag = guard.next_tag;
        guard.inflight.insert(tag, payload.clone());
        Some(RawDelivery {
            payload,
            tag: Some(tag),
        })
    }

    /// Unacknowledged messages first, so a restart redelivers them before new work.
    fn snapshot(&self) -> Vec<Vec<u8>> {
        let guard = self.state.lock();
        guard
            .inflight
            .values()
            .chain(guard.ready.iter())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Queue for PeerQueue {
    async fn send(&self, message: &[u8]) -> Result<(), BrokerError> {
        self.state.lock().ready.push_back(message.to_vec());
        self.notify.notify_one();
        self.persist()
    }

    async fn receive(
        &self,
        timeout: Duration,
        auto_ack: bool,
    ) -> Result<Option<RawDelivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let delivery = loop {
            if let Some(delivery) = self.take(auto_ack) {
                break Some(delivery);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                break self.take(auto_ack);
            }
        };
        // Only an auto-acknowledged take changes what a restart would see.
        if auto_ack && delivery.is_some() {
            if let Err(err) = self.persist() {
                warn!("Peer broker could not persist a receive: {}", err);
            }
        }
        Ok(delivery)
    }

    async fn acknowledge(&self, tag: u64) -> Result<(), BrokerError> {
        self.state
            .lock()
            .inflight
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        self.persist()
    }

    async fn reject(&self, tag: u64) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        let payload = guard
            .inflight
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        guard.ready.push_front(payload);
        drop(guard);
        self.notify.notify_one();
        self.persist()
    }

    async fn recover(&self) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        let inflight = std::mem::take(&mut guard.inflight);
        let recovered = inflight.len();
        for (_, payload) in inflight.into_iter().rev() {
            guard.ready.push_front(payload);
        }
        drop(guard);
        for _ in 0..recovered {
            self.notify.notify_one();
        }
        self.persist()
    }

    async fn available(&self) -> Result<u64, BrokerError> {
        Ok(self.state.lock().ready.len() as u64)
    }

    async fn clear(&self) -> Result<(), BrokerError> {
        self.state.lock().ready.clear();
        self.persist()
    }
}

/// The always-available local backend. With a store directory, queue contents
/// survive a restart, clean or not.
pub struct PeerFactory {
    instance: Uuid,
    store: Option<PathBuf>,
    queues: Mutex<HashMap<String, Arc<PeerQueue>>>,
}

impl PeerFactory {
    pub fn in_memory() -> Self {
        Self {
            instance: Uuid::new_v4(),
            store: None,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Never fails: an unusable store directory degrades to a memory-only peer.
    pub fn open(store: impl Into<PathBuf>) -> Self {
        let store = store.into();
        match fs::create_dir_all(&store) {
            Ok(_) => {
                info!("Peer broker storing queues in {}", store.display());
                Self {
                    store: Some(store),
                    ..Self::in_memory()
                }
            }
            Err(err) => {
                warn!(
                    "Peer broker cannot use {} ({}); keeping queues in memory only",
                    store.display(),
                    err
                );
                Self::in_memory()
            }
        }
    }

    fn peer_queue(&self, name: &str) -> Arc<PeerQueue> {
        let mut guard = self.queues.lock();
        if let Some(queue) = guard.get(name) {
            return Arc::clone(queue);
        }
        let file = self.store.as_deref().map(|store| queue_file(store, name));
        let messages = file.as_deref().map(load_queue).unwrap_or_default();
        let queue = Arc::new(PeerQueue::stored(file, messages));
        guard.insert(name.to_string(), Arc::clone(&queue));
        queue
    }

    /// Write every known queue to the store directory.
    pub fn flush(&self) -> Result<(), BrokerError> {
        let queues: Vec<Arc<PeerQueue>> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.persist()?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueFactory for PeerFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Peer
    }

    fn instance_id(&self) -> Uuid {
        self.instance
    }

    fn host(&self) -> String {
        "localhost".into()
    }

    fn port(&self) -> u16 {
        0
    }

    fn connection_url(&self) -> String {
        match &self.store {
            Some(store) => format!("file://{}", store.display()),
            None => "peer://memory".into(),
        }
    }

    async fn queue(&self, name: &str) -> Result<Arc<dyn Queue>, BrokerError> {
        Ok(self.peer_queue(name))
    }

    async fn close(&self) {
        if let Err(err) = self.flush() {
            warn!("Peer broker could not persist its queues: {}", err);
        }
    }
}

/// Alphanumerics and `_` are kept, every other byte becomes `-xx` in hex, so
/// distinct queue names never share a file.
fn queue_file(store: &Path, name: &str) -> PathBuf {
    let mut file = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            file.push(char::from(byte));
        } else {
            file.push_str(&format!("-{byte:02x}"));
        }
    }
    store.join(format!("{file}.json"))
}

fn load_queue(path: &Path) -> Vec<Vec<u8>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return Vec::new(),
    };
    let stored: StoredQueue = match serde_json::from_str(&data) {
        Ok(stored) => stored,
        Err(err) => {
            warn!("Ignoring unreadable peer queue {}: {}", path.display(), err);
            return Vec::new();
        }
    };
    stored
        .messages
        .iter()
        .filter_map(|message| BASE64_STANDARD.decode(message).ok())
        .collect()
}

fn write_queue(path: &Path, messages: &[Vec<u8>]) -> Result<(), BrokerError> {
    let temp = path.with_extension("json.tmp");
    let stored = StoredQueue {
        messages: messages
            .iter()
            .map(|message| BASE64_STANDARD.encode(message))
            .collect(),
    };
    let body = serde_json::to_vec(&stored).map_err(|err| BrokerError::Internal(err.to_string()))?;
    fs::write(&temp, body)?;
    fs::rename(&temp, path)?;
    Ok(())
}
