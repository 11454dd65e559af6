use super::{Store, StoreError, StoreOp};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct Backend {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Open connections by id, with their optional name
    connections: BTreeMap<i64, Option<String>>,
    next_id: i64,
}

impl Backend {
    fn open_connection(&mut self) -> i64 {
        self.next_id += 1;
        self.connections.insert(self.next_id, None);
        self.next_id
    }

    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                self.strings.insert(key, value);
            }
            StoreOp::Del { key } => {
                self.strings.remove(&key);
                self.hashes.remove(&key);
                self.sets.remove(&key);
                self.lists.remove(&key);
            }
            StoreOp::HSet { key, fields } => {
                self.hashes.entry(key).or_default().extend(fields);
            }
            StoreOp::HDel { key, field } => {
                if let Some(hash) = self.hashes.get_mut(&key) {
                    hash.remove(&field);
                    if hash.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            StoreOp::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            StoreOp::SRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.sets.remove(&key);
                    }
                }
            }
            StoreOp::RPush { key, value } => {
                self.lists.entry(key).or_default().push_back(value);
            }
            StoreOp::LRem { key, value } => {
                if let Some(list) = self.lists.get_mut(&key) {
                    list.retain(|entry| *entry != value);
                    if list.is_empty() {
                        self.lists.remove(&key);
                    }
                }
            }
        }
    }
}

/// Resolves an inclusive, possibly negative, Redis range against a list of
/// `len` entries.
fn list_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// In-process store.
///
/// One backend can be shared by several connections, each with its own
/// client id and name, the way several ingests share one Redis server.
/// Dropping a connection removes it from the client listing.
pub struct MemoryStore {
    backend: Arc<Mutex<Backend>>,
    id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let backend = Arc::new(Mutex::new(Backend::default()));
        let id = lock(&backend).open_connection();
        Self { backend, id }
    }

    /// Opens another connection to the same data.
    pub fn connect(&self) -> Self {
        let id = lock(&self.backend).open_connection();
        Self {
            backend: Arc::clone(&self.backend),
            id,
        }
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        lock(&self.backend)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.backend().connections.remove(&self.id);
    }
}

fn lock(backend: &Mutex<Backend>) -> MutexGuard<'_, Backend> {
    // A panic while holding the lock cannot leave a half-applied batch
    // behind, so the data is still usable
    backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.backend().strings.get(key).cloned())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .backend()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.backend().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut backend = self.backend();
        let hash = backend.hashes.entry(key.to_string()).or_default();

        let current = match hash.get(field) {
            Some(value) => value.parse::<i64>().map_err(|_| StoreError::NotInteger {
                key: key.to_string(),
                field: field.to_string(),
            })?,
            None => 0,
        };

        let updated = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::Overflow {
                key: key.to_string(),
                field: field.to_string(),
            })?;
        hash.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .backend()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .backend()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .backend()
            .sets
            .get(key)
            .map_or(false, |set| set.contains(member)))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let backend = self.backend();
        let Some(list) = backend.lists.get(key) else {
            return Ok(Vec::new());
        };

        Ok(match list_bounds(list.len(), start, stop) {
            Some((first, last)) => list.range(first..=last).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut backend = self.backend();
        let Some(list) = backend.lists.get_mut(key) else {
            return Ok(None);
        };

        let value = list.pop_front();
        if list.is_empty() {
            backend.lists.remove(key);
        }
        Ok(value)
    }

    async fn exec(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut backend = self.backend();
        for op in ops {
            backend.apply(op);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        let mut backend = self.backend();
        if let Some(subscribers) = backend.subscribers.get_mut(channel) {
            subscribers.retain(|subscriber| subscriber.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.backend()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn set_client_name(&self, name: &str) -> Result<(), StoreError> {
        let id = self.id;
        self.backend()
            .connections
            .insert(id, Some(name.to_string()));
        Ok(())
    }

    async fn client_id(&self) -> Result<i64, StoreError> {
        Ok(self.id)
    }

    async fn client_list(&self) -> Result<String, StoreError> {
        let backend = self.backend();
        let lines: Vec<String> = backend
            .connections
            .iter()
            .map(|(id, name)| {
                format!(
                    "id={} addr=memory:{} name={} cmd=client",
                    id,
                    id,
                    name.as_deref().unwrap_or("")
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }
}
