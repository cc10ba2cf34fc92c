use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::messaging::message::now_nanos;
use crate::utils::error::StoreError;

const STREAM_TREE: &str = "presence";
const GROUPS_TREE: &str = "presence_groups";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Connected,
    Disconnected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub kind: PresenceKind,
    pub client_id: String,
    pub thing_id: String,
    pub instance_id: String,
    pub timestamp: i64,
}

impl PresenceEvent {
    pub fn new(
        kind: PresenceKind,
        client_id: impl Into<String>,
        thing_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            thing_id: thing_id.into(),
            instance_id: instance_id.into(),
            timestamp: now_nanos(),
        }
    }
}

#[derive(Clone)]
pub struct EventStore {
    db: Db,
    stream: Tree,
    groups: Tree,
    max_len: usize,
}

impl EventStore {
    pub fn open(path: &str, max_len: usize) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?, max_len)
    }

    fn from_db(db: Db, max_len: usize) -> Result<Self, StoreError> {
        let stream = db.open_tree(STREAM_TREE)?;
        let groups = db.open_tree(GROUPS_TREE)?;
        Ok(Self {
            db,
            stream,
            groups,
            max_len: max_len.max(1),
        })
    }

    /// Append `event` and trim the stream to its bounded length. Returns the
    /// sequence number assigned to the event.
    pub fn append(&self, event: &PresenceEvent) -> Result<u64, StoreError> {
        let seq = self.db.generate_id()?;
        let serialized = serde_json::to_vec(event)?;
        self.stream.insert(seq.to_be_bytes(), serialized)?;

        while self.stream.len() > self.max_len {
            if self.stream.pop_min()?.is_none() {
                break;
            }
        }
        debug!(seq, kind = ?event.kind, client = %event.client_id, "presence event appended");
        Ok(seq)
    }

    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Up to `count` events after the last sequence `group` acknowledged.
    pub fn read_group(
        &self,
        group: &str,
        count: usize,
    ) -> Result<Vec<(u64, PresenceEvent)>, StoreError> {
        let range = match self.acked(group)? {
            Some(seq) => self.stream.range((seq + 1).to_be_bytes()..),
            None => self.stream.range::<[u8; 8], _>(..),
        };

        let mut events = Vec::with_capacity(count);
        for entry in range.take(count) {
            let (key, value) = entry?;
            let seq = decode_seq(&key)?;
            let event = serde_json::from_slice(&value)?;
            events.push((seq, event));
        }
        Ok(events)
    }

    /// Mark everything up to `seq` as processed by `group`.
    pub fn ack(&self, group: &str, seq: u64) -> Result<(), StoreError> {
        if self.acked(group)?.is_some_and(|current| current >= seq) {
            return Ok(());
        }
        self.groups.insert(group.as_bytes(), seq.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn acked(&self, group: &str) -> Result<Option<u64>, StoreError> {
        self.groups
            .get(group.as_bytes())?
            .map(|raw| decode_seq(&raw))
            .transpose()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_seq(raw: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::Corrupted(String::from_utf8_lossy(raw).into_owned()))?;
    Ok(u64::from_be_bytes(bytes))
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("db", &"sled::Db")
            .field("max_len", &self.max_len)
            .finish()
    }
}
