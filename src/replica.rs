//! Replicated task map.
//!
//! Each task is a set of named fields, each field a last-writer-wins
//! register stamped with a Lamport clock and the writing site's id. Removal
//! is a tombstone stamp; an entry is visible while some field was written
//! after its latest tombstone. Merging is commutative, associative and
//! idempotent, so every replica that has seen the same updates shows the
//! same map whatever the arrival order.
//!
//! `SharedMap` + `Hub` are the in-process transport: every map joined to a
//! hub sees every other map's updates.

use crate::error::ReplicaError;
use crate::model::Task;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lamport clock first, site id breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub site: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    Set { id: Uuid, stamp: Stamp, fields: BTreeMap<String, Value> },
    Remove { id: Uuid, stamp: Stamp },
}

impl Update {
    pub fn id(&self) -> Uuid {
        match self {
            Update::Set { id, .. } | Update::Remove { id, .. } => *id,
        }
    }

    pub fn stamp(&self) -> Stamp {
        match self {
            Update::Set { stamp, .. } | Update::Remove { stamp, .. } => *stamp,
        }
    }
}

#[derive(Debug, Clone)]
struct Register {
    stamp: Stamp,
    value: Value,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    fields: BTreeMap<String, Register>,
    tombstone: Option<Stamp>,
}

impl Entry {
    fn is_live(&self) -> bool {
        let newest = self.fields.values().map(|r| r.stamp).max();
        match (newest, self.tombstone) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(written), Some(removed)) => written > removed,
        }
    }
}

/// One site's copy of the map. Pure state, no I/O.
#[derive(Debug, Clone)]
pub struct Replica {
    site: Uuid,
    clock: u64,
    entries: HashMap<Uuid, Entry>,
}

impl Replica {
    pub fn new(site: Uuid) -> Self {
        Replica { site, clock: 0, entries: HashMap::new() }
    }

    fn tick(&mut self) -> Stamp {
        self.clock += 1;
        Stamp { clock: self.clock, site: self.site }
    }

    /// Local write of some fields of `id`. Returns the update to ship.
    pub fn set(&mut self, id: Uuid, fields: Map<String, Value>) -> Update {
        let update = Update::Set { id, stamp: self.tick(), fields: fields.into_iter().collect() };
        self.apply(&update);
        update
    }

    pub fn remove(&mut self, id: Uuid) -> Update {
        let update = Update::Remove { id, stamp: self.tick() };
        self.apply(&update);
        update
    }

    /// Merge an update from any site. Returns true if the map changed.
    pub fn apply(&mut self, update: &Update) -> bool {
        self.clock = self.clock.max(update.stamp().clock);
        let entry = self.entries.entry(update.id()).or_default();

        match update {
            Update::Set { stamp, fields, .. } => {
                let mut changed = false;
                for (name, value) in fields {
                    let newer = entry.fields.get(name).map_or(true, |r| *stamp > r.stamp);
                    if newer {
                        entry.fields.insert(name.clone(), Register { stamp: *stamp, value: value.clone() });
                        changed = true;
                    }
                }
                changed
            }
            Update::Remove { stamp, .. } => {
                if entry.tombstone.map_or(true, |t| *stamp > t) {
                    entry.tombstone = Some(*stamp);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.get(id).is_some_and(Entry::is_live)
    }

    /// Ids of every visible entry, sorted.
    pub fn ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_live())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn fields(&self, id: &Uuid) -> Option<Map<String, Value>> {
        let entry = self.entries.get(id).filter(|e| e.is_live())?;
        Some(entry.fields.iter().map(|(k, r)| (k.clone(), r.value.clone())).collect())
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Task>, ReplicaError> {
        match self.fields(id) {
            Some(fields) => decode(*id, fields).map(Some),
            None => Ok(None),
        }
    }
}

/// The field map a task is replicated as (its camelCase JSON object).
pub fn task_fields(task: &Task) -> Result<Map<String, Value>, ReplicaError> {
    match serde_json::to_value(task) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ReplicaError::Encode(format!("expected an object, got {other}"))),
        Err(e) => Err(ReplicaError::Encode(e.to_string())),
    }
}

fn decode(id: Uuid, fields: Map<String, Value>) -> Result<Task, ReplicaError> {
    serde_json::from_value(Value::Object(fields)).map_err(|e| ReplicaError::Decode { id, reason: e.to_string() })
}

// ── Map primitive ─────────────────────────────────────────────

/// Emitted when another site changed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteChange {
    pub id: Uuid,
}

/// The replicated map as the bridge sees it.
pub trait ReplicatedMap: Send + Sync {
    fn set_fields(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), ReplicaError>;
    fn remove(&self, id: Uuid) -> Result<(), ReplicaError>;
    fn ids(&self) -> Result<Vec<Uuid>, ReplicaError>;
    fn get(&self, id: Uuid) -> Result<Option<Task>, ReplicaError>;
    /// Changes made by other sites, from now on.
    fn observe(&self) -> broadcast::Receiver<RemoteChange>;
}

/// In-process fan-out of updates between `SharedMap`s.
#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<Update>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Hub { tx }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Hub::new(1024)
    }
}

/// A `Replica` joined to a `Hub`. Needs a tokio runtime.
pub struct SharedMap {
    replica: Arc<Mutex<Replica>>,
    hub: broadcast::Sender<Update>,
    changes: broadcast::Sender<RemoteChange>,
    pump: JoinHandle<()>,
}

impl SharedMap {
    pub fn join(hub: &Hub) -> Arc<Self> {
        let site = Uuid::new_v4();
        let replica = Arc::new(Mutex::new(Replica::new(site)));
        let (changes, _) = broadcast::channel(1024);

        let mut incoming = hub.tx.subscribe();
        let pump = tokio::spawn({
            let replica = replica.clone();
            let changes = changes.clone();
            async move {
                loop {
                    let update = match incoming.recv().await {
                        Ok(update) => update,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(%site, missed, "replica fell behind the hub");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if update.stamp().site == site {
                        continue;
                    }
                    let changed = match replica.lock() {
                        Ok(mut r) => r.apply(&update),
                        Err(_) => break,
                    };
                    if changed {
                        let _ = changes.send(RemoteChange { id: update.id() });
                    }
                }
            }
        });

        Arc::new(SharedMap { replica, hub: hub.tx.clone(), changes, pump })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Replica>, ReplicaError> {
        self.replica.lock().map_err(|_| ReplicaError::Poisoned)
    }

    fn ship(&self, update: Update) {
        // No receivers just means no peers yet.
        let _ = self.hub.send(update);
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl ReplicatedMap for SharedMap {
    fn set_fields(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), ReplicaError> {
        let update = self.lock()?.set(id, fields);
        self.ship(update);
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<(), ReplicaError> {
        let update = self.lock()?.remove(id);
        self.ship(update);
        Ok(())
    }

    fn ids(&self) -> Result<Vec<Uuid>, ReplicaError> {
        Ok(self.lock()?.ids())
    }

    fn get(&self, id: Uuid) -> Result<Option<Task>, ReplicaError> {
        self.lock()?.get(&id)
    }

    fn observe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }
}

// ── Tests ──────────────────────────────────────────────────────
