//! Mirrors confirmed mutations into the replicated map and folds remote
//! changes back into the working cache.

use crate::error::ReplicaError;
use crate::hierarchy::Change;
use crate::model::Task;
use crate::replica::{task_fields, ReplicatedMap};
use crate::store::TaskStore;
use serde_json::Map;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct ReplicationBridge {
    map: Arc<dyn ReplicatedMap>,
}

impl ReplicationBridge {
    pub fn new(map: Arc<dyn ReplicatedMap>) -> Self {
        ReplicationBridge { map }
    }

    /// Write backend-confirmed changes. Updates only carry the fields that
    /// changed; a record the map does not hold yet is written whole.
    pub fn publish(&self, changes: &[Change]) -> Result<(), ReplicaError> {
        for change in changes {
            match change {
                Change::Upsert { before: Some(before), after } if self.holds(after.id) => {
                    let fields = changed_fields(before, after)?;
                    if !fields.is_empty() {
                        self.map.set_fields(after.id, fields)?;
                    }
                }
                Change::Upsert { after, .. } => self.map.set_fields(after.id, task_fields(after)?)?,
                Change::Delete { before } => self.map.remove(before.id)?,
            }
        }
        Ok(())
    }

    // An entry that no longer decodes is rewritten whole.
    fn holds(&self, id: Uuid) -> bool {
        matches!(self.map.get(id), Ok(Some(_)))
    }

    /// Make the map match what the durable backend returned at load time.
    pub fn reconcile(&self, loaded: &[Task]) -> Result<(), ReplicaError> {
        let keep: HashSet<Uuid> = loaded.iter().map(|t| t.id).collect();
        let mut dropped = 0usize;
        for id in self.map.ids()? {
            if !keep.contains(&id) {
                self.map.remove(id)?;
                dropped += 1;
            }
        }
        for task in loaded {
            self.map.set_fields(task.id, task_fields(task)?)?;
        }
        tracing::info!(written = loaded.len(), dropped, "replicated map reconciled with backend");
        Ok(())
    }

    /// Forward remote changes into `store` until the map or the store goes away.
    pub fn observe(&self, store: Weak<TaskStore>) -> JoinHandle<()> {
        let mut changes = self.map.observe();
        let map = self.map.clone();
        tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "remote changes dropped, cache may be stale until reload");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(store) = store.upgrade() else {
                    break;
                };
                match map.get(change.id) {
                    Ok(incoming) => {
                        store.apply_remote(change.id, incoming);
                    }
                    Err(e) => tracing::warn!(id = %change.id, error = %e, "ignoring undecodable remote change"),
                }
            }
        })
    }
}

fn changed_fields(before: &Task, after: &Task) -> Result<Map<String, serde_json::Value>, ReplicaError> {
    let old = task_fields(before)?;
    Ok(task_fields(after)?
        .into_iter()
        .filter(|(name, value)| old.get(name) != Some(value))
        .collect())
}
