//! Local-only adapter: the whole task collection as one document in a redb file.
//!
//! Every write reads the document, changes it and writes it back inside a
//! single write transaction, so a crash never leaves half a document.

use crate::backend::{sort_for_listing, BackendKind, TaskBackend};
use crate::error::BackendError;
use crate::model::{AppSettings, PriorityUpdate, Task, TaskPatch, UserSettings};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

const TASKS_KEY: &str = "tasks";
const USER_KEY: &str = "user_settings";
const APP_KEY: &str = "app_settings";

/// Thin handle to the redb file. Cloneable (Arc inside).
#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Database>,
}

impl LocalBackend {
    /// Open (or create) the document file at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let db = Database::create(path.as_ref())?;

        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(DOCUMENTS)?;
        }
        txn.commit()?;

        Ok(LocalBackend { db: Arc::new(db) })
    }

    fn read<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, BackendError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let value = match table.get(key)? {
            Some(bytes) => postcard::from_bytes(bytes.value()).map_err(|e| BackendError::Decode(e.to_string()))?,
            None => T::default(),
        };
        Ok(value)
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), BackendError> {
        let bytes = postcard::to_allocvec(value).map_err(|e| BackendError::Encode(e.to_string()))?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Read-modify-write of the task document in one write transaction.
    fn edit_tasks<T>(&self, f: impl FnOnce(&mut Vec<Task>) -> Result<T, BackendError>) -> Result<T, BackendError> {
        let started = Instant::now();
        let txn = self.db.begin_write()?;
        let out = {
            let mut table = txn.open_table(DOCUMENTS)?;
            let mut tasks: Vec<Task> = match table.get(TASKS_KEY)? {
                Some(bytes) => postcard::from_bytes(bytes.value()).map_err(|e| BackendError::Decode(e.to_string()))?,
                None => Vec::new(),
            };
            let out = f(&mut tasks)?;
            let bytes = postcard::to_allocvec(&tasks).map_err(|e| BackendError::Encode(e.to_string()))?;
            table.insert(TASKS_KEY, bytes.as_slice())?;
            out
        };
        txn.commit()?;
        tracing::debug!(elapsed_us = started.elapsed().as_micros() as u64, "local task document written");
        Ok(out)
    }
}

fn index(tasks: &[Task], id: Uuid) -> Option<usize> {
    tasks.iter().position(|t| t.id == id)
}

#[async_trait]
impl TaskBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn list_tasks(&self, user: Option<Uuid>) -> Result<Vec<Task>, BackendError> {
        let mut tasks: Vec<Task> = self.read(TASKS_KEY)?;
        if user.is_some() {
            tasks.retain(|t| t.user_id == user);
        }
        sort_for_listing(&mut tasks);
        Ok(tasks)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        let tasks: Vec<Task> = self.read(TASKS_KEY)?;
        Ok(tasks.into_iter().find(|t| t.id == id))
    }

    async fn create_task(&self, task: &Task) -> Result<Task, BackendError> {
        self.edit_tasks(|tasks| {
            match index(tasks, task.id) {
                Some(i) => tasks[i] = task.clone(),
                None => tasks.push(task.clone()),
            }
            Ok(task.clone())
        })
    }

    async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
        self.edit_tasks(|tasks| {
            let i = index(tasks, id).ok_or(BackendError::NotFound(id))?;
            patch.apply_to(&mut tasks[i]);
            Ok(tasks[i].clone())
        })
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), BackendError> {
        self.edit_tasks(|tasks| {
            tasks.retain(|t| t.id != id);
            for orphan in tasks.iter_mut().filter(|t| t.parent_id == Some(id)) {
                orphan.parent_id = None;
            }
            Ok(())
        })
    }

    async fn bulk_update_priorities(&self, items: &[PriorityUpdate]) -> Result<(), BackendError> {
        self.edit_tasks(|tasks| {
            for item in items {
                if let Some(i) = index(tasks, item.id) {
                    tasks[i].priority = item.priority;
                }
            }
            Ok(())
        })
    }

    async fn import_tasks(&self, incoming: &[Task]) -> Result<(), BackendError> {
        self.edit_tasks(|tasks| {
            for task in incoming {
                match index(tasks, task.id) {
                    Some(i) => tasks[i] = task.clone(),
                    None => tasks.push(task.clone()),
                }
            }
            Ok(())
        })
    }

    async fn clear_all_tasks(&self) -> Result<(), BackendError> {
        self.write(TASKS_KEY, &Vec::<Task>::new())
    }

    async fn user_settings(&self) -> Result<UserSettings, BackendError> {
        self.read(USER_KEY)
    }

    async fn set_user_settings(&self, settings: &UserSettings) -> Result<(), BackendError> {
        self.write(USER_KEY, settings)
    }

    async fn app_settings(&self) -> Result<AppSettings, BackendError> {
        self.read(APP_KEY)
    }

    async fn set_app_settings(&self, settings: &AppSettings) -> Result<(), BackendError> {
        self.write(APP_KEY, settings)
    }
}

// ── Tests ──────────────────────────────────────────────────────
