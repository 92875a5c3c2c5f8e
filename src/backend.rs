//! Durable store contract and the pure client-side fallback.

use crate::error::BackendError;
use crate::model::{AppSettings, PriorityUpdate, Task, TaskPatch, UserSettings};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Which adapter a session ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
    Memory,
}

/// Uniform CRUD contract implemented by every durable store.
///
/// `import_tasks` has upsert semantics. `list_tasks` returns rows in storage
/// order: `priority DESC NULLS LAST, created_at ASC`.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn list_tasks(&self, user: Option<Uuid>) -> Result<Vec<Task>, BackendError>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError>;
    async fn create_task(&self, task: &Task) -> Result<Task, BackendError>;
    async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError>;
    async fn delete_task(&self, id: Uuid) -> Result<(), BackendError>;
    async fn bulk_update_priorities(&self, items: &[PriorityUpdate]) -> Result<(), BackendError>;
    async fn import_tasks(&self, tasks: &[Task]) -> Result<(), BackendError>;
    async fn clear_all_tasks(&self) -> Result<(), BackendError>;

    async fn user_settings(&self) -> Result<UserSettings, BackendError>;
    async fn set_user_settings(&self, settings: &UserSettings) -> Result<(), BackendError>;
    async fn app_settings(&self) -> Result<AppSettings, BackendError>;
    async fn set_app_settings(&self, settings: &AppSettings) -> Result<(), BackendError>;
}

/// Storage order shared by every adapter (matches the relational query).
pub fn sort_for_listing(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| match (a.priority, b.priority) {
        (Some(x), Some(y)) => y.cmp(&x).then(a.created_at.cmp(&b.created_at)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.created_at.cmp(&b.created_at),
    });
}

/// Detach deleted ids from surviving rows, the way `ON DELETE SET NULL`
/// does in the relational schema.
pub(crate) fn detach_parent(tasks: &mut HashMap<Uuid, Task>, removed: Uuid) {
    for task in tasks.values_mut() {
        if task.parent_id == Some(removed) {
            task.parent_id = None;
        }
    }
}

#[derive(Default)]
struct MemoryDocument {
    tasks: HashMap<Uuid, Task>,
    user: UserSettings,
    app: AppSettings,
}

/// Pure in-process store. Used when nothing durable is reachable, and as
/// a deterministic stand-in wherever a backend is needed.
#[derive(Default)]
pub struct MemoryBackend {
    doc: Mutex<MemoryDocument>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let backend = Self::default();
        if let Ok(mut doc) = backend.doc.lock() {
            doc.tasks = tasks.into_iter().map(|t| (t.id, t)).collect();
        }
        backend
    }

    fn with_doc<T>(&self, f: impl FnOnce(&mut MemoryDocument) -> Result<T, BackendError>) -> Result<T, BackendError> {
        let mut doc = self.doc.lock().map_err(|_| BackendError::Poisoned)?;
        f(&mut doc)
    }
}

#[async_trait]
impl TaskBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn list_tasks(&self, user: Option<Uuid>) -> Result<Vec<Task>, BackendError> {
        self.with_doc(|doc| {
            let mut tasks: Vec<Task> = doc
                .tasks
                .values()
                .filter(|t| user.is_none() || t.user_id == user)
                .cloned()
                .collect();
            sort_for_listing(&mut tasks);
            Ok(tasks)
        })
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        self.with_doc(|doc| Ok(doc.tasks.get(&id).cloned()))
    }

    async fn create_task(&self, task: &Task) -> Result<Task, BackendError> {
        self.with_doc(|doc| {
            doc.tasks.insert(task.id, task.clone());
            Ok(task.clone())
        })
    }

    async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
        self.with_doc(|doc| {
            let task = doc.tasks.get_mut(&id).ok_or(BackendError::NotFound(id))?;
            patch.apply_to(task);
            Ok(task.clone())
        })
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), BackendError> {
        self.with_doc(|doc| {
            doc.tasks.remove(&id);
            detach_parent(&mut doc.tasks, id);
            Ok(())
        })
    }

    async fn bulk_update_priorities(&self, items: &[PriorityUpdate]) -> Result<(), BackendError> {
        self.with_doc(|doc| {
            for item in items {
                if let Some(task) = doc.tasks.get_mut(&item.id) {
                    task.priority = item.priority;
                }
            }
            Ok(())
        })
    }

    async fn import_tasks(&self, tasks: &[Task]) -> Result<(), BackendError> {
        self.with_doc(|doc| {
            for task in tasks {
                doc.tasks.insert(task.id, task.clone());
            }
            Ok(())
        })
    }

    async fn clear_all_tasks(&self) -> Result<(), BackendError> {
        self.with_doc(|doc| {
            doc.tasks.clear();
            Ok(())
        })
    }

    async fn user_settings(&self) -> Result<UserSettings, BackendError> {
        self.with_doc(|doc| Ok(doc.user.clone()))
    }

    async fn set_user_settings(&self, settings: &UserSettings) -> Result<(), BackendError> {
        self.with_doc(|doc| {
            doc.user = settings.clone();
            Ok(())
        })
    }

    async fn app_settings(&self) -> Result<AppSettings, BackendError> {
        self.with_doc(|doc| Ok(doc.app.clone()))
    }

    async fn set_app_settings(&self, settings: &AppSettings) -> Result<(), BackendError> {
        self.with_doc(|doc| {
            doc.app = settings.clone();
            Ok(())
        })
    }
}
