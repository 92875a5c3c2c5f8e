//! The working cache.
//!
//! Every operation runs the hierarchy rules against a `Draft` of the current
//! snapshot, swaps the snapshot in one assignment, tells subscribers, and
//! queues the changed records for the persistence worker. The caller never
//! waits for the backend or the replicated map.
//!
//! The worker persists jobs strictly in submission order. Confirmed records
//! go to the replication bridge; failed ones are logged and, for operations
//! whose policy is `Revert`, undone in the cache and compensated in the
//! backend.

use crate::backend::TaskBackend;
use crate::bridge::ReplicationBridge;
use crate::error::{BackendError, EngineError};
use crate::hierarchy::{self, Change, ChangeSet, Draft, Origin, Snapshot};
use crate::model::{Category, Difficulty, PriorityUpdate, Task, TaskPatch, TriageStatus};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

// ── Operations & rollback policy ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Reparent,
    SetStatus,
    BulkPriority,
    Duplicate,
    ToggleTimer,
    SetField,
    Assign,
    Import,
    ClearAll,
}

/// What happens to the optimistic cache state when the backend refuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// Keep the cache as is; it may drift until the next reload.
    Keep,
    /// Undo the cache change and compensate records already persisted.
    Revert,
}

impl Operation {
    pub fn rollback(self) -> Rollback {
        match self {
            Operation::Create | Operation::Duplicate | Operation::Assign | Operation::Import => Rollback::Revert,
            _ => Rollback::Keep,
        }
    }
}

// ── Change notifications ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
    Revert,
}

/// Published after every cache change. Subscribers re-read the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TasksChanged {
    pub ids: Vec<Uuid>,
    pub source: ChangeSource,
}

struct Cache {
    snapshot: RwLock<Arc<Snapshot>>,
    bus: broadcast::Sender<TasksChanged>,
}

impl Cache {
    fn read(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn notify(&self, ids: Vec<Uuid>, source: ChangeSource) {
        if ids.is_empty() {
            return;
        }
        // Nobody listening is fine.
        let _ = self.bus.send(TasksChanged { ids, source });
    }

    /// Undo `changes` where the cache still holds exactly what they wrote.
    /// Runs on a draft of the live snapshot so links and derived statuses
    /// are re-established around records edited since. Returns every record
    /// the revert touched.
    fn revert(&self, changes: &[Change]) -> ChangeSet {
        let reverted = {
            let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            let base: &Snapshot = &guard;
            let now = Utc::now();
            let mut draft = Draft::new(base);
            let mut parents = Vec::new();
            for change in changes.iter().rev() {
                match change {
                    Change::Upsert { before, after } => {
                        if draft.get(&after.id) != Some(after) {
                            continue;
                        }
                        match before {
                            Some(before) => {
                                parents.extend(before.parent_id);
                                parents.extend(after.parent_id);
                                draft.insert(before.clone());
                            }
                            None => {
                                // Also unlinks it from its current parent.
                                if let Err(e) = hierarchy::remove_subtree(&mut draft, after.id, now) {
                                    tracing::warn!(id = %after.id, error = %e, "reverting create failed");
                                }
                            }
                        }
                    }
                    Change::Delete { before } => {
                        if !draft.contains(&before.id) {
                            parents.extend(before.parent_id);
                            draft.insert(before.clone());
                        }
                    }
                }
            }
            hierarchy::repair(&mut draft, now);
            for parent in parents {
                if let Err(e) = hierarchy::settle(&mut draft, parent, now) {
                    tracing::warn!(%parent, error = %e, "settling after revert failed");
                }
            }
            hierarchy::enforce_blocked_precedence(&mut draft);
            let (next, reverted) = draft.finish();
            if !reverted.is_empty() {
                *guard = Arc::new(next);
            }
            reverted
        };
        if !reverted.is_empty() {
            tracing::warn!(count = reverted.len(), "reverted unpersisted changes in the working cache");
        }
        self.notify(reverted.iter().map(Change::id).collect(), ChangeSource::Revert);
        reverted
    }
}

// ── Persistence worker ────────────────────────────────────────

enum Job {
    Persist { op: Operation, changes: ChangeSet },
    Flush(oneshot::Sender<()>),
}

struct Worker {
    backend: Arc<dyn TaskBackend>,
    bridge: Option<Arc<ReplicationBridge>>,
    cache: Arc<Cache>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Persist { op, changes } => self.persist(op, changes).await,
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("persistence worker stopped");
    }

    async fn persist(&self, op: Operation, changes: ChangeSet) {
        let policy = op.rollback();
        let (confirmed, failed) = match op {
            Operation::Import => self.import(changes).await,
            Operation::ClearAll => self.clear(changes).await,
            _ => self.write_each(op, changes, policy).await,
        };

        if failed.is_empty() {
            tracing::debug!(?op, records = confirmed.len(), "persisted");
            self.replicate(&confirmed);
            return;
        }

        match policy {
            Rollback::Keep => self.replicate(&confirmed),
            Rollback::Revert => {
                self.compensate(&confirmed).await;
                let mut undo = confirmed;
                undo.extend(failed);
                let reverted = self.cache.revert(&undo);
                self.follow_up(&undo, reverted).await;
            }
        }
    }

    /// Persist what a revert changed beyond undoing the job itself: links
    /// and statuses on records that the backend already holds.
    async fn follow_up(&self, undone: &[Change], reverted: ChangeSet) {
        let skip: HashSet<Uuid> = undone.iter().map(Change::id).collect();
        let mut confirmed = ChangeSet::new();
        for change in reverted.into_iter().filter(|c| !skip.contains(&c.id())) {
            match self.write(&change).await {
                Ok(()) => confirmed.push(change),
                Err(e) => tracing::warn!(id = %change.id(), error = %e, "persisting revert follow-up failed"),
            }
        }
        self.replicate(&confirmed);
    }

    /// One backend call per record; priority-only moves go out as one bulk call.
    async fn write_each(&self, op: Operation, changes: ChangeSet, policy: Rollback) -> (ChangeSet, ChangeSet) {
        let mut confirmed = ChangeSet::new();
        let mut failed = ChangeSet::new();
        let mut moves = ChangeSet::new();

        let mut pending = changes.into_iter();
        while let Some(change) = pending.next() {
            if let Change::Upsert { before: Some(before), after } = &change {
                if TaskPatch::between(before, after).is_priority_only() {
                    moves.push(change);
                    continue;
                }
            }
            match self.write(&change).await {
                Ok(()) => confirmed.push(change),
                Err(e) => {
                    tracing::warn!(?op, id = %change.id(), error = %e, "persisting task failed");
                    failed.push(change);
                    if policy == Rollback::Revert {
                        failed.extend(pending.by_ref());
                        failed.append(&mut moves);
                        break;
                    }
                }
            }
        }

        if !moves.is_empty() {
            let items: Vec<PriorityUpdate> = moves
                .iter()
                .filter_map(|c| match c {
                    Change::Upsert { after, .. } => Some(PriorityUpdate { id: after.id, priority: after.priority }),
                    Change::Delete { .. } => None,
                })
                .collect();
            match self.backend.bulk_update_priorities(&items).await {
                Ok(()) => confirmed.append(&mut moves),
                Err(e) => {
                    tracing::warn!(?op, count = items.len(), error = %e, "persisting priorities failed");
                    failed.append(&mut moves);
                }
            }
        }
        (confirmed, failed)
    }

    async fn write(&self, change: &Change) -> Result<(), BackendError> {
        match change {
            Change::Upsert { before: None, after } => self.backend.create_task(after).await.map(drop),
            Change::Upsert { before: Some(before), after } => {
                let patch = TaskPatch::between(before, after);
                match self.backend.update_task(after.id, &patch).await {
                    Ok(_) => Ok(()),
                    Err(BackendError::NotFound(id)) => {
                        tracing::debug!(%id, "row missing in backend, writing it whole");
                        self.backend.create_task(after).await.map(drop)
                    }
                    Err(e) => Err(e),
                }
            }
            Change::Delete { before } => self.backend.delete_task(before.id).await,
        }
    }

    async fn import(&self, changes: ChangeSet) -> (ChangeSet, ChangeSet) {
        let tasks: Vec<Task> = changes
            .iter()
            .filter_map(|c| match c {
                Change::Upsert { after, .. } => Some(after.clone()),
                Change::Delete { .. } => None,
            })
            .collect();
        match self.backend.import_tasks(&tasks).await {
            Ok(()) => (changes, ChangeSet::new()),
            Err(e) => {
                tracing::warn!(records = changes.len(), error = %e, "importing tasks failed");
                (ChangeSet::new(), changes)
            }
        }
    }

    async fn clear(&self, changes: ChangeSet) -> (ChangeSet, ChangeSet) {
        match self.backend.clear_all_tasks().await {
            Ok(()) => (changes, ChangeSet::new()),
            Err(e) => {
                tracing::warn!(records = changes.len(), error = %e, "clearing backend failed");
                (ChangeSet::new(), changes)
            }
        }
    }

    /// Undo records the backend already accepted, newest first.
    async fn compensate(&self, confirmed: &[Change]) {
        for change in confirmed.iter().rev() {
            let result = match change {
                Change::Upsert { before: None, after } => self.backend.delete_task(after.id).await,
                Change::Upsert { before: Some(before), after } => self
                    .backend
                    .update_task(after.id, &TaskPatch::between(after, before))
                    .await
                    .map(drop),
                Change::Delete { before } => self.backend.create_task(before).await.map(drop),
            };
            if let Err(e) = result {
                tracing::error!(id = %change.id(), error = %e, "compensating write failed, backend keeps the change");
            }
        }
    }

    fn replicate(&self, confirmed: &[Change]) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        if let Err(e) = bridge.publish(confirmed) {
            tracing::warn!(records = confirmed.len(), error = %e, "replicating changes failed");
        }
    }
}

// ── Store ─────────────────────────────────────────────────────

/// Owner of the working cache. Create one per session (see `session`);
/// needs a tokio runtime for its persistence worker.
pub struct TaskStore {
    cache: Arc<Cache>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl TaskStore {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        tasks: Vec<Task>,
        bridge: Option<Arc<ReplicationBridge>>,
    ) -> Arc<Self> {
        let snapshot: Snapshot = tasks.into_iter().map(|t| (t.id, t)).collect();
        let (bus, _) = broadcast::channel(256);
        let cache = Arc::new(Cache { snapshot: RwLock::new(Arc::new(snapshot)), bus });

        let (jobs, rx) = mpsc::unbounded_channel();
        let worker = Worker { backend, bridge, cache: cache.clone() };
        tokio::spawn(worker.run(rx));

        Arc::new(TaskStore { cache, jobs })
    }

    // ── Reads ──────────────────────────────────────────────────

    /// The current snapshot. Cheap; never torn.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TasksChanged> {
        self.cache.bus.subscribe()
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.cache.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every task in view order: lowest priority first, unprioritized
    /// last, then oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.cache.read().values().cloned().collect();
        sort_for_view(&mut tasks);
        tasks
    }

    pub fn roots(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .cache
            .read()
            .values()
            .filter(|t| t.parent_id.is_none())
            .cloned()
            .collect();
        sort_for_view(&mut tasks);
        tasks
    }

    /// Children in their stored order.
    pub fn children_of(&self, id: Uuid) -> Vec<Task> {
        let snapshot = self.cache.read();
        snapshot
            .get(&id)
            .map(|t| t.children.iter().filter_map(|c| snapshot.get(c).cloned()).collect())
            .unwrap_or_default()
    }

    /// Difficulty points summed over the subtree rooted at `id`.
    pub fn effort(&self, id: Uuid) -> Option<f64> {
        let snapshot = self.cache.read();
        let root = snapshot.get(&id)?;
        let draft = Draft::new(&snapshot);
        let below: f64 = hierarchy::descendants(&draft, id)
            .iter()
            .filter_map(|d| snapshot.get(d))
            .map(|t| t.difficulty.points())
            .sum();
        Some(root.difficulty.points() + below)
    }

    /// Whole minutes of closed timer intervals on `id`.
    pub fn tracked_minutes(&self, id: Uuid) -> Option<i64> {
        self.cache.read().get(&id).map(|t| t.tracked_ms() / 60_000)
    }

    /// Resolves once every change issued before this call reached the backend.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    // ── Mutation core ──────────────────────────────────────────

    fn mutate<T>(
        &self,
        op: Operation,
        f: impl FnOnce(&mut Draft, DateTime<Utc>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let (out, changes) = {
            let mut guard = self.cache.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            let base: &Snapshot = &guard;
            let mut draft = Draft::new(base);
            let out = f(&mut draft, Utc::now())?;
            hierarchy::enforce_blocked_precedence(&mut draft);
            let (next, changes) = draft.finish();
            if !changes.is_empty() {
                *guard = Arc::new(next);
            }
            (out, changes)
        };

        if changes.is_empty() {
            return Ok(out);
        }
        self.cache.notify(changes.iter().map(Change::id).collect(), ChangeSource::Local);
        if self.jobs.send(Job::Persist { op, changes }).is_err() {
            tracing::error!(?op, "persistence worker is gone, change stays in memory only");
        }
        Ok(out)
    }

    fn patch(&self, op: Operation, id: Uuid, patch: TaskPatch) -> Result<(), EngineError> {
        self.mutate(op, |draft, now| hierarchy::apply_patch(draft, id, &patch, now))
    }

    // ── Operations ─────────────────────────────────────────────

    pub fn create(&self, title: &str, parent_id: Option<Uuid>, user_id: Option<Uuid>) -> Result<Uuid, EngineError> {
        self.mutate(Operation::Create, |draft, now| hierarchy::create(draft, title, parent_id, user_id, now))
    }

    pub fn update(&self, id: Uuid, patch: TaskPatch) -> Result<Task, EngineError> {
        self.patch(Operation::Update, id, patch)?;
        self.get(id).ok_or(EngineError::TaskNotFound(id))
    }

    /// Delete `id` with its whole subtree.
    pub fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        self.mutate(Operation::Delete, |draft, now| hierarchy::remove_subtree(draft, id, now).map(drop))
    }

    /// Silently does nothing when the move would create a cycle.
    pub fn reparent(&self, id: Uuid, new_parent: Option<Uuid>) -> Result<(), EngineError> {
        self.mutate(Operation::Reparent, |draft, now| hierarchy::reparent(draft, id, new_parent, now).map(drop))
    }

    pub fn set_status(&self, id: Uuid, status: TriageStatus) -> Result<(), EngineError> {
        self.mutate(Operation::SetStatus, |draft, now| {
            hierarchy::set_status(draft, id, status, Origin::User, now)
        })
    }

    pub fn bulk_set_priority(&self, items: &[PriorityUpdate]) -> Result<(), EngineError> {
        self.mutate(Operation::BulkPriority, |draft, _| {
            if let Some(missing) = items.iter().find(|i| !draft.contains(&i.id)) {
                return Err(EngineError::TaskNotFound(missing.id));
            }
            for item in items {
                if let Some(task) = draft.get_mut(&item.id) {
                    task.priority = item.priority;
                }
            }
            Ok(())
        })
    }

    pub fn duplicate_subtree(&self, id: Uuid) -> Result<Uuid, EngineError> {
        self.mutate(Operation::Duplicate, |draft, now| hierarchy::duplicate_subtree(draft, id, now))
    }

    pub fn toggle_timer(&self, id: Uuid) -> Result<(), EngineError> {
        self.mutate(Operation::ToggleTimer, |draft, now| hierarchy::toggle_timer(draft, id, now))
    }

    pub fn set_urgent(&self, id: Uuid, urgent: bool) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { urgent: Some(urgent), ..Default::default() })
    }

    pub fn set_impact(&self, id: Uuid, impact: bool) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { impact: Some(impact), ..Default::default() })
    }

    pub fn set_major_incident(&self, id: Uuid, major_incident: bool) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { major_incident: Some(major_incident), ..Default::default() })
    }

    pub fn set_category(&self, id: Uuid, category: Category) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { category: Some(category), ..Default::default() })
    }

    pub fn set_difficulty(&self, id: Uuid, difficulty: Difficulty) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { difficulty: Some(difficulty), ..Default::default() })
    }

    pub fn set_comment(&self, id: Uuid, comment: impl Into<String>) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { comment: Some(comment.into()), ..Default::default() })
    }

    pub fn set_duration(&self, id: Uuid, minutes: Option<u32>) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { duration_in_minutes: Some(minutes), ..Default::default() })
    }

    pub fn set_termination_date(&self, id: Uuid, date: Option<DateTime<Utc>>) -> Result<(), EngineError> {
        self.patch(Operation::SetField, id, TaskPatch { termination_date: Some(date), ..Default::default() })
    }

    /// Reassign to another user. Reverted if the backend refuses it.
    pub fn assign_user(&self, id: Uuid, user_id: Option<Uuid>) -> Result<(), EngineError> {
        self.patch(Operation::Assign, id, TaskPatch { user_id: Some(user_id), ..Default::default() })
    }

    /// Upsert a batch of records (one backend call). Broken links and extra
    /// running timers are repaired first.
    pub fn import(&self, tasks: Vec<Task>) -> Result<(), EngineError> {
        self.mutate(Operation::Import, |draft, now| {
            for task in tasks {
                draft.insert(task);
            }
            let repaired = hierarchy::repair(draft, now);
            if !repaired.is_empty() {
                tracing::warn!(count = repaired.len(), "imported tasks needed hierarchy repairs");
            }
            Ok(())
        })
    }

    pub fn clear_all(&self) -> Result<(), EngineError> {
        self.mutate(Operation::ClearAll, |draft, _| {
            let ids: Vec<Uuid> = draft.iter().map(|t| t.id).collect();
            for id in ids {
                draft.remove(&id);
            }
            Ok(())
        })
    }

    /// Replace (or drop) one record with what another client wrote. No rule
    /// is re-run and nothing is persisted: that client already did both.
    pub fn apply_remote(&self, id: Uuid, incoming: Option<Task>) -> bool {
        let changed = {
            let mut guard = self.cache.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            if guard.get(&id) == incoming.as_ref() {
                false
            } else {
                let snapshot = Arc::make_mut(&mut *guard);
                match incoming {
                    Some(task) => snapshot.insert(id, task),
                    None => snapshot.remove(&id),
                };
                true
            }
        };
        if changed {
            self.cache.notify(vec![id], ChangeSource::Remote);
        }
        changed
    }
}

/// View order: ascending priority, unprioritized last, then creation time.
pub fn sort_for_view(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| match (a.priority, b.priority) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.created_at.cmp(&b.created_at)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.created_at.cmp(&b.created_at),
    });
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, MemoryBackend};
    use crate::model::{AppSettings, TimerInterval, UserSettings};
    use crate::replica::{Hub, ReplicatedMap, SharedMap};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory backend whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_creates: AtomicBool,
        fail_updates: AtomicBool,
    }

    impl FlakyBackend {
        fn refuse(&self, flag: &AtomicBool) -> Result<(), BackendError> {
            if flag.load(Ordering::SeqCst) {
                Err(BackendError::Status { status: 503, body: "unavailable".into() })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl TaskBackend for FlakyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }
        async fn list_tasks(&self, user: Option<Uuid>) -> Result<Vec<Task>, BackendError> {
            self.inner.list_tasks(user).await
        }
        async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
            self.inner.get_task(id).await
        }
        async fn create_task(&self, task: &Task) -> Result<Task, BackendError> {
            self.refuse(&self.fail_creates)?;
            self.inner.create_task(task).await
        }
        async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
            self.refuse(&self.fail_updates)?;
            self.inner.update_task(id, patch).await
        }
        async fn delete_task(&self, id: Uuid) -> Result<(), BackendError> {
            self.inner.delete_task(id).await
        }
        async fn bulk_update_priorities(&self, items: &[PriorityUpdate]) -> Result<(), BackendError> {
            self.refuse(&self.fail_updates)?;
            self.inner.bulk_update_priorities(items).await
        }
        async fn import_tasks(&self, tasks: &[Task]) -> Result<(), BackendError> {
            self.refuse(&self.fail_creates)?;
            self.inner.import_tasks(tasks).await
        }
        async fn clear_all_tasks(&self) -> Result<(), BackendError> {
            self.inner.clear_all_tasks().await
        }
        async fn user_settings(&self) -> Result<UserSettings, BackendError> {
            self.inner.user_settings().await
        }
        async fn set_user_settings(&self, settings: &UserSettings) -> Result<(), BackendError> {
            self.inner.set_user_settings(settings).await
        }
        async fn app_settings(&self) -> Result<AppSettings, BackendError> {
            self.inner.app_settings().await
        }
        async fn set_app_settings(&self, settings: &AppSettings) -> Result<(), BackendError> {
            self.inner.set_app_settings(settings).await
        }
    }

    fn store() -> (Arc<TaskStore>, Arc<FlakyBackend>) {
        let backend = Arc::new(FlakyBackend::default());
        let store = TaskStore::new(backend.clone(), Vec::new(), None);
        (store, backend)
    }

    fn status(store: &TaskStore, id: Uuid) -> TriageStatus {
        store.get(id).unwrap().triage_status
    }

    fn assert_consistent(store: &TaskStore) {
        let violations = hierarchy::check(&store.snapshot());
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[tokio::test]
    async fn create_links_parent_and_child_and_persists() {
        let (store, backend) = store();
        let root = store.create("  Root  ", None, None).unwrap();
        let child = store.create("Child", Some(root), None).unwrap();

        assert_eq!(store.get(root).unwrap().title, "Root");
        assert_eq!(store.get(root).unwrap().children, vec![child]);
        assert_eq!(store.get(child).unwrap().parent_id, Some(root));
        assert_consistent(&store);

        store.flush().await;
        let persisted = backend.get_task(root).await.unwrap().unwrap();
        assert_eq!(persisted.children, vec![child]);
        assert_eq!(backend.list_tasks(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_title_and_unknown_parent_are_rejected() {
        let (store, _) = store();
        assert!(matches!(store.create("   ", None, None), Err(EngineError::EmptyTitle)));
        let ghost = Uuid::new_v4();
        assert!(matches!(store.create("x", Some(ghost), None), Err(EngineError::TaskNotFound(id)) if id == ghost));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reparent_under_descendant_changes_nothing() {
        let (store, _) = store();
        let a = store.create("a", None, None).unwrap();
        let b = store.create("b", Some(a), None).unwrap();
        let c = store.create("c", Some(b), None).unwrap();

        let before = store.snapshot();
        store.reparent(a, Some(c)).unwrap();
        store.reparent(a, Some(a)).unwrap();
        assert!(Arc::ptr_eq(&before, &store.snapshot()));

        store.reparent(c, None).unwrap();
        assert_eq!(store.get(b).unwrap().children, Vec::<Uuid>::new());
        assert_eq!(store.get(c).unwrap().parent_id, None);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn parent_follows_its_children() {
        let (store, _) = store();
        let parent = store.create("parent", None, None).unwrap();
        let a = store.create("a", Some(parent), None).unwrap();
        let b = store.create("b", Some(parent), None).unwrap();

        store.set_status(a, TriageStatus::Done).unwrap();
        assert_eq!(status(&store, parent), TriageStatus::Backlog);
        store.set_status(b, TriageStatus::Dropped).unwrap();
        assert_eq!(status(&store, parent), TriageStatus::Done);
        assert!(store.get(parent).unwrap().termination_date.is_some());

        store.set_status(a, TriageStatus::Ready).unwrap();
        assert_eq!(status(&store, parent), TriageStatus::Ready);

        store.set_status(a, TriageStatus::Dropped).unwrap();
        assert_eq!(status(&store, parent), TriageStatus::Dropped);
    }

    #[tokio::test]
    async fn done_cascades_down_but_spares_dropped() {
        let (store, _) = store();
        let root = store.create("root", None, None).unwrap();
        let open = store.create("open", Some(root), None).unwrap();
        let dropped = store.create("dropped", Some(root), None).unwrap();
        let deep = store.create("deep", Some(open), None).unwrap();
        store.set_status(dropped, TriageStatus::Dropped).unwrap();

        store.set_status(root, TriageStatus::Done).unwrap();
        assert_eq!(status(&store, open), TriageStatus::Done);
        assert_eq!(status(&store, deep), TriageStatus::Done);
        assert_eq!(status(&store, dropped), TriageStatus::Dropped);
        assert_eq!(status(&store, root), TriageStatus::Done);
    }

    #[tokio::test]
    async fn one_running_timer_at_a_time() {
        let (store, _) = store();
        let a = store.create("a", None, None).unwrap();
        let b = store.create("b", None, None).unwrap();

        store.toggle_timer(a).unwrap();
        assert!(store.get(a).unwrap().has_running_timer());
        assert_eq!(status(&store, a), TriageStatus::Wip);

        store.toggle_timer(b).unwrap();
        let running: Vec<Uuid> = store.list().into_iter().filter(|t| t.has_running_timer()).map(|t| t.id).collect();
        assert_eq!(running, vec![b]);
        assert_eq!(store.get(a).unwrap().timer.len(), 1);

        store.toggle_timer(b).unwrap();
        assert!(!store.get(b).unwrap().has_running_timer());
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn blocked_outranks_the_backlog() {
        let (store, backend) = store();
        let ids: Vec<Uuid> = ["p5", "p3", "p7", "blocker"]
            .iter()
            .map(|t| store.create(t, None, None).unwrap())
            .collect();
        store
            .bulk_set_priority(&[
                PriorityUpdate { id: ids[0], priority: Some(5) },
                PriorityUpdate { id: ids[1], priority: Some(3) },
                PriorityUpdate { id: ids[2], priority: Some(7) },
            ])
            .unwrap();

        store.set_status(ids[3], TriageStatus::Blocked).unwrap();
        assert_eq!(store.get(ids[3]).unwrap().priority, Some(2));

        // A later backlog move below it drags the blocked task along.
        store.bulk_set_priority(&[PriorityUpdate { id: ids[0], priority: Some(-4) }]).unwrap();
        assert_eq!(store.get(ids[3]).unwrap().priority, Some(-5));
        assert_consistent(&store);

        store.flush().await;
        assert_eq!(backend.get_task(ids[3]).await.unwrap().unwrap().priority, Some(-5));
    }

    #[tokio::test]
    async fn bulk_priority_with_unknown_id_changes_nothing() {
        let (store, _) = store();
        let a = store.create("a", None, None).unwrap();
        let err = store
            .bulk_set_priority(&[
                PriorityUpdate { id: a, priority: Some(1) },
                PriorityUpdate { id: Uuid::new_v4(), priority: Some(2) },
            ])
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));
        assert_eq!(store.get(a).unwrap().priority, None);
    }

    #[tokio::test]
    async fn delete_takes_the_subtree_everywhere() {
        let (store, backend) = store();
        let root = store.create("root", None, None).unwrap();
        let keep = store.create("keep", None, None).unwrap();
        let child = store.create("child", Some(root), None).unwrap();
        store.create("grandchild", Some(child), None).unwrap();
        store.flush().await;

        store.delete(root).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(keep).is_some());

        store.flush().await;
        let left: Vec<Uuid> = backend.list_tasks(None).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(left, vec![keep]);
    }

    #[tokio::test]
    async fn duplicate_copies_the_subtree_on_top() {
        let (store, _) = store();
        let parent = store.create("parent", None, None).unwrap();
        let source = store.create("source", Some(parent), None).unwrap();
        let leaf = store.create("leaf", Some(source), None).unwrap();
        store.bulk_set_priority(&[PriorityUpdate { id: leaf, priority: Some(-3) }]).unwrap();
        store.toggle_timer(leaf).unwrap();

        let copy = store.duplicate_subtree(source).unwrap();
        let copied = store.get(copy).unwrap();
        assert_eq!(copied.title, "source (Copy)");
        assert_eq!(copied.priority, Some(-4));
        assert_eq!(copied.parent_id, Some(parent));
        assert_eq!(store.get(parent).unwrap().children, vec![source, copy]);

        let copied_leaf = store.children_of(copy).pop().unwrap();
        assert_ne!(copied_leaf.id, leaf);
        assert_eq!(copied_leaf.title, "leaf");
        assert!(copied_leaf.timer.is_empty());
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn update_refuses_managed_fields() {
        let (store, _) = store();
        let a = store.create("a", None, None).unwrap();
        let err = store
            .update(a, TaskPatch { children: Some(vec![Uuid::new_v4()]), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, EngineError::ManagedField("children")));

        let updated = store
            .update(a, TaskPatch { title: Some("renamed".into()), urgent: Some(true), ..Default::default() })
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert!(updated.urgent);
    }

    #[tokio::test]
    async fn field_setters_write_through() {
        let (store, backend) = store();
        let a = store.create("a", None, None).unwrap();
        let when = Utc::now();
        store.set_impact(a, true).unwrap();
        store.set_major_incident(a, true).unwrap();
        store.set_category(a, Category::Health).unwrap();
        store.set_difficulty(a, Difficulty::Five).unwrap();
        store.set_comment(a, "check logs").unwrap();
        store.set_duration(a, Some(45)).unwrap();
        store.set_termination_date(a, Some(when)).unwrap();
        store.set_urgent(a, true).unwrap();

        store.flush().await;
        let persisted = backend.get_task(a).await.unwrap().unwrap();
        assert_eq!(persisted, store.get(a).unwrap());
        assert_eq!(persisted.category, Category::Health);
        assert_eq!(persisted.duration_in_minutes, Some(45));
        assert_eq!(persisted.termination_date, Some(when));
    }

    #[tokio::test]
    async fn read_helpers() {
        let (store, _) = store();
        let root = store.create("root", None, None).unwrap();
        let other = store.create("other", None, None).unwrap();
        let child = store.create("child", Some(root), None).unwrap();
        store.set_difficulty(root, Difficulty::Three).unwrap();
        store.set_difficulty(child, Difficulty::Half).unwrap();
        store.bulk_set_priority(&[PriorityUpdate { id: other, priority: Some(-1) }]).unwrap();

        let roots: Vec<Uuid> = store.roots().into_iter().map(|t| t.id).collect();
        assert_eq!(roots, vec![other, root]);
        assert_eq!(store.list()[0].id, other);
        assert_eq!(store.children_of(root).len(), 1);
        assert_eq!(store.effort(root), Some(3.5));
        assert_eq!(store.effort(Uuid::new_v4()), None);
        assert_eq!(store.tracked_minutes(root), Some(0));
    }

    #[tokio::test]
    async fn failed_create_is_reverted() {
        let (store, backend) = store();
        backend.fail_creates.store(true, Ordering::SeqCst);
        let mut events = store.subscribe();

        let id = store.create("doomed", None, None).unwrap();
        assert!(store.get(id).is_some(), "visible before the backend answers");
        store.flush().await;

        assert!(store.get(id).is_none());
        assert_eq!(events.recv().await.unwrap().source, ChangeSource::Local);
        let revert = events.recv().await.unwrap();
        assert_eq!(revert, TasksChanged { ids: vec![id], source: ChangeSource::Revert });
    }

    #[tokio::test]
    async fn failed_child_create_reverts_the_parent_link() {
        let (store, backend) = store();
        let parent = store.create("parent", None, None).unwrap();
        store.flush().await;

        backend.fail_creates.store(true, Ordering::SeqCst);
        let child = store.create("child", Some(parent), None).unwrap();
        store.flush().await;

        assert!(store.get(child).is_none());
        assert!(store.get(parent).unwrap().children.is_empty());
        assert!(backend.get_task(parent).await.unwrap().unwrap().children.is_empty());
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn failed_child_create_unlinks_a_parent_edited_meanwhile() {
        let (store, backend) = store();
        let parent = store.create("parent", None, None).unwrap();
        store.flush().await;

        backend.fail_creates.store(true, Ordering::SeqCst);
        let child = store.create("child", Some(parent), None).unwrap();
        store.set_comment(parent, "note").unwrap();
        store.flush().await;

        assert!(store.get(child).is_none());
        let cached = store.get(parent).unwrap();
        assert!(cached.children.is_empty());
        assert_eq!(cached.comment, "note");
        assert_consistent(&store);

        let persisted = backend.get_task(parent).await.unwrap().unwrap();
        assert_eq!(persisted.children, cached.children);
        assert_eq!(persisted.comment, "note");
    }

    #[tokio::test]
    async fn revert_resettles_the_parent_status() {
        let (store, backend) = store();
        let parent = store.create("parent", None, None).unwrap();
        let done = store.create("done", Some(parent), None).unwrap();
        store.set_status(done, TriageStatus::Done).unwrap();
        store.flush().await;
        assert_eq!(status(&store, parent), TriageStatus::Done);

        backend.fail_creates.store(true, Ordering::SeqCst);
        store.create("reopens", Some(parent), None).unwrap();
        assert_eq!(status(&store, parent), TriageStatus::Ready);
        store.set_urgent(parent, true).unwrap();
        store.flush().await;

        assert_eq!(status(&store, parent), TriageStatus::Done);
        assert_eq!(store.get(parent).unwrap().children, vec![done]);
        assert_eq!(backend.get_task(parent).await.unwrap().unwrap().triage_status, TriageStatus::Done);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn failed_update_keeps_the_optimistic_state() {
        let (store, backend) = store();
        let a = store.create("a", None, None).unwrap();
        store.flush().await;

        backend.fail_updates.store(true, Ordering::SeqCst);
        store.set_comment(a, "kept").unwrap();
        store.flush().await;

        assert_eq!(store.get(a).unwrap().comment, "kept");
        assert_eq!(backend.get_task(a).await.unwrap().unwrap().comment, "");
    }

    #[tokio::test]
    async fn failed_assignment_is_reverted() {
        let (store, backend) = store();
        let a = store.create("a", None, None).unwrap();
        store.flush().await;

        backend.fail_updates.store(true, Ordering::SeqCst);
        store.assign_user(a, Some(Uuid::new_v4())).unwrap();
        store.flush().await;
        assert_eq!(store.get(a).unwrap().user_id, None);
    }

    #[tokio::test]
    async fn revert_leaves_newer_edits_alone() {
        let (store, backend) = store();
        backend.fail_creates.store(true, Ordering::SeqCst);
        let a = store.create("a", None, None).unwrap();
        // Edited again before the backend answered the create.
        store.set_comment(a, "newer").unwrap();
        store.flush().await;
        assert_eq!(store.get(a).unwrap().comment, "newer");
    }

    #[tokio::test]
    async fn import_and_clear_all() {
        let (store, backend) = store();
        let mut a = Task::new("a".into(), None, None, Utc::now());
        let mut b = Task::new("b".into(), Some(a.id), None, Utc::now());
        a.children.push(b.id);
        b.priority = Some(1);
        store.import(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(store.len(), 2);
        assert_consistent(&store);

        store.flush().await;
        assert_eq!(backend.list_tasks(None).await.unwrap().len(), 2);

        store.clear_all().unwrap();
        assert!(store.is_empty());
        store.flush().await;
        assert!(backend.list_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn import_repairs_malformed_records() {
        let (store, backend) = store();
        let parent = store.create("parent", None, None).unwrap();
        let running = store.create("running", None, None).unwrap();
        store.toggle_timer(running).unwrap();

        let unlinked = Task::new("unlinked".into(), Some(parent), None, Utc::now());
        let mut own_parent = Task::new("own parent".into(), None, None, Utc::now());
        own_parent.parent_id = Some(own_parent.id);
        let mut second_timer = Task::new("second timer".into(), None, None, Utc::now());
        second_timer.timer.push(TimerInterval::started_at(Utc::now().timestamp_millis() + 60_000));

        store
            .import(vec![unlinked.clone(), own_parent.clone(), second_timer.clone()])
            .unwrap();
        assert_consistent(&store);
        assert_eq!(store.get(parent).unwrap().children, vec![unlinked.id]);
        assert_eq!(store.get(own_parent.id).unwrap().parent_id, None);
        assert!(store.get(second_timer.id).unwrap().has_running_timer());
        assert!(!store.get(running).unwrap().has_running_timer());

        store.flush().await;
        let persisted = backend.get_task(own_parent.id).await.unwrap().unwrap();
        assert_eq!(persisted.parent_id, None);
    }

    #[tokio::test]
    async fn lowest_priority_backlog_does_not_overflow() {
        let (store, _) = store();
        let floor = store.create("floor", None, None).unwrap();
        let blocked = store.create("blocked", None, None).unwrap();
        store.bulk_set_priority(&[PriorityUpdate { id: floor, priority: Some(i64::MIN) }]).unwrap();

        store.set_status(blocked, TriageStatus::Blocked).unwrap();
        assert_eq!(store.get(blocked).unwrap().priority, Some(i64::MIN));
        let copy = store.duplicate_subtree(floor).unwrap();
        assert_eq!(store.get(copy).unwrap().priority, Some(i64::MIN));
    }

    #[tokio::test]
    async fn failed_import_is_reverted() {
        let (store, backend) = store();
        backend.fail_creates.store(true, Ordering::SeqCst);
        store.import(vec![Task::new("a".into(), None, None, Utc::now())]).unwrap();
        store.flush().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn only_confirmed_changes_are_replicated() {
        let hub = Hub::default();
        let map = SharedMap::join(&hub);
        let backend = Arc::new(FlakyBackend::default());
        let bridge = Arc::new(ReplicationBridge::new(map.clone()));
        let store = TaskStore::new(backend.clone(), Vec::new(), Some(bridge));

        let kept = store.create("kept", None, None).unwrap();
        store.flush().await;
        assert_eq!(map.get(kept).unwrap(), store.get(kept));

        backend.fail_creates.store(true, Ordering::SeqCst);
        let lost = store.create("lost", None, None).unwrap();
        backend.fail_updates.store(true, Ordering::SeqCst);
        store.set_comment(kept, "unsaved").unwrap();
        store.flush().await;

        assert_eq!(map.get(lost).unwrap(), None);
        assert_eq!(map.get(kept).unwrap().unwrap().comment, "");
    }

    #[tokio::test]
    async fn remote_changes_reach_the_other_cache() {
        let hub = Hub::default();
        let backend = Arc::new(MemoryBackend::new());

        let map_a = SharedMap::join(&hub);
        let store_a = TaskStore::new(backend.clone(), Vec::new(), Some(Arc::new(ReplicationBridge::new(map_a))));

        let bridge_b = ReplicationBridge::new(SharedMap::join(&hub));
        let store_b = TaskStore::new(backend.clone(), Vec::new(), None);
        let _observer = bridge_b.observe(Arc::downgrade(&store_b));
        let mut events = store_b.subscribe();

        let id = store_a.create("from a", None, None).unwrap();
        store_a.flush().await;

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, TasksChanged { ids: vec![id], source: ChangeSource::Remote });
        assert_eq!(store_b.get(id), store_a.get(id));

        store_a.delete(id).unwrap();
        store_a.flush().await;
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.source, ChangeSource::Remote);
        assert!(store_b.get(id).is_none());
    }

    #[tokio::test]
    async fn same_remote_value_twice_is_one_event() {
        let (store, _) = store();
        let task = Task::new("remote".into(), None, None, Utc::now());
        assert!(store.apply_remote(task.id, Some(task.clone())));
        assert!(!store.apply_remote(task.id, Some(task.clone())));
        assert!(store.apply_remote(task.id, None));
        assert!(store.is_empty());
    }
}
