//! Composition root: one session wires config, backend, store and bridge.

use crate::backend::{BackendKind, TaskBackend};
use crate::bridge::ReplicationBridge;
use crate::config::Config;
use crate::error::BackendError;
use crate::hierarchy::{self, Snapshot};
use crate::model::{AppSettings, UserSettings};
use crate::replica::ReplicatedMap;
use crate::selector::select_backend;
use crate::store::TaskStore;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Session {
    config: Config,
    backend: Arc<dyn TaskBackend>,
    store: Arc<TaskStore>,
    observer: Option<JoinHandle<()>>,
}

impl Session {
    /// Select the backend for `config` and load the user's tasks.
    pub async fn start(config: Config, map: Option<Arc<dyn ReplicatedMap>>) -> Self {
        let backend = select_backend(&config).await;
        Self::with_backend(config, backend, map).await
    }

    /// Same as `start`, with the adapter chosen by the caller.
    pub async fn with_backend(
        config: Config,
        backend: Arc<dyn TaskBackend>,
        map: Option<Arc<dyn ReplicatedMap>>,
    ) -> Self {
        let loaded = match backend.list_tasks(config.user_id).await {
            Ok(tasks) => Some(tasks),
            Err(e) => {
                tracing::error!(error = %e, "initial load failed, starting with an empty cache");
                None
            }
        };
        let tasks = loaded.clone().unwrap_or_default();

        let snapshot: Snapshot = tasks.iter().map(|t| (t.id, t.clone())).collect();
        for violation in hierarchy::check(&snapshot) {
            tracing::warn!(?violation, "loaded tasks break a hierarchy invariant");
        }

        let bridge = map.map(|m| Arc::new(ReplicationBridge::new(m)));
        if let (Some(bridge), Some(loaded)) = (&bridge, &loaded) {
            // The map is shared by every user; reconcile against all rows.
            let everything = match config.user_id {
                None => Some(loaded.clone()),
                Some(_) => match backend.list_tasks(None).await {
                    Ok(all) => Some(all),
                    Err(e) => {
                        tracing::warn!(error = %e, "unfiltered load failed, leaving the replicated map as is");
                        None
                    }
                },
            };
            // Reconciling against a failed load would wipe the shared map.
            if let Some(everything) = everything {
                if let Err(e) = bridge.reconcile(&everything) {
                    tracing::warn!(error = %e, "reconciling the replicated map failed");
                }
            }
        }

        let store = TaskStore::new(backend.clone(), tasks, bridge.clone());
        let observer = bridge.map(|b| b.observe(Arc::downgrade(&store)));

        tracing::info!(
            backend = ?backend.kind(),
            tasks = store.len(),
            replicated = observer.is_some(),
            "session started"
        );
        Session { config, backend, store, observer }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn user_settings(&self) -> Result<UserSettings, BackendError> {
        self.backend.user_settings().await
    }

    pub async fn set_user_settings(&self, settings: &UserSettings) -> Result<(), BackendError> {
        self.backend.set_user_settings(settings).await
    }

    pub async fn app_settings(&self) -> Result<AppSettings, BackendError> {
        self.backend.app_settings().await
    }

    pub async fn set_app_settings(&self, settings: &AppSettings) -> Result<(), BackendError> {
        self.backend.set_app_settings(settings).await
    }

    /// Wait for pending writes, then stop observing remote changes.
    pub async fn shutdown(mut self) {
        self.store.flush().await;
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::local::LocalBackend;
    use crate::model::{Task, TriageStatus};
    use crate::replica::{task_fields, Hub, SharedMap};
    use chrono::Utc;
    use uuid::Uuid;

    fn local_config(dir: &tempfile::TempDir) -> Config {
        Config { force_local: true, data_path: dir.path().join("tasks.redb"), ..Default::default() }
    }

    #[tokio::test]
    async fn forced_local_session_uses_the_redb_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::start(local_config(&dir), None).await;
        assert_eq!(session.backend_kind(), BackendKind::Local);
        assert!(session.store().is_empty());
    }

    #[tokio::test]
    async fn tasks_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn TaskBackend> = Arc::new(LocalBackend::open(dir.path().join("tasks.redb")).unwrap());

        let session = Session::with_backend(local_config(&dir), backend.clone(), None).await;
        let root = session.store().create("root", None, None).unwrap();
        let child = session.store().create("child", Some(root), None).unwrap();
        session.store().set_status(child, TriageStatus::Done).unwrap();
        session.shutdown().await;

        let session = Session::with_backend(local_config(&dir), backend, None).await;
        let store = session.store();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(root).unwrap().children, vec![child]);
        assert_eq!(store.get(root).unwrap().triage_status, TriageStatus::Done);
    }

    #[tokio::test]
    async fn load_is_filtered_by_user() {
        let me = Uuid::new_v4();
        let mut mine = Task::new("mine".into(), None, Some(me), Utc::now());
        mine.priority = Some(1);
        let theirs = Task::new("theirs".into(), None, None, Utc::now());
        let backend = Arc::new(MemoryBackend::with_tasks([mine.clone(), theirs]));

        let config = Config { user_id: Some(me), ..Default::default() };
        let session = Session::with_backend(config, backend, None).await;
        assert_eq!(session.store().list(), vec![mine]);
    }

    #[tokio::test]
    async fn startup_reconciles_the_replicated_map() {
        let hub = Hub::default();
        let map = SharedMap::join(&hub);
        let stray = Task::new("stray".into(), None, None, Utc::now());
        map.set_fields(stray.id, task_fields(&stray).unwrap()).unwrap();

        let kept = Task::new("kept".into(), None, None, Utc::now());
        let backend = Arc::new(MemoryBackend::with_tasks([kept.clone()]));
        let _session = Session::with_backend(Config::default(), backend, Some(map.clone())).await;

        assert_eq!(map.ids().unwrap(), vec![kept.id]);
        assert_eq!(map.get(kept.id).unwrap(), Some(kept));
    }

    #[tokio::test]
    async fn filtered_startup_keeps_other_users_in_the_map() {
        let me = Uuid::new_v4();
        let mine = Task::new("mine".into(), None, Some(me), Utc::now());
        let theirs = Task::new("theirs".into(), None, Some(Uuid::new_v4()), Utc::now());
        let backend = Arc::new(MemoryBackend::with_tasks([mine.clone(), theirs.clone()]));

        let hub = Hub::default();
        let map = SharedMap::join(&hub);
        map.set_fields(theirs.id, task_fields(&theirs).unwrap()).unwrap();

        let config = Config { user_id: Some(me), ..Default::default() };
        let session = Session::with_backend(config, backend, Some(map.clone())).await;

        assert_eq!(session.store().list(), vec![mine.clone()]);
        assert_eq!(map.get(theirs.id).unwrap(), Some(theirs));
        assert_eq!(map.get(mine.id).unwrap(), Some(mine));
    }

    #[tokio::test]
    async fn settings_go_through_the_selected_backend() {
        let session = Session::with_backend(Config::default(), Arc::new(MemoryBackend::new()), None).await;
        let settings = AppSettings { reminders_enabled: false, ..Default::default() };
        session.set_app_settings(&settings).await.unwrap();
        assert_eq!(session.app_settings().await.unwrap(), settings);
        assert_eq!(session.user_settings().await.unwrap(), UserSettings::default());
    }
}
