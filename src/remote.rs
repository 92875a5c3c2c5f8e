//! Networked adapter: JSON over HTTP to the REST front in `server`.

use crate::backend::{BackendKind, TaskBackend};
use crate::error::BackendError;
use crate::model::{AppSettings, PriorityUpdate, Task, TaskPatch, UserSettings};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

#[derive(Clone)]
pub struct RemoteBackend {
    client: Client,
    base_url: String,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        RemoteBackend { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a non-2xx answer into `BackendError::Status`.
async fn ok(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status { status: status.as_u16(), body })
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    Ok(ok(response).await?.json::<T>().await?)
}

#[async_trait]
impl TaskBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn list_tasks(&self, user: Option<Uuid>) -> Result<Vec<Task>, BackendError> {
        let mut request = self.client.get(self.url("/api/tasks"));
        if let Some(user) = user {
            request = request.query(&[("user_id", user.to_string())]);
        }
        json(request.send().await?).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        let response = self.client.get(self.url(&format!("/api/tasks/{id}"))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        json(response).await.map(Some)
    }

    async fn create_task(&self, task: &Task) -> Result<Task, BackendError> {
        json(self.client.post(self.url("/api/tasks")).json(task).send().await?).await
    }

    async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
        let response = self
            .client
            .patch(self.url(&format!("/api/tasks/{id}")))
            .json(patch)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(id));
        }
        json(response).await
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), BackendError> {
        ok(self.client.delete(self.url(&format!("/api/tasks/{id}"))).send().await?).await?;
        Ok(())
    }

    async fn bulk_update_priorities(&self, items: &[PriorityUpdate]) -> Result<(), BackendError> {
        ok(self.client.put(self.url("/api/tasks/priorities")).json(items).send().await?).await?;
        Ok(())
    }

    async fn import_tasks(&self, tasks: &[Task]) -> Result<(), BackendError> {
        ok(self.client.post(self.url("/api/tasks/import")).json(tasks).send().await?).await?;
        Ok(())
    }

    async fn clear_all_tasks(&self) -> Result<(), BackendError> {
        ok(self.client.delete(self.url("/api/tasks")).send().await?).await?;
        Ok(())
    }

    async fn user_settings(&self) -> Result<UserSettings, BackendError> {
        json(self.client.get(self.url("/api/settings/user")).send().await?).await
    }

    async fn set_user_settings(&self, settings: &UserSettings) -> Result<(), BackendError> {
        ok(self.client.put(self.url("/api/settings/user")).json(settings).send().await?).await?;
        Ok(())
    }

    async fn app_settings(&self) -> Result<AppSettings, BackendError> {
        json(self.client.get(self.url("/api/settings/app")).send().await?).await
    }

    async fn set_app_settings(&self, settings: &AppSettings) -> Result<(), BackendError> {
        ok(self.client.put(self.url("/api/settings/app")).json(settings).send().await?).await?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────
