use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use super::auth::AccessTokens;
use super::pubsub::{decode_publish_request, publish_request, PubSubClient};
use super::{api_url, checked};
use crate::adapters::{AdapterResult, DeferredPublish, TaskRecord, TaskScheduler};
use crate::errors::AdapterError;
use crate::types::TaskQueuePath;

const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
const PAGE_SIZE: u32 = 1000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResource {
    name: String,
    schedule_time: Option<DateTime<Utc>>,
    create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    dispatch_count: u32,
    #[serde(default)]
    response_count: u32,
    http_request: Option<HttpRequest>,
    last_attempt: Option<Attempt>,
}

#[derive(Deserialize)]
struct HttpRequest {
    url: Option<String>,
    body: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attempt {
    response_status: Option<Status>,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTasksResponse {
    #[serde(default)]
    tasks: Vec<TaskResource>,
    next_page_token: Option<String>,
}

impl TryFrom<TaskResource> for TaskRecord {
    type Error = AdapterError;

    fn try_from(task: TaskResource) -> Result<Self, Self::Error> {
        let schedule_time = task.schedule_time.ok_or_else(|| {
            AdapterError::UnexpectedResponse(format!("task {} has no scheduleTime", task.name))
        })?;
        let (target_url, payload) = match task.http_request {
            Some(request) => {
                let payload = request
                    .body
                    .and_then(|body| BASE64.decode(body).ok())
                    .and_then(|body| decode_publish_request(&body));
                (request.url, payload)
            }
            None => (None, None),
        };
        let last_attempt_status = task
            .last_attempt
            .and_then(|attempt| attempt.response_status)
            .map(|status| format!("{}: {}", status.code, status.message));
        Ok(TaskRecord {
            name: task.name,
            schedule_time,
            create_time: task.create_time,
            dispatch_count: task.dispatch_count,
            response_count: task.response_count,
            target_url,
            payload,
            last_attempt_status,
        })
    }
}

/// Cloud Tasks queue whose tasks publish straight to Pub/Sub when they fire.
///
/// Each task carries an authenticated `topics.publish` call, made as the
/// configured service account, so no service of ours is involved on fire.
pub struct CloudTasksScheduler {
    http: reqwest::Client,
    endpoint: Url,
    queue: TaskQueuePath,
    service_account: String,
    publisher: Arc<PubSubClient>,
    auth: Arc<AccessTokens>,
}

impl CloudTasksScheduler {
    pub fn new(
        http: reqwest::Client,
        endpoint: Url,
        queue: TaskQueuePath,
        service_account: &str,
        publisher: Arc<PubSubClient>,
        auth: Arc<AccessTokens>,
    ) -> Self {
        Self {
            http,
            endpoint,
            queue,
            service_account: service_account.to_string(),
            publisher,
            auth,
        }
    }

    fn task_body(&self, task: &DeferredPublish) -> AdapterResult<serde_json::Value> {
        let target = self.publisher.publish_url(&task.topic)?;
        Ok(json!({
            "responseView": "FULL",
            "task": {
                "name": task.task_name,
                "scheduleTime": task.schedule_time.to_rfc3339(),
                "httpRequest": {
                    "url": target.as_str(),
                    "httpMethod": "POST",
                    "headers": { "Content-Type": "application/json" },
                    "body": BASE64.encode(publish_request(&task.message)?),
                    "oauthToken": {
                        "serviceAccountEmail": self.service_account,
                        "scope": PUBSUB_SCOPE,
                    },
                },
            },
        }))
    }
}

#[async_trait]
impl TaskScheduler for CloudTasksScheduler {
    async fn create_task(&self, task: DeferredPublish) -> AdapterResult<TaskRecord> {
        let url = api_url(&self.endpoint, &format!("{}/tasks", self.queue.parent()))?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.auth.authorization().await?)
            .json(&self.task_body(&task)?)
            .send()
            .await?;
        let created: TaskResource = checked(response).await?.json().await?;
        info!("created task {}", created.name);
        created.try_into()
    }

    async fn list_tasks(&self) -> AdapterResult<Vec<TaskRecord>> {
        let url = api_url(&self.endpoint, &format!("{}/tasks", self.queue.parent()))?;
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("responseView", "FULL".to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let response = self
                .http
                .get(url.clone())
                .header(reqwest::header::AUTHORIZATION, self.auth.authorization().await?)
                .query(&query)
                .send()
                .await?;
            let page: ListTasksResponse = checked(response).await?.json().await?;
            for task in page.tasks {
                records.push(task.try_into()?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!("listed {} tasks in {}", records.len(), self.queue.parent());
        Ok(records)
    }

    async fn get_task(&self, task_name: &str) -> AdapterResult<TaskRecord> {
        let url = api_url(&self.endpoint, task_name)?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.auth.authorization().await?)
            .query(&[("responseView", "FULL")])
            .send()
            .await?;
        let task: TaskResource = checked(response).await?.json().await?;
        task.try_into()
    }

    async fn delete_task(&self, task_name: &str) -> AdapterResult<()> {
        let url = api_url(&self.endpoint, task_name)?;
        let response = self
            .http
            .delete(url)
            .header(reqwest::header::AUTHORIZATION, self.auth.authorization().await?)
            .send()
            .await?;
        checked(response).await?;
        info!("deleted task {}", task_name);
        Ok(())
    }
}
