use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use super::auth::AccessTokens;
use super::{api_url, checked, qualified};
use crate::adapters::{AdapterResult, QueuePublisher, QueueSubscriber, ReceivedMessage};
use crate::errors::AdapterError;
use crate::types::BackupTriggerMessage;

#[derive(Serialize, Deserialize)]
struct PubsubMessage {
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default, rename = "messageId", skip_serializing_if = "String::is_empty")]
    message_id: String,
}

#[derive(Serialize, Deserialize)]
struct PublishRequest {
    messages: Vec<PubsubMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedEnvelope>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedEnvelope {
    ack_id: String,
    message: PubsubMessage,
    delivery_attempt: Option<u32>,
}

/// Body of a `topics.publish` call carrying one trigger message.
///
/// The scheduler replays this exact body against the publish endpoint when a
/// task fires.
pub fn publish_request(message: &BackupTriggerMessage) -> AdapterResult<Vec<u8>> {
    let data = serde_json::to_vec(message)?;
    let attributes = HashMap::from([
        ("database".to_string(), message.database.to_string()),
        ("triggeredBy".to_string(), message.triggered_by.to_string()),
    ]);
    let request = PublishRequest {
        messages: vec![PubsubMessage {
            data: BASE64.encode(data),
            attributes,
            message_id: String::new(),
        }],
    };
    Ok(serde_json::to_vec(&request)?)
}

/// Reverses [`publish_request`]; `None` when the body carries no trigger message.
pub fn decode_publish_request(body: &[u8]) -> Option<BackupTriggerMessage> {
    let request: PublishRequest = serde_json::from_slice(body).ok()?;
    let data = BASE64.decode(&request.messages.first()?.data).ok()?;
    serde_json::from_slice(&data).ok()
}

pub struct PubSubClient {
    http: reqwest::Client,
    endpoint: Url,
    project: String,
    auth: Arc<AccessTokens>,
}

impl PubSubClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: Url,
        project: &str,
        auth: Arc<AccessTokens>,
    ) -> Self {
        Self {
            http,
            endpoint,
            project: project.to_string(),
            auth,
        }
    }

    /// `projects/{project}/topics/{topic}:publish` on this client's endpoint.
    pub fn publish_url(&self, topic: &str) -> AdapterResult<Url> {
        let topic = qualified(&self.project, "topics", topic);
        api_url(&self.endpoint, &format!("{topic}:publish"))
    }

    async fn subscription_call(
        &self,
        subscription: &str,
        method: &str,
        body: serde_json::Value,
    ) -> AdapterResult<reqwest::Response> {
        let subscription = qualified(&self.project, "subscriptions", subscription);
        let url = api_url(&self.endpoint, &format!("{subscription}:{method}"))?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.auth.authorization().await?)
            .json(&body)
            .send()
            .await?;
        checked(response).await
    }
}

#[async_trait]
impl QueuePublisher for PubSubClient {
    async fn publish(&self, topic: &str, message: &BackupTriggerMessage) -> AdapterResult<String> {
        let response = self
            .http
            .post(self.publish_url(topic)?)
            .header(reqwest::header::AUTHORIZATION, self.auth.authorization().await?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(publish_request(message)?)
            .send()
            .await?;
        let body: PublishResponse = checked(response).await?.json().await?;
        let message_id = body.message_ids.into_iter().next().ok_or_else(|| {
            AdapterError::UnexpectedResponse(format!("publish to {topic} returned no message id"))
        })?;
        debug!("published message {} to {}", message_id, topic);
        Ok(message_id)
    }
}

#[async_trait]
impl QueueSubscriber for PubSubClient {
    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> AdapterResult<Vec<ReceivedMessage>> {
        let response = self
            .subscription_call(subscription, "pull", json!({ "maxMessages": max_messages }))
            .await?;
        let body: PullResponse = response.json().await?;
        body.received_messages
            .into_iter()
            .map(|envelope| -> AdapterResult<ReceivedMessage> {
                Ok(ReceivedMessage {
                    ack_id: envelope.ack_id,
                    message_id: envelope.message.message_id,
                    data: BASE64.decode(envelope.message.data)?,
                    delivery_attempt: envelope.delivery_attempt,
                })
            })
            .collect()
    }

    async fn ack(&self, subscription: &str, ack_ids: &[String]) -> AdapterResult<()> {
        self.subscription_call(subscription, "acknowledge", json!({ "ackIds": ack_ids }))
            .await?;
        Ok(())
    }

    async fn nack(&self, subscription: &str, ack_ids: &[String]) -> AdapterResult<()> {
        self.extend_lease(subscription, ack_ids, 0).await
    }

    async fn extend_lease(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u32,
    ) -> AdapterResult<()> {
        self.subscription_call(
            subscription,
            "modifyAckDeadline",
            json!({ "ackIds": ack_ids, "ackDeadlineSeconds": seconds }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatabaseKind;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_publish_request_carries_message() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let message = BackupTriggerMessage::scheduled(DatabaseKind::Questdb, at, at);
        let body = publish_request(&message).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["messages"][0]["attributes"]["database"], "questdb");
        assert!(value["messages"][0].get("messageId").is_none());
        assert_eq!(decode_publish_request(&body), Some(message));
    }

    #[test]
    fn test_decode_rejects_foreign_bodies() {
        assert_eq!(decode_publish_request(b"{}"), None);
        assert_eq!(decode_publish_request(br#"{"messages":[]}"#), None);
        assert_eq!(
            decode_publish_request(br#"{"messages":[{"data":"bm90IGpzb24="}]}"#),
            None
        );
    }
}
