use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

use super::auth::AccessTokens;
use super::{api_url, checked, qualified};
use crate::adapters::{AdapterResult, SecretStore};
use crate::errors::AdapterError;

#[derive(Deserialize)]
struct AccessResponse {
    payload: Payload,
}

#[derive(Deserialize)]
struct Payload {
    data: String,
}

/// Reads the latest version of Secret Manager secrets.
pub struct SecretManagerStore {
    http: reqwest::Client,
    endpoint: Url,
    project: String,
    auth: Arc<AccessTokens>,
}

impl SecretManagerStore {
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
}

#[async_trait]
impl SecretStore for SecretManagerStore {
    async fn secret(&self, name: &str) -> AdapterResult<String> {
        let secret = qualified(&self.project, "secrets", name);
        let url = api_url(&self.endpoint, &format!("{secret}/versions/latest:access"))?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.auth.authorization().await?)
            .send()
            .await?;
        let body: AccessResponse = checked(response).await?.json().await?;
        let data = BASE64.decode(body.payload.data)?;
        String::from_utf8(data)
            .map_err(|_| AdapterError::UnexpectedResponse(format!("secret {name} is not utf-8")))
    }
}
