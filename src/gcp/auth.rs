use google_cloud_auth::project::Config as AuthConfig;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use log::debug;
use std::sync::Arc;

use crate::adapters::AdapterResult;
use crate::errors::AdapterError;

const SCOPES: [&str; 1] = ["https://www.googleapis.com/auth/cloud-platform"];

/// Authorization headers for the REST adapters.
///
/// Backed by the same Application Default Credentials lookup the storage
/// client uses, so both resolve the same identity. Caching and refresh happen
/// inside the token source.
#[derive(Clone)]
pub struct AccessTokens {
    source: Arc<dyn TokenSource>,
}

impl AccessTokens {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }

    pub async fn from_default_credentials() -> AdapterResult<Self> {
        let config = AuthConfig::default().with_scopes(&SCOPES);
        let provider = DefaultTokenSourceProvider::new(config)
            .await
            .map_err(|e| AdapterError::Token(e.to_string()))?;
        debug!("resolved application default credentials");
        Ok(Self::new(provider.token_source()))
    }

    /// Value for the `Authorization` header, e.g. `Bearer ya29...`.
    pub async fn authorization(&self) -> AdapterResult<String> {
        let token = self
            .source
            .token()
            .await
            .map_err(|e| AdapterError::Token(e.to_string()))?;
        if token.starts_with("Bearer ") {
            Ok(token)
        } else {
            Ok(format!("Bearer {token}"))
        }
    }
}
