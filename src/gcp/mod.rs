//! Adapters backed by Google Cloud services.
//!
//! Cloud Storage goes through `google-cloud-storage`; Pub/Sub, Cloud Tasks and
//! Secret Manager are called over their REST APIs. Both paths authenticate
//! with Application Default Credentials.

pub mod auth;
pub mod pubsub;
pub mod secrets;
pub mod storage;
pub mod tasks;

use reqwest::Response;
use url::Url;

use crate::adapters::AdapterResult;
use crate::errors::AdapterError;

/// Resolves `path` against an API root such as `https://pubsub.googleapis.com/v1/`.
fn api_url(endpoint: &Url, path: &str) -> AdapterResult<Url> {
    Ok(endpoint.join(path.trim_start_matches('/'))?)
}

/// Turns a non-2xx response into [`AdapterError::FailureResponseCode`].
async fn checked(response: Response) -> AdapterResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(AdapterError::FailureResponseCode {
        code: status.as_u16(),
        message,
    })
}

/// Accepts a short resource name or one already qualified with `projects/`.
fn qualified(project: &str, collection: &str, name: &str) -> String {
    if name.starts_with("projects/") {
        name.to_string()
    } else {
        format!("projects/{project}/{collection}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let root = Url::parse("https://pubsub.googleapis.com/v1/").unwrap();
        assert_eq!(
            api_url(&root, "projects/p/topics/t:publish").unwrap().as_str(),
            "https://pubsub.googleapis.com/v1/projects/p/topics/t:publish"
        );
    }

    #[test]
    fn test_qualified() {
        assert_eq!(qualified("p", "topics", "t"), "projects/p/topics/t");
        assert_eq!(
            qualified("p", "topics", "projects/other/topics/t"),
            "projects/other/topics/t"
        );
    }
}
