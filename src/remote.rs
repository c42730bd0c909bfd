//! JSON backend worker for per-product image actions.
//!
//! Each item is one product. The worker claims the item, POSTs
//! `{"product_id": "<id>"}` to the action endpoint, and treats a body with
//! `"status": "success"` as done. Anything else releases the claim so the
//! product can be picked up by a later run.

use crate::work::{Outcome, WorkError, WorkFuture, WorkItem, Worker};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    Populate,
    Delete,
}

impl RemoteAction {
    pub fn path(self) -> &'static str {
        match self {
            RemoteAction::Populate => "/api/populate-single-product",
            RemoteAction::Delete => "/api/delete-populated-single-product",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl RemoteOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("base_url must start with http:// or https://");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        Ok(())
    }

    fn endpoint(&self, action: RemoteAction) -> String {
        format!("{}{}", self.base_url.trim().trim_end_matches('/'), action.path())
    }
}

#[derive(Debug, Serialize)]
struct ActionRequest<'a> {
    product_id: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl ActionResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// The backend mentions leftover images it could not match to a variant.
    pub fn has_unmatched_images(&self) -> bool {
        self.message.contains("unmatched")
    }
}

/// Strips a GraphQL global id (`gid://shop/Product/123`) down to its trailing numeric part.
pub fn short_product_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Performs one [`RemoteAction`] per product against the admin backend.
#[derive(Debug, Clone)]
pub struct HttpActionWorker {
    client: reqwest::Client,
    endpoint: String,
    action: RemoteAction,
}

impl HttpActionWorker {
    pub fn new(options: RemoteOptions, action: RemoteAction) -> Result<Self> {
        options.validate()?;
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: options.endpoint(action),
            action,
        })
    }

    pub fn action(&self) -> RemoteAction {
        self.action
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Worker for HttpActionWorker {
    type Item = WorkItem<()>;

    fn perform(&self, item: Self::Item) -> WorkFuture {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let action = self.action;

        Box::pin(async move {
            // Released on every path but success, including a timed-out attempt being dropped.
            let Some(claim) = item.try_claim() else {
                return Ok(Outcome::failure(format!(
                    "product {} is already claimed",
                    item.id()
                )));
            };

            let product_id = short_product_id(item.id());
            let response = submit(&client, &endpoint, product_id)
                .await
                .map_err(|err| {
                    WorkError::new(err.context(format!("{action:?} request for product {product_id}")))
                })?;

            if response.has_unmatched_images() {
                tracing::warn!(
                    product_id,
                    message = %response.message,
                    "backend reported unmatched images"
                );
            }

            if response.is_success() {
                claim.commit();
                tracing::debug!(product_id, action = ?action, "remote action succeeded");
                Ok(Outcome::Success)
            } else {
                Ok(Outcome::failure(format!(
                    "product {product_id}: {}",
                    if response.message.is_empty() {
                        "backend did not report success"
                    } else {
                        response.message.as_str()
                    }
                )))
            }
        })
    }
}

async fn submit(client: &reqwest::Client, endpoint: &str, product_id: &str) -> Result<ActionResponse> {
    let response = client
        .post(endpoint)
        .json(&ActionRequest { product_id })
        .send()
        .await
        .with_context(|| format!("failed to reach {endpoint}"))?;

    // Error responses still carry a JSON body with a status and message.
    let status = response.status();
    let body = response
        .bytes()
        .await
        .with_context(|| format!("failed to read response body ({status})"))?;

    serde_json::from_slice(&body)
        .with_context(|| format!("backend returned {status} with a non-JSON body"))
}
