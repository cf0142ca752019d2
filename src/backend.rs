//! Client for the platform's `/external/authorizations` API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{AccessAction, AccessEvent, ScanResult};

/// What the station needs from the platform backend.
#[async_trait]
pub trait AuthorizationBackend: Send + Sync {
    /// Online validation; the backend records the access itself.
    async fn validate(&self, qr: &str, action: AccessAction) -> Result<ScanResult>;

    /// Upload offline-validated events. Returns the ids the backend accepted.
    async fn push_events(&self, events: &[AccessEvent]) -> Result<Vec<Uuid>>;

    async fn fetch_revocations(&self) -> Result<Vec<i64>>;
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    qr: &'a str,
    action: AccessAction,
}

#[derive(Deserialize)]
struct ValidateResponse {
    result: ScanResult,
}

#[derive(Serialize)]
struct PushEventsRequest<'a> {
    events: &'a [AccessEvent],
}

#[derive(Deserialize)]
struct PushEventsResponse {
    acknowledged: Vec<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevocationsResponse {
    auth_ids: Vec<i64>,
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/external/authorizations/{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!(%status, "backend rejected request");
            return Err(Error::BackendStatus(status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl AuthorizationBackend for HttpBackend {
    #[instrument(skip(self, qr))]
    async fn validate(&self, qr: &str, action: AccessAction) -> Result<ScanResult> {
        let request = self
            .client
            .post(self.url("validate"))
            .json(&ValidateRequest { qr, action });
        let body: ValidateResponse = self.send(request).await?.json().await?;
        Ok(body.result)
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn push_events(&self, events: &[AccessEvent]) -> Result<Vec<Uuid>> {
        let request = self
            .client
            .post(self.url("access-events"))
            .json(&PushEventsRequest { events });
        let body: PushEventsResponse = self.send(request).await?.json().await?;
        Ok(body.acknowledged)
    }

    #[instrument(skip(self))]
    async fn fetch_revocations(&self) -> Result<Vec<i64>> {
        let request = self.client.get(self.url("revocations"));
        let body: RevocationsResponse = self.send(request).await?.json().await?;
        Ok(body.auth_ids)
    }
}
