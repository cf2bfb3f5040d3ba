//! Central store reached over HTTP.
//!
//! `POST {endpoint}/api/v1/sync/sales` with `{ "outlet_id", "records" }`,
//! answered by `{ "results": [{ "id", "status", "reason"? }] }`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::CentralConfig,
    error::SyncError,
    sale::SaleRecord,
};

use super::central::{CentralSale, CentralStore, TransferError, UpsertAck};

const SALES_PATH: &str = "/api/v1/sync/sales";

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    outlet_id: &'a str,
    records: Vec<CentralSale>,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    results: Vec<UpsertAck>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error", alias = "message")]
    reason: String,
}

pub struct HttpCentralStore {
    client: Client,
    url: String,
    api_token: Option<String>,
}

impl HttpCentralStore {
    /// Builds a client for `config.endpoint`; `request_timeout` bounds each call.
    pub fn new(config: &CentralConfig, request_timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        let url = format!("{}{SALES_PATH}", config.endpoint.trim_end_matches('/'));
        info!(url = %url, "central store client ready");
        Ok(Self {
            client,
            url,
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl CentralStore for HttpCentralStore {
    async fn upsert_batch(
        &self,
        outlet_id: &str,
        records: &[SaleRecord],
    ) -> Result<Vec<UpsertAck>, TransferError> {
        let body = UpsertRequest {
            outlet_id,
            records: records.iter().map(CentralSale::from).collect(),
        };
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(classify_send_error)?;
        let status = resp.status();
        debug!(outlet_id, %status, records = records.len(), "central upsert answered");

        if let Some(err) = classify_status(status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(with_reason(err, &text));
        }

        let parsed: UpsertResponse = resp
            .json()
            .await
            .map_err(|e| TransferError::Transient(format!("unreadable central response: {e}")))?;
        Ok(parsed.results)
    }
}

/// Maps a non-success status to its failure class; `None` for 2xx.
pub fn classify_status(status: StatusCode) -> Option<TransferError> {
    if status.is_success() {
        return None;
    }
    let label = status.to_string();
    // Credential failures say nothing about the records themselves.
    let transient = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || !status.is_client_error();
    Some(if transient {
        TransferError::Transient(label)
    } else {
        TransferError::Permanent(label)
    })
}

fn classify_send_error(err: reqwest::Error) -> TransferError {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else {
        "request"
    };
    TransferError::Transient(format!("{kind}: {err}"))
}

fn with_reason(err: TransferError, body: &str) -> TransferError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.reason)
        .unwrap_or_else(|_| body.trim().chars().take(200).collect());
    if detail.is_empty() {
        return err;
    }
    match err {
        TransferError::Transient(s) => TransferError::Transient(format!("{s}: {detail}")),
        TransferError::Permanent(s) => TransferError::Permanent(format!("{s}: {detail}")),
    }
}
