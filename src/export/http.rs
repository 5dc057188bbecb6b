//! HTTP event-collector sink
//!
//! POSTs `{"tenant", "merkle_root", "events": [...]}` to a collector
//! endpoint with a bearer token. Connection failures, timeouts, 5xx and 429
//! are reported as unavailable; any other non-success status rejects the
//! batch.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{events_merkle_root, AuditEvent, TenantId};
use crate::error::{AuditError, Result};
use crate::export::{batch_tenant, ExportAdapter, ExportReceipt};

#[derive(Serialize)]
struct ExportPayload<'a> {
    tenant: &'a TenantId,
    merkle_root: Option<String>,
    events: &'a [AuditEvent],
}

/// Optional acknowledgement body returned by the collector
#[derive(Debug, Deserialize)]
struct CollectorAck {
    receipt_id: Option<String>,
}

pub struct HttpSinkAdapter {
    endpoint: String,
    token: Option<String>,
    http_client: Client,
}

impl HttpSinkAdapter {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuditError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into(),
            token,
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_status(status: StatusCode, body: &str) -> AuditError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AuditError::ExportUnavailable(format!("collector returned {}: {}", status, body))
    } else {
        AuditError::ExportRejected(format!("collector returned {}: {}", status, body))
    }
}

#[async_trait]
impl ExportAdapter for HttpSinkAdapter {
    fn name(&self) -> &str {
        "http"
    }

    async fn export_batch(&self, events: &[AuditEvent]) -> Result<ExportReceipt> {
        let tenant = batch_tenant(events)?;
        let payload = ExportPayload {
            tenant,
            merkle_root: events_merkle_root(events),
            events,
        };

        debug!("Posting {} events to {}", events.len(), self.endpoint);
        let mut request = self.http_client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        // Any transport failure leaves the batch for the next sweep.
        let response = request.send().await.map_err(|e| {
            warn!("Collector {} unreachable: {}", self.endpoint, e);
            AuditError::ExportUnavailable(e.to_string())
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let receipt_id = serde_json::from_str::<CollectorAck>(&body)
            .ok()
            .and_then(|ack| ack.receipt_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let receipt = ExportReceipt::for_batch(self.name(), receipt_id, events)?;
        info!(
            tenant = %receipt.tenant,
            first_id = receipt.first_id,
            last_id = receipt.last_id,
            receipt_id = %receipt.receipt_id,
            "Exported audit batch to collector"
        );
        Ok(receipt)
    }
}
