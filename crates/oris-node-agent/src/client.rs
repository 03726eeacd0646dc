//! Thin `reqwest` wrapper around the control plane's C5 lease stream
//! surface: `/pull` (NDJSON chunked body), `/ack`, `/complete`, `/fail`.
//! DTOs mirror `oris-execution-server::wire` field-for-field since both
//! sides serialize with `serde` defaults (snake_case).

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize)]
pub struct TimingsWire {
    pub duration_ms: Option<u64>,
    pub queue_ms: Option<u64>,
    pub execution_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CostsWire {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub usd_cost: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RunSpecWire {
    pub agent_id: String,
    pub version: String,
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub input_ref: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub budgets: BudgetsWire,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BudgetsWire {
    pub max_tokens: Option<u64>,
    pub max_duration_seconds: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LeaseWire {
    pub lease_id: String,
    pub run_id: String,
    pub run_spec: RunSpecWire,
    pub deadline_unix_ms: i64,
    pub trace_id: Option<String>,
}

/// One NDJSON line off the Pull stream: either a freshly assignable lease,
/// or notice that a run already streamed here has been cancelled and the
/// executor should be preempted (mirrors `oris_execution_server::wire::StreamFrame`).
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum PullFrame {
    Lease(LeaseWire),
    Cancel { run_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed NDJSON frame: {0}")]
    Decode(#[from] serde_json::Error),
}

/// HTTP client bound to one control-plane base URL, shared across the pull
/// loop and every spawned processing task.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: Client,
    base_url: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client with default TLS config");
        Self { http, base_url: base_url.into() }
    }

    /// Opens the Pull stream and returns a lease-by-lease async iterator.
    /// The caller drives reconnects; this call fails fast if the initial
    /// connection cannot be established.
    pub async fn pull_stream(
        &self,
        node_id: &str,
        max_leases: usize,
    ) -> Result<impl futures_util::Stream<Item = Result<PullFrame, ClientError>>, ClientError> {
        let response = self
            .http
            .get(format!("{}/pull", self.base_url))
            .query(&[("node_id", node_id), ("max_leases", &max_leases.to_string())])
            .send()
            .await?
            .error_for_status()?;

        let mut buf = Vec::new();
        let mut bytes = response.bytes_stream();
        Ok(async_stream::stream! {
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ClientError::Transport(e));
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<PullFrame>(line) {
                        Ok(frame) => yield Ok(frame),
                        Err(e) => yield Err(ClientError::Decode(e)),
                    }
                }
            }
        })
    }

    pub async fn ack(&self, lease_id: &str, node_id: &str, timestamp_ms: i64) {
        #[derive(Serialize)]
        struct AckRequest<'a> {
            lease_id: &'a str,
            node_id: &'a str,
            timestamp_ms: i64,
        }
        let result = self
            .http
            .post(format!("{}/ack", self.base_url))
            .json(&AckRequest { lease_id, node_id, timestamp_ms })
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(lease_id, node_id, error = %e, "ack delivery failed (best-effort)");
        }
    }

    pub async fn complete(
        &self,
        lease_id: &str,
        run_id: &str,
        node_id: &str,
        result: BTreeMap<String, String>,
        timings: TimingsWire,
        costs: CostsWire,
    ) -> Result<bool, ClientError> {
        #[derive(Serialize)]
        struct CompleteRequest<'a> {
            lease_id: &'a str,
            run_id: &'a str,
            node_id: &'a str,
            result: BTreeMap<String, String>,
            timings: TimingsWire,
            costs: CostsWire,
        }
        #[derive(Deserialize)]
        struct CompleteResponse {
            success: bool,
            #[allow(dead_code)]
            message: Option<String>,
        }
        let resp: CompleteResponse = self
            .http
            .post(format!("{}/complete", self.base_url))
            .json(&CompleteRequest { lease_id, run_id, node_id, result, timings, costs })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.success)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn fail(
        &self,
        lease_id: &str,
        run_id: &str,
        node_id: &str,
        error_message: &str,
        error_details: Option<serde_json::Value>,
        timings: TimingsWire,
        retryable: bool,
    ) -> Result<bool, ClientError> {
        #[derive(Serialize)]
        struct FailRequest<'a> {
            lease_id: &'a str,
            run_id: &'a str,
            node_id: &'a str,
            error_message: &'a str,
            error_details: Option<serde_json::Value>,
            timings: TimingsWire,
            retryable: bool,
        }
        #[derive(Deserialize)]
        struct FailResponse {
            success: bool,
            #[allow(dead_code)]
            should_retry: bool,
        }
        let resp: FailResponse = self
            .http
            .post(format!("{}/fail", self.base_url))
            .json(&FailRequest { lease_id, run_id, node_id, error_message, error_details, timings, retryable })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_plane_client_stores_base_url_verbatim() {
        let client = ControlPlaneClient::new("http://127.0.0.1:8080");
        assert_eq!(client.base_url, "http://127.0.0.1:8080");
    }
}
