//! The opaque agent executor (spec.md: "the core treats agent execution as
//! an opaque function `(RunSpec, input) -> Result | Error`"). The node lease
//! loop only needs a trait object it can invoke and cancel by dropping the
//! future at the deadline.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// One executed run's outcome, reported back via Complete.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOutput {
    pub result: BTreeMap<String, String>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub usd_cost: Option<f64>,
}

/// An executor-reported failure, reported back via Fail.
#[derive(Clone, Debug)]
pub struct ExecutionError {
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self { message: message.into(), details: None, retryable }
    }
}

/// Invokes an agent version against a run's input. Implementations are free
/// to shell out, call an in-process registry, or proxy to a remote runtime —
/// the lease loop only depends on this trait.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        agent_id: &str,
        version: &str,
        input: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

/// Classifies an arbitrary transport/IO error into the `retryable` hint
/// Complete/Fail expects (spec.md §4.6 error classification guidance):
/// timeouts, deadline-exceeded, deserialization and auth failures are
/// non-retryable; transient transport failures and unavailable backends are
/// retryable.
pub fn classify_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_decode() || err.is_builder() {
        return false;
    }
    if let Some(status) = err.status() {
        return match status.as_u16() {
            401 | 403 | 422 => false,
            503 | 502 | 504 | 429 => true,
            s if s >= 500 => true,
            _ => false,
        };
    }
    // Connect failures and unreadable bodies without a status code are
    // transient transport problems.
    err.is_connect() || err.is_request() || err.is_body()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(
            &self,
            _agent_id: &str,
            _version: &str,
            input: &BTreeMap<String, String>,
        ) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput { result: input.clone(), ..Default::default() })
        }
    }

    #[tokio::test]
    async fn echo_executor_returns_its_input() {
        let executor = EchoExecutor;
        let mut input = BTreeMap::new();
        input.insert("k".to_string(), "v".to_string());
        let out = executor.execute("a", "v1", &input).await.unwrap();
        assert_eq!(out.result.get("k"), Some(&"v".to_string()));
    }
}
