//! Readiness gating for freshly started nodes.
//!
//! [`ReadinessGate`] owns the timing (grace, interval, hard timeout) and the
//! cancellation race; a [`ReadinessProbe`] only answers "ready yet?" for one
//! node flavor. Errors returned by a probe are treated as transient and
//! remembered for the timeout report.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{TestnetError, TestnetResult};
use crate::ports::HostPorts;

/// Default sleep before the first check.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
/// Default delay between checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
/// Default hard timeout, grace included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-request timeout of the HTTP probes.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry-with-timeout poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessGate {
    /// Sleep before the first check.
    pub grace: Duration,
    /// Delay between checks.
    pub interval: Duration,
    /// Hard timeout measured from the start of the wait.
    pub timeout: Duration,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ReadinessGate {
    /// Gate that checks immediately, without a grace period.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            grace: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Set the grace period.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the hard timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll `check` until it reports ready.
    ///
    /// Each check runs after the grace period or the previous interval and is
    /// itself raced against the deadline and `cancel`, so a hanging check
    /// cannot outlive either.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::Cancelled`] when `cancel` fires and
    /// [`TestnetError::ReadinessTimeout`] when the deadline passes first.
    pub async fn wait_ready<F, Fut>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        mut check: F,
    ) -> TestnetResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TestnetResult<bool>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut last_error: Option<String> = None;
        let mut delay = self.grace;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let step = async {
                tokio::time::sleep(delay).await;
                check().await
            };

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(TestnetError::Cancelled(format!("waiting for {target} to become ready")));
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(TestnetError::ReadinessTimeout {
                        target: target.to_string(),
                        timeout: self.timeout,
                        last_error: last_error.unwrap_or_else(|| "none".to_string()),
                    });
                }
                outcome = step => outcome,
            };

            match outcome {
                Ok(true) => {
                    debug!(check = %target, attempt, "ready");
                    return Ok(());
                }
                Ok(false) => trace!(check = %target, attempt, "not ready yet"),
                Err(e) => {
                    trace!(check = %target, attempt, error = %e, "readiness check failed");
                    last_error = Some(e.to_string());
                }
            }
            delay = self.interval;
        }
    }
}

/// Boxed future returned by probes.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = TestnetResult<bool>> + Send + 'a>>;

/// One node flavor's answer to "is it ready?".
///
/// `Ok(false)` and `Err(_)` both mean "not yet"; errors are kept for the
/// timeout report.
pub trait ReadinessProbe: Send + Sync + fmt::Debug {
    /// Check readiness against the node's resolved host ports.
    fn check<'a>(&'a self, ports: &'a HostPorts) -> ProbeFuture<'a>;
}

fn probe_error(probe: impl fmt::Display, err: impl fmt::Display) -> TestnetError {
    TestnetError::ProbeFailed {
        probe: probe.to_string(),
        reason: err.to_string(),
    }
}

/// Ready when `GET http://<port><path>` returns 2xx.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    port: String,
    path: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Probe `path` on the named port.
    #[must_use]
    pub fn new(port: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            path: path.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl ReadinessProbe for HttpHealthProbe {
    fn check<'a>(&'a self, ports: &'a HostPorts) -> ProbeFuture<'a> {
        Box::pin(async move {
            let url = format!("http://{}{}", ports.require(&self.port)?, self.path);
            match self
                .client
                .get(&url)
                .timeout(PROBE_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => Ok(response.status().is_success()),
                // Nothing listening yet
                Err(e) if e.is_connect() => Ok(false),
                Err(e) => Err(probe_error(&url, e)),
            }
        })
    }
}

/// Ready when a Tendermint-style `/status` reports the node is not catching up.
#[derive(Debug, Clone)]
pub struct RpcStatusProbe {
    port: String,
    client: reqwest::Client,
}

impl RpcStatusProbe {
    /// Probe the RPC server on the named port.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl ReadinessProbe for RpcStatusProbe {
    fn check<'a>(&'a self, ports: &'a HostPorts) -> ProbeFuture<'a> {
        Box::pin(async move {
            let url = format!("http://{}/status", ports.require(&self.port)?);
            let response = match self
                .client
                .get(&url)
                .timeout(PROBE_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_connect() => return Ok(false),
                Err(e) => return Err(probe_error(&url, e)),
            };
            if !response.status().is_success() {
                return Ok(false);
            }

            let body: Value = response.json().await.map_err(|e| probe_error(&url, e))?;
            let catching_up = body
                .pointer("/result/sync_info/catching_up")
                .and_then(Value::as_bool)
                .ok_or_else(|| probe_error(&url, "response has no sync_info.catching_up"))?;
            Ok(!catching_up)
        })
    }
}

/// Ready when a JSON-RPC call succeeds.
#[derive(Debug, Clone)]
pub struct RpcCallProbe {
    port: String,
    method: String,
    params: Value,
    client: reqwest::Client,
}

impl RpcCallProbe {
    /// Call `method` without parameters on the named port.
    #[must_use]
    pub fn new(port: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            method: method.into(),
            params: json!([]),
            client: reqwest::Client::new(),
        }
    }

    /// Set call parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

impl ReadinessProbe for RpcCallProbe {
    fn check<'a>(&'a self, ports: &'a HostPorts) -> ProbeFuture<'a> {
        Box::pin(async move {
            let url = format!("http://{}", ports.require(&self.port)?);
            let request = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": self.method,
                "params": self.params,
            });

            let response = match self
                .client
                .post(&url)
                .json(&request)
                .timeout(PROBE_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_connect() => return Ok(false),
                Err(e) => return Err(probe_error(&url, e)),
            };

            let body: Value = response.json().await.map_err(|e| probe_error(&url, e))?;
            if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
                return Err(probe_error(format!("{} {}", url, self.method), error));
            }
            Ok(body.get("result").is_some())
        })
    }
}

/// Ready when a TCP connection to the named port succeeds.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: String,
}

impl TcpProbe {
    /// Probe the named port.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self { port: port.into() }
    }
}

impl ReadinessProbe for TcpProbe {
    fn check<'a>(&'a self, ports: &'a HostPorts) -> ProbeFuture<'a> {
        Box::pin(async move {
            let addr = ports.socket_addr(&self.port)?;
            Ok(tokio::net::TcpStream::connect(addr).await.is_ok())
        })
    }
}
