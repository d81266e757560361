//! Resiliency runner: wraps backend calls with a timeout/retry policy.
//!
//! The publish adapter never loops on its own. Every backend call goes
//! through [`ResiliencyRunner::run`] with a [`PolicyKey`] naming the
//! component and the operation class, and whatever comes out is final.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TimeoutElapsed, Transient};

/// Class of operation a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// Publishing to the backend component.
    PubsubOutbound,
    /// Delivering a backend message to the app.
    PubsubInbound,
}

/// Identifies the policy for one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub component: String,
    pub class: OperationClass,
}

impl PolicyKey {
    pub fn outbound(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            class: OperationClass::PubsubOutbound,
        }
    }

    pub fn inbound(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            class: OperationClass::PubsubInbound,
        }
    }
}

/// Runs a unit of work under the policy registered for a key.
///
/// `op` is invoked once per attempt. Errors must be convertible from
/// [`TimeoutElapsed`] so a timed-out attempt can be reported, and say
/// whether they are [`Transient`]; only transient errors are retried.
pub trait ResiliencyRunner: Send + Sync {
    fn run<T, E, F, Fut>(&self, key: &PolicyKey, op: F) -> impl Future<Output = Result<T, E>> + Send
    where
        T: Send,
        E: From<TimeoutElapsed> + Transient + std::fmt::Display + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send;
}

/// Runs every operation exactly once, with no timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunner;

impl ResiliencyRunner for NoopRunner {
    fn run<T, E, F, Fut>(&self, _key: &PolicyKey, mut op: F) -> impl Future<Output = Result<T, E>> + Send
    where
        T: Send,
        E: From<TimeoutElapsed> + Transient + std::fmt::Display + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        async move { op().await }
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) scaled down by a
    /// random factor in `[0.5, 1.0]`, so concurrent retries spread out.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_for_attempt(attempt).as_millis() as u64;
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(100, 5_000)
    }
}

/// Declarative policy, as found in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Per-attempt timeout. `None` = no timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl PolicyConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_delay_ms, self.max_delay_ms)
    }
}

/// Per-component policy overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPolicies {
    #[serde(default)]
    pub outbound: Option<PolicyConfig>,
    #[serde(default)]
    pub inbound: Option<PolicyConfig>,
}

/// Resiliency section of the sidecar configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResiliencyConfig {
    /// Applied when a component has no override for the operation class.
    #[serde(default)]
    pub default: PolicyConfig,
    #[serde(default)]
    pub components: HashMap<String, ComponentPolicies>,
}

impl ResiliencyConfig {
    pub fn policy_for(&self, key: &PolicyKey) -> PolicyConfig {
        self.components
            .get(&key.component)
            .and_then(|p| match key.class {
                OperationClass::PubsubOutbound => p.outbound,
                OperationClass::PubsubInbound => p.inbound,
            })
            .unwrap_or(self.default)
    }
}

/// Timeout + bounded retry runner driven by [`ResiliencyConfig`].
#[derive(Debug, Clone, Default)]
pub struct PolicyRunner {
    config: ResiliencyConfig,
}

impl PolicyRunner {
    pub fn new(config: ResiliencyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResiliencyConfig {
        &self.config
    }
}

impl ResiliencyRunner for PolicyRunner {
    fn run<T, E, F, Fut>(&self, key: &PolicyKey, mut op: F) -> impl Future<Output = Result<T, E>> + Send
    where
        T: Send,
        E: From<TimeoutElapsed> + Transient + std::fmt::Display + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let policy = self.config.policy_for(key);
        async move {
            let timeout = policy.timeout();
            let retry = policy.retry();
            let mut attempt = 0u32;
            loop {
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, op()).await {
                        Ok(result) => result,
                        Err(_) => Err(E::from(TimeoutElapsed(limit))),
                    },
                    None => op().await,
                };

                match result {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_transient() && attempt < policy.max_retries => {
                        let delay = retry.jittered_delay(attempt);
                        debug!(
                            component = %key.component,
                            class = ?key.class,
                            attempt = attempt + 1,
                            error = %err,
                            "attempt failed; retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}
