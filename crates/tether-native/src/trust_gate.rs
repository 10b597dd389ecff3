//! Consent gate for opaque native payloads.
//!
//! A payload is identified by the SHA-256 of its text. Unknown hashes are
//! shown to the user through the renderer (`requestTrust`) and the gate waits
//! on a one-shot `trustResponse:<hash>:<timestamp>` listener, failing closed
//! when the decision does not arrive in time.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_core::current_unix_timestamp_ms;
use tether_ipc::{IpcMain, RendererSink};
use thiserror::Error;

use crate::channels::{request_trust_channel, trust_response_channel};
use crate::config::{HOST_NAMESPACE_DEFAULT, TRUST_TIMEOUT_MS_DEFAULT};
use crate::require_shim::NativeRuntime;
use crate::trust_store::{content_hash, TrustStore};

pub const DEFAULT_PLUGIN_LABEL: &str = "Unknown Plugin";
const ORIGIN_HASH_PREFIX_LEN: usize = 8;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// User response codes carried on the trust response channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustDecision {
    Block,
    AllowOnce,
    AllowAlways,
}

impl TrustDecision {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Block),
            1 => Some(Self::AllowOnce),
            2 => Some(Self::AllowAlways),
            _ => None,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Block => 0,
            Self::AllowOnce => 1,
            Self::AllowAlways => 2,
        }
    }

    /// Reads the first response argument. Anything unrecognised blocks.
    pub fn from_response(args: &[Value]) -> Self {
        args.first()
            .and_then(Value::as_u64)
            .and_then(Self::from_code)
            .unwrap_or(Self::Block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPhase {
    HashComputed,
    Trusted,
    AwaitingDecision,
    Approved,
    Rejected,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UserBlocked,
    TimedOut,
    BlockedThisSession,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UserBlocked => "user blocked execution",
            Self::TimedOut => "no trust decision before the timeout",
            Self::BlockedThisSession => "already blocked this session",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    Trusted,
    AllowedOnce,
    AllowedAlways,
    Rejected(RejectReason),
}

impl TrustVerdict {
    pub fn is_approved(self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("execution of native code from {plugin} was blocked: {reason}")]
    Blocked { plugin: String, reason: RejectReason },
    #[error("native code from {plugin} failed: {source:#}")]
    Execution {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },
}

type PendingDecision = Shared<BoxFuture<'static, TrustVerdict>>;

struct GateShared {
    namespace: String,
    timeout: Duration,
    ipc: Arc<IpcMain>,
    renderer: Arc<dyn RendererSink>,
    runtime: NativeRuntime,
    store: Mutex<TrustStore>,
    pending: Mutex<HashMap<String, PendingDecision>>,
    session_blocked: Mutex<HashSet<String>>,
}

/// Cloneable handle to the trust gate state.
#[derive(Clone)]
pub struct TrustGate {
    shared: Arc<GateShared>,
}

impl fmt::Debug for TrustGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustGate")
            .field("namespace", &self.shared.namespace)
            .field("timeout", &self.shared.timeout)
            .finish_non_exhaustive()
    }
}

impl TrustGate {
    pub fn new(
        store: TrustStore,
        ipc: Arc<IpcMain>,
        renderer: Arc<dyn RendererSink>,
        runtime: NativeRuntime,
    ) -> Self {
        Self {
            shared: Arc::new(GateShared {
                namespace: HOST_NAMESPACE_DEFAULT.to_string(),
                timeout: Duration::from_millis(TRUST_TIMEOUT_MS_DEFAULT),
                ipc,
                renderer,
                runtime,
                store: Mutex::new(store),
                pending: Mutex::new(HashMap::new()),
                session_blocked: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Overrides namespace and timeout. Must be called before the gate is shared.
    pub fn configured(self, namespace: impl Into<String>, timeout: Duration) -> Self {
        let shared = match Arc::try_unwrap(self.shared) {
            Ok(shared) => shared,
            Err(shared) => {
                tracing::warn!("trust gate already shared; configuration ignored");
                return Self { shared };
            }
        };
        Self {
            shared: Arc::new(GateShared {
                namespace: namespace.into(),
                timeout,
                ..shared
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn is_trusted(&self, hash: &str) -> bool {
        lock(&self.shared.store).contains(hash)
    }

    pub fn trusted_hashes(&self) -> Vec<String> {
        lock(&self.shared.store).hashes().map(str::to_string).collect()
    }

    /// Runs the consent protocol for `code` without executing it.
    pub async fn authorize(&self, code: &str, plugin: &str) -> TrustVerdict {
        let hash = content_hash(code);
        tracing::debug!(hash = %hash, plugin, phase = ?TrustPhase::HashComputed, "trust gate");

        if self.is_trusted(&hash) {
            tracing::debug!(hash = %hash, plugin, phase = ?TrustPhase::Trusted, "trust gate");
            return TrustVerdict::Trusted;
        }
        if lock(&self.shared.session_blocked).contains(&hash) {
            tracing::debug!(hash = %hash, plugin, phase = ?TrustPhase::Rejected, "hash blocked earlier this session");
            return TrustVerdict::Rejected(RejectReason::BlockedThisSession);
        }

        let decision = {
            let mut pending = lock(&self.shared.pending);
            match pending.get(&hash) {
                Some(existing) => {
                    tracing::debug!(hash = %hash, plugin, "joining pending trust decision");
                    existing.clone()
                }
                None => {
                    // The prompt runs on its own task so the decision is applied
                    // and cleaned up even if every caller stops waiting.
                    let task = tokio::spawn(request_decision(
                        Arc::clone(&self.shared),
                        hash.clone(),
                        plugin.to_string(),
                    ));
                    let decision = async move {
                        task.await.unwrap_or_else(|error| {
                            tracing::error!(error = %error, "trust decision task failed; blocking");
                            TrustVerdict::Rejected(RejectReason::UserBlocked)
                        })
                    }
                    .boxed()
                    .shared();
                    pending.insert(hash, decision.clone());
                    decision
                }
            }
        };
        decision.await
    }

    /// Authorizes `code` and, when approved, executes it through the native
    /// runtime. An empty label falls back to [`DEFAULT_PLUGIN_LABEL`].
    pub async fn register_native(&self, code: &str, plugin: &str) -> Result<(), TrustError> {
        let plugin = if plugin.trim().is_empty() {
            DEFAULT_PLUGIN_LABEL
        } else {
            plugin
        };

        let verdict = self.authorize(code, plugin).await;
        let TrustVerdict::Rejected(reason) = verdict else {
            return self.execute(code, plugin).await;
        };
        tracing::debug!(plugin, phase = ?TrustPhase::Terminal, reason = %reason, "native code not executed");
        Err(TrustError::Blocked {
            plugin: plugin.to_string(),
            reason,
        })
    }

    async fn execute(&self, code: &str, plugin: &str) -> Result<(), TrustError> {
        let hash = content_hash(code);
        let origin = format!(
            "native:{}:{}",
            &hash[..ORIGIN_HASH_PREFIX_LEN],
            current_unix_timestamp_ms()
        );
        let result = self
            .shared
            .runtime
            .execute(code.to_string(), origin)
            .await;
        tracing::debug!(plugin, hash = %hash, phase = ?TrustPhase::Terminal, ok = result.is_ok(), "native code executed");
        result.map(|_| ()).map_err(|source| {
            tracing::error!(plugin, error = %format!("{source:#}"), "failed to execute native code");
            TrustError::Execution {
                plugin: plugin.to_string(),
                source,
            }
        })
    }
}

async fn request_decision(shared: Arc<GateShared>, hash: String, plugin: String) -> TrustVerdict {
    let timestamp = current_unix_timestamp_ms();
    let response_channel = trust_response_channel(&shared.namespace, &hash, timestamp);

    let listener = shared.ipc.once(response_channel.clone());
    shared.renderer.send(
        &request_trust_channel(&shared.namespace),
        vec![json!(plugin), json!(hash), json!(timestamp)],
    );
    tracing::debug!(hash = %hash, plugin = %plugin, phase = ?TrustPhase::AwaitingDecision, "requested trust decision");

    let verdict = match tokio::time::timeout(shared.timeout, listener.recv()).await {
        Ok(Some(args)) => apply_decision(&shared, &hash, &plugin, TrustDecision::from_response(&args)),
        Ok(None) => {
            tracing::warn!(hash = %hash, plugin = %plugin, "trust response listener torn down; blocking");
            TrustVerdict::Rejected(RejectReason::UserBlocked)
        }
        Err(_) => {
            shared.ipc.remove_listeners(&response_channel);
            lock(&shared.session_blocked).insert(hash.clone());
            tracing::warn!(
                hash = %hash,
                plugin = %plugin,
                timeout_ms = shared.timeout.as_millis() as u64,
                "no trust decision before the timeout; blocking"
            );
            TrustVerdict::Rejected(RejectReason::TimedOut)
        }
    };

    lock(&shared.pending).remove(&hash);
    verdict
}

fn apply_decision(
    shared: &GateShared,
    hash: &str,
    plugin: &str,
    decision: TrustDecision,
) -> TrustVerdict {
    match decision {
        TrustDecision::Block => {
            lock(&shared.session_blocked).insert(hash.to_string());
            tracing::debug!(hash, plugin, phase = ?TrustPhase::Rejected, "user blocked native code");
            TrustVerdict::Rejected(RejectReason::UserBlocked)
        }
        TrustDecision::AllowOnce => {
            tracing::debug!(hash, plugin, phase = ?TrustPhase::Approved, "native code allowed once");
            TrustVerdict::AllowedOnce
        }
        TrustDecision::AllowAlways => {
            if let Err(error) = lock(&shared.store).insert(hash) {
                tracing::error!(
                    hash,
                    plugin,
                    error = %format!("{error:#}"),
                    "failed to persist trusted hash"
                );
            }
            tracing::debug!(hash, plugin, phase = ?TrustPhase::Approved, "native code always allowed");
            TrustVerdict::AllowedAlways
        }
    }
}
