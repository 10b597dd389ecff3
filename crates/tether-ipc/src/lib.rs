//! In-process model of the boundary between the privileged host and the
//! restricted renderer.
//!
//! `IpcMain` is the privileged side: async invoke handlers keyed by channel and
//! one-shot message listeners. `RendererSink` carries privileged → restricted
//! notifications.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub type IpcArgs = Vec<Value>;

type InvokeHandler = Arc<dyn Fn(IpcArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("no handler registered for channel '{0}'")]
    NoHandler(String),
    #[error("channel '{channel}' failed: {source:#}")]
    Handler {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
}

impl IpcError {
    /// Returns the handler error for `Handler` failures.
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Handler { source, .. } => Some(source),
            Self::NoHandler(_) => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Privileged side of the boundary.
#[derive(Default)]
pub struct IpcMain {
    handlers: Mutex<HashMap<String, InvokeHandler>>,
    listeners: Mutex<HashMap<String, VecDeque<oneshot::Sender<IpcArgs>>>>,
}

impl IpcMain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `channel`, replacing any existing handler.
    /// Returns true when a previous handler was replaced.
    pub fn handle<F, Fut>(&self, channel: impl Into<String>, handler: F) -> bool
    where
        F: Fn(IpcArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let channel = channel.into();
        let handler: InvokeHandler = Arc::new(move |args| handler(args).boxed());
        let replaced = lock(&self.handlers).insert(channel.clone(), handler).is_some();
        if replaced {
            tracing::debug!(channel = %channel, "replaced ipc handler");
        }
        replaced
    }

    pub fn remove_handler(&self, channel: &str) -> bool {
        lock(&self.handlers).remove(channel).is_some()
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        lock(&self.handlers).contains_key(channel)
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Invokes the handler registered for `channel`.
    pub async fn invoke(&self, channel: &str, args: IpcArgs) -> Result<Value, IpcError> {
        let handler = lock(&self.handlers)
            .get(channel)
            .cloned()
            .ok_or_else(|| IpcError::NoHandler(channel.to_string()))?;
        handler(args).await.map_err(|source| IpcError::Handler {
            channel: channel.to_string(),
            source,
        })
    }

    /// Registers a one-shot listener for messages sent on `channel`.
    pub fn once(&self, channel: impl Into<String>) -> OnceListener {
        let channel = channel.into();
        let (sender, receiver) = oneshot::channel();
        lock(&self.listeners)
            .entry(channel.clone())
            .or_default()
            .push_back(sender);
        OnceListener { channel, receiver }
    }

    /// Delivers a restricted → privileged message to the oldest pending
    /// listener on `channel`. Returns false when no listener consumed it.
    pub fn emit(&self, channel: &str, args: IpcArgs) -> bool {
        let mut listeners = lock(&self.listeners);
        let Some(queue) = listeners.get_mut(channel) else {
            tracing::debug!(channel, "dropped ipc message without listener");
            return false;
        };
        let mut pending = Some(args);
        while let Some(sender) = queue.pop_front() {
            match sender.send(pending.take().unwrap_or_default()) {
                Ok(()) => break,
                Err(returned) => pending = Some(returned),
            }
        }
        if queue.is_empty() {
            listeners.remove(channel);
        }
        pending.is_none()
    }

    /// Tears down every pending listener on `channel`.
    pub fn remove_listeners(&self, channel: &str) -> usize {
        lock(&self.listeners)
            .remove(channel)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        lock(&self.listeners)
            .get(channel)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// Pending one-shot listener returned by [`IpcMain::once`].
#[derive(Debug)]
pub struct OnceListener {
    channel: String,
    receiver: oneshot::Receiver<IpcArgs>,
}

impl OnceListener {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Resolves with the message payload, or `None` once the listener was torn down.
    pub async fn recv(self) -> Option<IpcArgs> {
        self.receiver.await.ok()
    }
}

/// Notification sink towards the restricted renderer.
pub trait RendererSink: Send + Sync {
    fn send(&self, channel: &str, args: IpcArgs);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererMessage {
    pub channel: String,
    pub args: IpcArgs,
}

/// Renderer sink backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelRenderer {
    sender: mpsc::UnboundedSender<RendererMessage>,
}

impl ChannelRenderer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RendererMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl RendererSink for ChannelRenderer {
    fn send(&self, channel: &str, args: IpcArgs) {
        let message = RendererMessage {
            channel: channel.to_string(),
            args,
        };
        if self.sender.send(message).is_err() {
            tracing::warn!(channel, "renderer is gone; notification dropped");
        }
    }
}
