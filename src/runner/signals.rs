//! Per-instance command and progress channels.
//!
//! A [`SignalChannel`] is owned by whoever wires a runner to its consumers
//! and is passed around by reference; there is no global registry. Commands
//! are request/response: every registered [`CommandHandler`] sees each
//! command and their replies are returned to the sender. Progress events fan
//! out to any number of subscribers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::state::WorkState;

/// Default progress channel capacity.
const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// The two channels of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ToolCommand,
    Progress,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolCommand => write!(f, "tool_command"),
            Self::Progress => write!(f, "progress"),
        }
    }
}

/// Commands understood by a tool runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCommand {
    Start,
    Cancel,
    GetResults,
}

/// Payload of the progress channel, also used for command replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Progress {
    State { state: WorkState, details: String },
    Results { results: Option<Vec<u8>> },
}

/// Receiver of commands sent on a [`SignalChannel`].
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one command, optionally replying to the sender.
    async fn handle(&self, command: ToolCommand) -> Option<Progress>;
}

/// Command and progress channels scoped to one instance id.
pub struct SignalChannel {
    instance_id: String,
    handlers: RwLock<Vec<Arc<dyn CommandHandler>>>,
    progress: broadcast::Sender<Progress>,
}

impl SignalChannel {
    pub fn new(instance_id: impl Into<String>) -> Arc<Self> {
        let (progress, _rx) = broadcast::channel(DEFAULT_PROGRESS_CAPACITY);
        Arc::new(Self {
            instance_id: instance_id.into(),
            handlers: RwLock::new(Vec::new()),
            progress,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Name of one of this instance's channels, e.g. `"test_progress"`.
    pub fn signal_id(&self, kind: SignalKind) -> String {
        format!("{}_{}", self.instance_id, kind)
    }

    pub async fn register(&self, handler: Arc<dyn CommandHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Deliver a command to every handler and collect their replies.
    pub async fn send_command(&self, command: ToolCommand) -> Vec<Progress> {
        let handlers = self.handlers.read().await.clone();
        debug!(
            signal = %self.signal_id(SignalKind::ToolCommand),
            ?command,
            handlers = handlers.len(),
            "Dispatching command"
        );

        let mut replies = Vec::new();
        for handler in handlers {
            if let Some(reply) = handler.handle(command).await {
                replies.push(reply);
            }
        }
        replies
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Publish a progress event. Returns the number of subscribers reached.
    pub fn publish(&self, progress: Progress) -> usize {
        self.progress.send(progress).unwrap_or(0)
    }

    /// Handle for publishing without holding the channel itself.
    pub fn publisher(&self) -> broadcast::Sender<Progress> {
        self.progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Echo {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, command: ToolCommand) -> Option<Progress> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match command {
                ToolCommand::GetResults => Some(Progress::Results {
                    results: Some(b"hostname: node1".to_vec()),
                }),
                _ => None,
            }
        }
    }

    #[test]
    fn signal_ids_are_scoped() {
        let channel = SignalChannel::new("test");
        assert_eq!(channel.signal_id(SignalKind::ToolCommand), "test_tool_command");
        assert_eq!(channel.signal_id(SignalKind::Progress), "test_progress");
    }

    #[tokio::test]
    async fn every_handler_sees_commands() {
        let channel = SignalChannel::new("test");
        let a = Arc::new(Echo {
            seen: AtomicUsize::new(0),
        });
        let b = Arc::new(Echo {
            seen: AtomicUsize::new(0),
        });
        channel.register(a.clone()).await;
        channel.register(b.clone()).await;

        assert!(channel.send_command(ToolCommand::Start).await.is_empty());
        let replies = channel.send_command(ToolCommand::GetResults).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(a.seen.load(Ordering::SeqCst), 2);
        assert_eq!(b.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn progress_fans_out() {
        let channel = SignalChannel::new("test");
        assert_eq!(
            channel.publish(Progress::Results { results: None }),
            0
        );

        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();
        let event = Progress::State {
            state: WorkState::Running,
            details: "running".into(),
        };
        assert_eq!(channel.publish(event.clone()), 2);
        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn wire_format() {
        assert_eq!(
            serde_json::to_value(ToolCommand::GetResults).unwrap(),
            serde_json::json!("GET_RESULTS")
        );
        let event = Progress::State {
            state: WorkState::Finished,
            details: "done".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"state": "finished", "details": "done"})
        );
    }
}
