// Live-streaming tool lifecycle
//
// A streaming tool runs as a background task fed by a live input
// channel and pushes intermediate results into the invocation's live
// request queue. Registration into the per-invocation registry is lazy
// (first invocation only), with a fresh input channel allocated on
// every (re)invocation. The reserved `stop_streaming(function_name)`
// control call cancels the task with a bounded wait; registry
// mutations are serialized by one async lock per invocation because
// start/stop control calls can arrive concurrently from the model.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::event::{Event, Part};

/// Reserved control call cancelling a named streaming tool.
pub const STOP_STREAMING_CALL_NAME: &str = "stop_streaming";

/// How long `stop_streaming` waits for the cancelled task to finish.
pub const STOP_STREAMING_TIMEOUT: Duration = Duration::from_secs(1);

/// Sender half of a streaming tool's live input channel.
pub type LiveInputSender = mpsc::UnboundedSender<Value>;
/// Receiver half, handed to the tool's `stream` entry point.
pub type LiveInputReceiver = mpsc::UnboundedReceiver<Value>;

/// Queue carrying content produced outside the normal turn flow (e.g.
/// streaming tool results) back to the model.
#[derive(Debug, Clone)]
pub struct LiveRequestQueue {
    tx: mpsc::UnboundedSender<Vec<Part>>,
}

impl LiveRequestQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<Part>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_content(&self, parts: Vec<Part>) {
        // Receiver dropped means the live connection closed; results
        // are discarded.
        let _ = self.tx.send(parts);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send_content(vec![Part::Text { text: text.into() }]);
    }
}

/// A streaming tool's background task plus the sender side of its live
/// input channel. The task slot is cleared when the tool is stopped;
/// the entry is kept so the tool can be re-invoked.
#[derive(Debug)]
pub struct ActiveStreamingTool {
    pub task: Option<JoinHandle<()>>,
    pub input: LiveInputSender,
}

/// Outcome of a `stop_streaming` control call, reported as a status
/// value rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    /// The task did not finish within the bounded wait.
    NotYetCancelled,
    NotFound,
}

impl StopStatus {
    pub fn message(&self, function_name: &str) -> String {
        match self {
            StopStatus::Stopped => {
                format!("Successfully stopped streaming function {function_name}")
            }
            StopStatus::NotYetCancelled => {
                format!("The task is not cancelled yet for {function_name}.")
            }
            StopStatus::NotFound => {
                format!("No active streaming function named {function_name} found")
            }
        }
    }
}

/// Per-invocation registry of active streaming tools, keyed by tool
/// name.
#[derive(Debug, Default)]
pub struct StreamingRegistry {
    inner: Mutex<HashMap<String, ActiveStreamingTool>>,
}

impl StreamingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a (re)invoked streaming tool, replacing any previous
    /// task and input channel under the same name.
    pub async fn register(&self, name: &str, task: JoinHandle<()>, input: LiveInputSender) {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.insert(
            name.to_string(),
            ActiveStreamingTool {
                task: Some(task),
                input,
            },
        ) {
            if let Some(previous) = existing.task {
                previous.abort();
            }
        }
    }

    pub async fn is_active(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .get(name)
            .and_then(|t| t.task.as_ref())
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Sends live input to a running streaming tool. Returns false when
    /// no such tool is active.
    pub async fn send_input(&self, name: &str, value: Value) -> bool {
        let inner = self.inner.lock().await;
        match inner.get(name) {
            Some(tool) => tool.input.send(value).is_ok(),
            None => false,
        }
    }

    /// Cancels the named background task and awaits cancellation with a
    /// bounded timeout. On success the task reference is cleared but
    /// the entry is kept, so the tool can be re-invoked.
    pub async fn stop(&self, name: &str) -> StopStatus {
        let task = {
            let mut inner = self.inner.lock().await;
            match inner.get_mut(name) {
                Some(active) => match active.task.take() {
                    Some(task) if !task.is_finished() => Some(task),
                    Some(_) | None => None,
                },
                None => return StopStatus::NotFound,
            }
        };

        let Some(task) = task else {
            return StopStatus::NotFound;
        };

        task.abort();
        match tokio::time::timeout(STOP_STREAMING_TIMEOUT, task).await {
            Ok(_) => {
                info!(function_name = %name, "streaming task cancelled");
                StopStatus::Stopped
            }
            Err(_) => {
                warn!(function_name = %name, "streaming task still running after cancellation timeout");
                StopStatus::NotYetCancelled
            }
        }
    }
}

/// Buffers events while an input transcription is mid-flight.
///
/// Events produced in the interim (including function call/response
/// pairs) would corrupt turn ordering for the client if emitted before
/// the transcription completes, so they are held and flushed in
/// original order on completion.
#[derive(Debug, Default)]
pub struct TranscriptionBuffer {
    input_open: bool,
    pending: Vec<Event>,
}

impl TranscriptionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an input transcription as in-flight.
    pub fn begin_input(&mut self) {
        self.input_open = true;
    }

    /// Offers an event for emission. Returns the events that may be
    /// emitted now (the event itself when nothing is buffering).
    pub fn push(&mut self, event: Event) -> Vec<Event> {
        if self.input_open {
            self.pending.push(event);
            Vec::new()
        } else {
            vec![event]
        }
    }

    /// Completes the in-flight transcription and flushes every buffered
    /// event in original order.
    pub fn finish_input(&mut self) -> Vec<Event> {
        self.input_open = false;
        std::mem::take(&mut self.pending)
    }

    pub fn is_buffering(&self) -> bool {
        self.input_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stop_unknown_tool_reports_not_found() {
        let registry = StreamingRegistry::new();
        assert_eq!(registry.stop("monitor").await, StopStatus::NotFound);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_task_and_keeps_entry() {
        let registry = StreamingRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        registry.register("monitor", task, tx).await;
        assert!(registry.is_active("monitor").await);

        assert_eq!(registry.stop("monitor").await, StopStatus::Stopped);
        assert!(!registry.is_active("monitor").await);
        // Entry kept: stopping again finds the entry but no task.
        assert_eq!(registry.stop("monitor").await, StopStatus::NotFound);
    }

    #[tokio::test]
    async fn test_send_input_reaches_task_channel() {
        let registry = StreamingRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async {});
        registry.register("monitor", task, tx).await;

        assert!(registry.send_input("monitor", json!({"frame": 1})).await);
        assert_eq!(rx.recv().await.unwrap(), json!({"frame": 1}));
        assert!(!registry.send_input("other", json!(2)).await);
    }

    #[test]
    fn test_transcription_buffer_holds_and_flushes_in_order() {
        let mut buffer = TranscriptionBuffer::new();
        let passthrough = buffer.push(Event::new("inv1", "model"));
        assert_eq!(passthrough.len(), 1);

        buffer.begin_input();
        let first = Event::new("inv1", "model");
        let second = Event::new("inv1", "user");
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        assert!(buffer.push(first).is_empty());
        assert!(buffer.push(second).is_empty());
        assert!(buffer.is_buffering());

        let flushed = buffer.finish_input();
        assert_eq!(
            flushed.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            vec![first_id, second_id]
        );
        assert!(!buffer.is_buffering());
    }
}
