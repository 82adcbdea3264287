//! Child-process execution context.
//!
//! [`ProcessContext`] runs the execution context as a child process and
//! talks to it over newline-delimited JSON on its stdin/stdout:
//!
//! ```text
//! -> {"requestId":"9b1c...","type":"PROCESS_TOC_TASK","payload":{"taskId":"t1","docHash":"abc"}}
//! <- {"requestId":"9b1c...","payload":{"success":true}}
//! ```
//!
//! Responses may arrive in any order and are matched to requests by
//! `requestId`. The child's stderr is inherited so its diagnostics land in
//! the host's log stream. When the child exits, every request still
//! waiting on it fails with [`DelegationError::ContextClosed`] and the next
//! `exists()` reports `false`, so the channel starts a fresh one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use super::{ContextSpec, ExecutionContext};
use crate::constants::{CONTEXT_JUSTIFICATION_ENV, CONTEXT_REASONS_ENV};
use crate::error::DelegationError;
use crate::types::messages::TaggedMessage;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestEnvelope<'a> {
    request_id: &'a str,
    #[serde(rename = "type")]
    message_type: &'a str,
    payload: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyEnvelope {
    request_id: String,
    #[serde(default)]
    payload: Value,
}

/// A response slot tagged with the child generation it was sent to.
type PendingReply = (u64, oneshot::Sender<Value>);

#[derive(Debug)]
struct Running {
    generation: u64,
    child: Child,
    stdin: ChildStdin,
}

#[derive(Debug, Default)]
struct Shared {
    running: Mutex<Option<Running>>,
    pending: DashMap<String, PendingReply>,
    generations: AtomicU64,
}

/// Execution context backed by a child process.
///
/// # Examples
///
/// ```no_run
/// use doc_orchestrator::delegation::{ContextSpec, ExecutionContext, ProcessContext};
///
/// # async fn example() -> Result<(), doc_orchestrator::error::DelegationError> {
/// let context = ProcessContext::new("doc-worker", vec!["--stdio".to_string()]);
/// if !context.exists().await {
///     context.create(&ContextSpec::default()).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProcessContext {
    command: String,
    args: Vec<String>,
    shared: Arc<Shared>,
}

impl ProcessContext {
    /// Describes the child to spawn; nothing is started until
    /// [`create`](ExecutionContext::create).
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            shared: Arc::new(Shared::default()),
        }
    }

    /// The configured command.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Reads replies until the child closes stdout, then fails whatever is
    /// still waiting on this generation.
    async fn reader_loop(shared: Arc<Shared>, generation: u64, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ReplyEnvelope>(&line) {
                        Ok(reply) => match shared.pending.remove(&reply.request_id) {
                            Some((_, (_, tx))) => {
                                let _ = tx.send(reply.payload);
                            },
                            None => tracing::warn!(
                                request_id = %reply.request_id,
                                "reply for unknown request ignored"
                            ),
                        },
                        Err(e) => tracing::warn!(error = %e, "unparseable line from execution context"),
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "reading from execution context failed");
                    break;
                },
            }
        }

        // Dropping the senders wakes their receivers with ContextClosed.
        shared.pending.retain(|_, (owner, _)| *owner != generation);
        let mut running = shared.running.lock().await;
        if running.as_ref().is_some_and(|r| r.generation == generation) {
            *running = None;
        }
        tracing::info!(generation, "execution context exited");
    }
}

#[async_trait]
impl ExecutionContext for ProcessContext {
    async fn exists(&self) -> bool {
        let mut running = self.shared.running.lock().await;
        let alive = match running.as_mut() {
            Some(r) => matches!(r.child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            *running = None;
        }
        alive
    }

    async fn create(&self, spec: &ContextSpec) -> Result<(), DelegationError> {
        let mut running = self.shared.running.lock().await;
        if let Some(r) = running.as_mut() {
            if matches!(r.child.try_wait(), Ok(None)) {
                return Err(DelegationError::AlreadyExists);
            }
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env(CONTEXT_JUSTIFICATION_ENV, &spec.justification)
            .env(CONTEXT_REASONS_ENV, spec.reasons.join(","))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DelegationError::ContextUnavailable(format!(
                    "failed to spawn '{}': {e}",
                    self.command
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            DelegationError::ContextUnavailable("failed to capture child stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DelegationError::ContextUnavailable("failed to capture child stdout".to_string())
        })?;

        let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::spawn(Self::reader_loop(self.shared.clone(), generation, stdout));

        tracing::debug!(
            command = %self.command,
            pid = child.id(),
            generation,
            "spawned execution context"
        );
        *running = Some(Running {
            generation,
            child,
            stdin,
        });
        Ok(())
    }

    async fn send(&self, message: TaggedMessage) -> Result<Value, DelegationError> {
        let request_id = Uuid::new_v4().to_string();
        let envelope = RequestEnvelope {
            request_id: &request_id,
            message_type: &message.message_type,
            payload: &message.payload,
        };
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| DelegationError::Transport(format!("failed to encode request: {e}")))?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut running = self.shared.running.lock().await;
            let Some(r) = running.as_mut() else {
                return Err(DelegationError::ContextUnavailable(
                    "execution context is not running".to_string(),
                ));
            };
            self.shared
                .pending
                .insert(request_id.clone(), (r.generation, tx));

            let written = async {
                r.stdin.write_all(&line).await?;
                r.stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                self.shared.pending.remove(&request_id);
                return Err(e.into());
            }
        }

        tracing::trace!(request_id, message_type = %message.message_type, "request sent");
        match rx.await {
            Ok(payload) => Ok(payload),
            Err(_) => Err(DelegationError::ContextClosed),
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        // The reader task keeps `shared` alive; release the child here so
        // kill_on_drop fires and the reader sees EOF.
        if let Ok(mut running) = self.shared.running.try_lock() {
            running.take();
        }
        self.shared.pending.clear();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    /// POSIX sh loop answering every request with `payload`.
    fn responder(payload: &str) -> ProcessContext {
        let script = format!(
            r#"while IFS= read -r line; do
                 id=${{line#*\"requestId\":\"}}
                 id=${{id%%\"*}}
                 printf '{{"requestId":"%s","payload":{payload}}}\n' "$id"
               done"#
        );
        ProcessContext::new("sh", vec!["-c".to_string(), script])
    }

    fn message() -> TaggedMessage {
        TaggedMessage::new("VERIFY_TOC_EXISTS", &json!({"docHash": "abc"})).unwrap()
    }

    #[tokio::test]
    async fn round_trip_through_child() {
        let context = responder(r#"{"exists":true}"#);
        assert!(!context.exists().await);
        context.create(&ContextSpec::default()).await.unwrap();
        assert!(context.exists().await);

        let reply = context.send(message()).await.unwrap();
        assert_eq!(reply, json!({"exists": true}));
        assert_eq!(context.pending_requests(), 0);
    }

    #[tokio::test]
    async fn second_create_reports_already_exists() {
        let context = responder(r#"{"exists":true}"#);
        context.create(&ContextSpec::default()).await.unwrap();
        assert!(matches!(
            context.create(&ContextSpec::default()).await,
            Err(DelegationError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn spec_is_passed_through_environment() {
        let script = r#"while IFS= read -r line; do
                 id=${line#*\"requestId\":\"}
                 id=${id%%\"*}
                 printf '{"requestId":"%s","payload":{"reasons":"%s"}}\n' "$id" "$DOC_CONTEXT_REASONS"
               done"#;
        let context = ProcessContext::new("sh", vec!["-c".to_string(), script.to_string()]);
        context.create(&ContextSpec::default()).await.unwrap();
        let reply = context.send(message()).await.unwrap();
        assert_eq!(reply["reasons"], "DOM_PARSER,LOCAL_STORAGE");
    }

    #[tokio::test]
    async fn send_without_child_is_unavailable() {
        let context = responder("{}");
        assert!(matches!(
            context.send(message()).await,
            Err(DelegationError::ContextUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn exited_child_fails_requests_and_is_recreated() {
        // Reads one line and exits without answering.
        let context = ProcessContext::new(
            "sh",
            vec!["-c".to_string(), "read -r line; exit 0".to_string()],
        );
        context.create(&ContextSpec::default()).await.unwrap();
        let err = context.send(message()).await.unwrap_err();
        assert!(matches!(
            err,
            DelegationError::ContextClosed | DelegationError::Transport(_)
        ));

        // Wait until the exit is observed, then a fresh child can be created.
        for _ in 0..100 {
            if !context.exists().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!context.exists().await);
        context.create(&ContextSpec::default()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let context = ProcessContext::new("/definitely/not/a/binary", Vec::new());
        assert!(matches!(
            context.create(&ContextSpec::default()).await,
            Err(DelegationError::ContextUnavailable(_))
        ));
    }
}
