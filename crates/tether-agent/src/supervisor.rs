// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subprocess supervision for one assistant session.
//!
//! [`start`] spawns the assistant with stream-JSON stdio, wires up the
//! three drain tasks, and returns an [`AgentHandle`] plus the bounded event
//! receiver. The handle is cheap to clone; all stdin writes serialize
//! through one mutex and each write is a single JSON object followed by a
//! newline. [`AgentHandle::close`] is idempotent and may race any sender —
//! the sender observes either success or [`AgentError::Closed`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_events::{
    AgentEvent, PermissionChoice, SessionMode, WARN_SCANNER_BUFFER_OVERFLOW, WARN_SCANNER_ERROR,
};

use crate::control::{
    self, PendingKind, PendingRequests, PermissionRequestData, QuestionRequestData,
};
use crate::translate::Translator;
use crate::AgentError;

/// A stdout line longer than this trips the overflow warning and is skipped.
const MAX_LINE_BYTES: usize = 1024 * 1024;
/// Event channel depth: a slow consumer back-pressures the stdout reader.
const EVENT_CHANNEL_DEPTH: usize = 256;
/// How long the exit reporter waits for the stderr drainer to finish.
const STDERR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How to launch the assistant binary.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// The assistant executable (resolved via PATH when relative).
    pub program: PathBuf,
    /// Arguments placed before the stream-JSON flags.
    pub base_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("claude"),
            base_args: Vec::new(),
        }
    }
}

/// Per-launch parameters.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub workdir: PathBuf,
    /// The assistant-native session id to resume or to assign.
    pub session_id: Option<String>,
    pub mode: SessionMode,
    /// Pass `--resume` instead of `--session-id` for a known session.
    pub resume: bool,
}

/// Cheap-to-clone handle to a running assistant subprocess.
#[derive(Clone)]
pub struct AgentHandle {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    pending: PendingRequests,
    cancel: CancellationToken,
    native_session_id: Arc<StdMutex<Option<String>>>,
}

/// Spawn the assistant and start the drain tasks.
///
/// Returns the handle and the event receiver. The receiver yields every
/// translated event in stdout order, then `ProcessEnded`, then closes.
pub fn start(
    config: &AgentConfig,
    opts: SpawnOptions,
) -> Result<(AgentHandle, mpsc::Receiver<AgentEvent>), AgentError> {
    let mut args = config.base_args.clone();
    args.extend(
        [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
        ]
        .map(String::from),
    );
    match opts.mode {
        SessionMode::Yolo => args.push("--dangerously-skip-permissions".into()),
        SessionMode::Default => {
            args.extend(["--permission-prompt-tool", "stdio"].map(String::from))
        }
    }
    if let Some(id) = &opts.session_id {
        let flag = if opts.resume { "--resume" } else { "--session-id" };
        args.extend([flag.to_string(), id.clone()]);
    }

    let mut child = Command::new(&config.program)
        .args(&args)
        .current_dir(&opts.workdir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| AgentError::Spawn {
            program: config.program.clone(),
            source,
        })?;

    info!(
        program = %config.program.display(),
        workdir = %opts.workdir.display(),
        mode = opts.mode.as_str(),
        resume = opts.resume,
        "assistant spawned"
    );

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let pending = PendingRequests::new();
    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    let native_session_id = Arc::new(StdMutex::new(None));

    let handle = AgentHandle {
        stdin: Arc::new(Mutex::new(stdin)),
        pending: pending.clone(),
        cancel: cancel.clone(),
        native_session_id: native_session_id.clone(),
    };

    // ── Stderr drainer ────────────────────────────────────────────────────────
    let (stderr_tx, stderr_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            use tokio::io::AsyncReadExt;
            let _ = stderr.read_to_end(&mut buf).await;
        }
        let _ = stderr_tx.send(buf);
    });

    // ── Stdout reader ─────────────────────────────────────────────────────────
    let reader = tokio::spawn(run_reader(
        stdout,
        pending,
        event_tx.clone(),
        cancel.clone(),
        native_session_id,
    ));

    // ── Exit reporter ─────────────────────────────────────────────────────────
    tokio::spawn(report_exit(
        child,
        reader,
        stderr_rx,
        event_tx,
        cancel.clone(),
        handle.stdin.clone(),
    ));

    Ok((handle, event_rx))
}

async fn run_reader(
    stdout: Option<tokio::process::ChildStdout>,
    pending: PendingRequests,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
    native_session_id: Arc<StdMutex<Option<String>>>,
) {
    let Some(stdout) = stdout else { return };
    let codec = LinesCodec::new_with_max_length(MAX_LINE_BYTES);
    let mut lines = FramedRead::new(stdout, codec);
    let mut translator = Translator::new(pending);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = lines.next() => item,
        };
        match item {
            None => break,
            Some(Ok(line)) => {
                for event in translator.translate_line(&line) {
                    if !deliver(&events, &cancel, event).await {
                        return;
                    }
                }
                if let Some(id) = translator.native_session_id() {
                    let mut slot = native_session_id.lock().expect("session id lock");
                    if slot.is_none() {
                        *slot = Some(id.to_string());
                    }
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("assistant stdout line exceeded {MAX_LINE_BYTES} bytes");
                let warning = AgentEvent::Warning {
                    message: "assistant output line too long; skipped".into(),
                    code: WARN_SCANNER_BUFFER_OVERFLOW.into(),
                };
                if !deliver(&events, &cancel, warning).await {
                    return;
                }
            }
            Some(Err(LinesCodecError::Io(err))) => {
                warn!("assistant stdout read error: {err}");
                let warning = AgentEvent::Warning {
                    message: format!("assistant output read error: {err}"),
                    code: WARN_SCANNER_ERROR.into(),
                };
                let _ = deliver(&events, &cancel, warning).await;
                // The pipe is gone; the exit reporter takes over.
                break;
            }
        }
    }
}

/// Push one event, respecting cancellation. Returns false when delivery is
/// no longer possible.
async fn deliver(
    events: &mpsc::Sender<AgentEvent>,
    cancel: &CancellationToken,
    event: AgentEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn report_exit(
    mut child: Child,
    reader: tokio::task::JoinHandle<()>,
    stderr_rx: oneshot::Receiver<Vec<u8>>,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
) {
    let _ = reader.await;

    if cancel.is_cancelled() {
        let _ = child.start_kill();
    }
    let status = child.wait().await;

    let stderr_text = match tokio::time::timeout(STDERR_JOIN_TIMEOUT, stderr_rx).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).trim().to_string(),
        _ => String::new(),
    };

    if !cancel.is_cancelled() {
        let failure = match &status {
            Ok(st) if !st.success() => Some(if stderr_text.is_empty() {
                format!("assistant exited abnormally: {st}")
            } else {
                stderr_text.clone()
            }),
            Err(err) => Some(if stderr_text.is_empty() {
                format!("waiting for assistant failed: {err}")
            } else {
                stderr_text.clone()
            }),
            Ok(_) => None,
        };
        if let Some(message) = failure {
            warn!("assistant exited abnormally");
            let _ = events.send(AgentEvent::Error { message }).await;
        }
    }

    debug!(?status, "assistant process ended");
    let _ = events.send(AgentEvent::ProcessEnded).await;

    // Release the write end so late senders observe Closed.
    stdin.lock().await.take();
    // Both senders are gone after this frame; the event channel closes.
}

impl AgentHandle {
    /// Send a user prompt.
    pub async fn send_message(&self, prompt: &str) -> Result<(), AgentError> {
        self.write_json(&control::user_message(prompt)).await
    }

    /// Answer a pending permission request.
    pub async fn send_permission_response(
        &self,
        data: &PermissionRequestData,
        choice: PermissionChoice,
    ) -> Result<(), AgentError> {
        let response = match choice {
            PermissionChoice::Allow => {
                control::permission_allow(&data.tool_use_id, data.input.clone(), None)
            }
            PermissionChoice::AlwaysAllow => control::permission_allow(
                &data.tool_use_id,
                data.input.clone(),
                data.suggestions.clone(),
            ),
            PermissionChoice::Deny => {
                control::permission_deny(&data.tool_use_id, "Permission denied by user")
            }
        };
        self.pending.register(&data.request_id, PendingKind::Sent);
        self.write_json(&control::control_response(&data.request_id, response))
            .await
    }

    /// Answer (or cancel, with `answers = None`) a pending question.
    pub async fn send_question_response(
        &self,
        data: &QuestionRequestData,
        answers: Option<Vec<String>>,
    ) -> Result<(), AgentError> {
        let response = match answers {
            Some(answers) => control::question_answer(&data.tool_use_id, &answers),
            None => control::permission_deny(&data.tool_use_id, "Question cancelled by user"),
        };
        self.pending.register(&data.request_id, PendingKind::Sent);
        self.write_json(&control::control_response(&data.request_id, response))
            .await
    }

    /// Ask the assistant to interrupt the current turn. The matching
    /// `control_response` becomes exactly one `Interrupted` event.
    pub async fn send_interrupt(&self) -> Result<(), AgentError> {
        let request_id = control::new_request_id();
        self.pending.register(&request_id, PendingKind::Interrupt);
        self.write_json(&control::interrupt_request(&request_id))
            .await
    }

    /// The assistant's own session id, once its init line has been seen.
    pub fn native_session_id(&self) -> Option<String> {
        self.native_session_id
            .lock()
            .expect("session id lock")
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`AgentHandle::close`] has been called.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Shut the session down. Idempotent; concurrent senders observe either
    /// success or [`AgentError::Closed`].
    pub async fn close(&self) {
        self.cancel.cancel();
        self.stdin.lock().await.take();
    }

    async fn write_json(&self, value: &serde_json::Value) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Closed);
        }
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(AgentError::Closed);
        };
        stdin.write_all(&line).await.map_err(AgentError::StdinWrite)?;
        stdin.flush().await.map_err(AgentError::StdinWrite)?;
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
