//! JSON-lines event protocol spoken by the transport collaborator.
//!
//! One JSON object per line, tagged by `"event"`:
//!
//! ```text
//!   in:  connect │ video_frame │ stop_stream │ disconnect
//!   out: server_message │ frame_received │ frame_dropped │ error
//! ```
//!
//! Decoding and draining are CPU / IO bound, so `add_frame` and `finalize` run
//! on tokio's blocking pool. [`EventRouter`] gives every session its own task:
//! one session draining on `stop_stream` never holds up frames of another,
//! while events of a single session keep their arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_ACK_INTERVAL;
use crate::error::RecorderError;
use crate::recorder::{FrameOutcome, Recording, SessionId};
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Connect {
        session: String,
    },
    VideoFrame {
        session: String,
        /// Base64 image, optionally as a data URL.
        frame: String,
        /// Client-side counter; only echoed back in acknowledgements.
        #[serde(rename = "frameNumber", default)]
        frame_number: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<f64>,
    },
    StopStream {
        session: String,
    },
    Disconnect {
        session: String,
    },
}

impl ClientEvent {
    pub fn session(&self) -> &str {
        match self {
            ClientEvent::Connect { session }
            | ClientEvent::VideoFrame { session, .. }
            | ClientEvent::StopStream { session }
            | ClientEvent::Disconnect { session } => session,
        }
    }

    /// Wire tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Connect { .. } => "connect",
            ClientEvent::VideoFrame { .. } => "video_frame",
            ClientEvent::StopStream { .. } => "stop_stream",
            ClientEvent::Disconnect { .. } => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    ServerMessage {
        session: String,
        message: String,
    },
    FrameReceived {
        session: String,
        #[serde(rename = "frameNumber")]
        frame_number: u64,
        #[serde(rename = "totalFrames")]
        total_frames: u64,
    },
    FrameDropped {
        session: String,
        #[serde(rename = "frameNumber")]
        frame_number: u64,
        reason: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        message: String,
    },
}

impl ServerEvent {
    fn message(session: &str, message: impl Into<String>) -> Self {
        ServerEvent::ServerMessage {
            session: session.to_string(),
            message: message.into(),
        }
    }

    fn error(session: Option<&str>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            session: session.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Acknowledge every `interval`-th accepted frame rather than every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckPolicy {
    interval: u64,
}

impl AckPolicy {
    pub fn every(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// `accepted` is the session's accepted-frame count including this frame.
    pub fn should_ack(&self, accepted: u64) -> bool {
        accepted > 0 && accepted % self.interval == 0
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::every(DEFAULT_ACK_INTERVAL)
    }
}

/// Routes client events to the registry and turns results into replies.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    ack: AckPolicy,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, ack: AckPolicy) -> Self {
        Self { registry, ack }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn handle(&self, event: ClientEvent) -> Vec<ServerEvent> {
        match event {
            ClientEvent::Connect { session } => {
                self.registry.connect(&session);
                vec![
                    ServerEvent::message(&session, "Connected to video stream server"),
                    ServerEvent::message(&session, format!("Session ID: {session}")),
                ]
            }
            ClientEvent::VideoFrame {
                session,
                frame,
                frame_number,
                fps,
            } => self.video_frame(session, frame, frame_number, fps).await,
            ClientEvent::StopStream { session } => {
                info!(session = %session, "Stream stopped by client");
                match self.finalize(&session).await {
                    Ok(Some(recording)) => vec![ServerEvent::message(
                        &session,
                        format!("Video saved: {}", recording.path.display()),
                    )],
                    Ok(None) => vec![ServerEvent::message(&session, "No frames recorded")],
                    Err(message) => vec![ServerEvent::error(Some(&session), message)],
                }
            }
            ClientEvent::Disconnect { session } => {
                info!(session = %session, "Client disconnected");
                match self.finalize(&session).await {
                    Ok(Some(recording)) => {
                        info!(session = %session, path = %recording.path.display(), "Auto-saved video on disconnect");
                    }
                    Ok(None) => {}
                    Err(message) => error!(session = %session, "{message}"),
                }
                // Nobody left to tell.
                Vec::new()
            }
        }
    }

    /// Finalize every session; called once the input stream ends.
    pub async fn shutdown(&self) -> Vec<(SessionId, Recording)> {
        let registry = self.registry.clone();
        match tokio::task::spawn_blocking(move || registry.finalize_all()).await {
            Ok(saved) => saved,
            Err(e) => {
                error!("Shutdown finalize failed: {e}");
                Vec::new()
            }
        }
    }

    async fn video_frame(
        &self,
        session: String,
        frame: String,
        frame_number: u64,
        fps: Option<f64>,
    ) -> Vec<ServerEvent> {
        // Non-finite or negative rates become 0 and are ignored by the recorder.
        let hint = fps.map(|fps| fps.round() as u32);
        let registry = self.registry.clone();
        let id = session.clone();
        let result = tokio::task::spawn_blocking(move || {
            let outcome = registry.add_frame(&id, frame.as_bytes(), hint);
            let written = registry.get(&id).map_or(0, |r| r.frames_written());
            outcome.map(|outcome| (outcome, written))
        })
        .await;

        match result {
            Ok(Ok((FrameOutcome::Accepted { accepted, .. }, written))) => {
                if self.ack.should_ack(accepted) {
                    vec![ServerEvent::FrameReceived {
                        session,
                        frame_number,
                        total_frames: written,
                    }]
                } else {
                    Vec::new()
                }
            }
            Ok(Ok((FrameOutcome::Dropped(reason), _))) => {
                debug!(session = %session, frame_number, "Frame dropped: {reason}");
                vec![ServerEvent::FrameDropped {
                    session,
                    frame_number,
                    reason: reason.to_string(),
                }]
            }
            Ok(Err(RecorderError::UnknownSession(_))) => {
                vec![ServerEvent::error(Some(&session), "No active recording session")]
            }
            Ok(Err(e)) => {
                error!(session = %session, frame_number, "Failed to process frame: {e}");
                vec![ServerEvent::error(Some(&session), e.to_string())]
            }
            Err(e) => {
                error!(session = %session, frame_number, "Frame task failed: {e}");
                vec![ServerEvent::error(
                    Some(&session),
                    format!("Failed to process frame {frame_number}"),
                )]
            }
        }
    }

    async fn finalize(&self, session: &str) -> Result<Option<Recording>, String> {
        let registry = self.registry.clone();
        let id = session.to_string();
        tokio::task::spawn_blocking(move || registry.finalize(&id))
            .await
            .map_err(|e| format!("finalize failed: {e}"))
    }
}

/// Events a session task may have pending before further frames are dropped.
const SESSION_INBOX: usize = 32;

/// Fans client events out to one task per session.
///
/// ```text
///   route_line ──► inbox[s1] ──► task s1 ──► Dispatcher::handle ──┐
///              └─► inbox[s2] ──► task s2 ──► Dispatcher::handle ──┴─► replies
/// ```
///
/// Frames are offered with `try_send`: a session whose task is busy draining
/// gets `frame_dropped` instead of stalling the reader. Control events always
/// get through.
pub struct EventRouter {
    dispatcher: Arc<Dispatcher>,
    replies: mpsc::Sender<ServerEvent>,
    inboxes: HashMap<String, mpsc::Sender<ClientEvent>>,
    tasks: JoinSet<()>,
}

impl EventRouter {
    pub fn new(dispatcher: Arc<Dispatcher>, replies: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            dispatcher,
            replies,
            inboxes: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Parse one protocol line and route it. Malformed lines get an `error`
    /// reply and are otherwise ignored.
    pub async fn route_line(&mut self, line: &str) {
        match serde_json::from_str::<ClientEvent>(line) {
            Ok(event) => self.route(event).await,
            Err(e) => {
                warn!("Invalid client event: {e}");
                self.reply(ServerEvent::error(None, format!("invalid event: {e}")))
                    .await;
            }
        }
    }

    pub async fn route(&mut self, event: ClientEvent) {
        while self.tasks.try_join_next().is_some() {}

        let session = event.session().to_string();
        debug!(event = event.kind(), session = %session, "Received");
        let inbox = self.inbox(&session);

        match &event {
            ClientEvent::VideoFrame { frame_number, .. } => {
                let frame_number = *frame_number;
                match inbox.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(session = %session, frame_number, "Session busy, frame dropped");
                        self.reply(ServerEvent::FrameDropped {
                            session,
                            frame_number,
                            reason: "session busy".to_string(),
                        })
                        .await;
                    }
                    Err(TrySendError::Closed(_)) => {
                        error!(session = %session, frame_number, "Session task is gone");
                    }
                }
            }
            ClientEvent::Disconnect { .. } => {
                if inbox.send(event).await.is_err() {
                    error!(session = %session, "Session task is gone");
                }
                // The task finishes its backlog, then exits once this sender drops.
                self.inboxes.remove(&session);
            }
            ClientEvent::Connect { .. } | ClientEvent::StopStream { .. } => {
                if inbox.send(event).await.is_err() {
                    error!(session = %session, "Session task is gone");
                }
            }
        }
    }

    /// Stop routing and wait until every session task has handled its backlog.
    pub async fn close(mut self) {
        self.inboxes.clear();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Session task failed: {e}");
            }
        }
    }

    fn inbox(&mut self, session: &str) -> mpsc::Sender<ClientEvent> {
        if let Some(inbox) = self.inboxes.get(session) {
            if !inbox.is_closed() {
                return inbox.clone();
            }
        }

        let (tx, mut rx) = mpsc::channel(SESSION_INBOX);
        let dispatcher = self.dispatcher.clone();
        let replies = self.replies.clone();
        self.tasks.spawn(async move {
            while let Some(event) = rx.recv().await {
                for reply in dispatcher.handle(event).await {
                    if replies.send(reply).await.is_err() {
                        return;
                    }
                }
            }
        });
        self.inboxes.insert(session.to_string(), tx.clone());
        tx
    }

    async fn reply(&self, event: ServerEvent) {
        if self.replies.send(event).await.is_err() {
            warn!("Reply channel closed");
        }
    }
}
