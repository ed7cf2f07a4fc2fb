//! Session registry: session id → recorder.
//!
//! Owned by whoever runs the transport and passed around by handle; there is
//! no process-global session map. Every teardown path (stop, disconnect,
//! eviction, shutdown) goes through `SessionRecorder::finalize`, so a session
//! is finalized exactly once whichever event arrives first.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::RecorderConfig;
use crate::error::RecorderError;
use crate::recorder::{FrameOutcome, LifecycleState, Recording, SessionId, SessionRecorder};
use crate::writer::{BuiltinEncoders, EncoderFactory};

pub struct SessionRegistry {
    config: Arc<RecorderConfig>,
    encoders: Arc<dyn EncoderFactory>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionRecorder>>>,
}

impl SessionRegistry {
    /// Registry using the encoder selected in `config`. Creates the output
    /// directory if it does not exist yet.
    pub fn new(config: RecorderConfig) -> io::Result<Self> {
        let encoders = Arc::new(BuiltinEncoders(config.encoder));
        Self::with_encoders(config, encoders)
    }

    pub fn with_encoders(
        config: RecorderConfig,
        encoders: Arc<dyn EncoderFactory>,
    ) -> io::Result<Self> {
        fs::create_dir_all(&config.output_dir)?;
        info!(
            output_dir = %config.output_dir.display(),
            encoder = ?config.encoder,
            queue_capacity = config.queue_capacity,
            "Session registry ready"
        );
        Ok(Self {
            config: Arc::new(config),
            encoders,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Recorder for `id`, created if the session is new. A leftover recorder
    /// that is already closed is replaced by a fresh one.
    pub fn connect(&self, id: &str) -> Arc<SessionRecorder> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(id) {
            if existing.state() != LifecycleState::Closed {
                return existing.clone();
            }
        }

        let id = SessionId::from(id);
        let recorder = Arc::new(SessionRecorder::new(
            id.clone(),
            self.config.clone(),
            self.encoders.clone(),
        ));
        info!(session = %id, active = sessions.len() + 1, "Client connected");
        sessions.insert(id, recorder.clone());
        recorder
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionRecorder>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Submit one encoded frame to a connected session.
    ///
    /// A session whose output cannot be opened is removed before the error is
    /// returned, so it never lingers un-writable.
    pub fn add_frame(
        &self,
        id: &str,
        payload: &[u8],
        frame_rate_hint: Option<u32>,
    ) -> Result<FrameOutcome, RecorderError> {
        let recorder = self
            .get(id)
            .ok_or_else(|| RecorderError::UnknownSession(id.to_string()))?;

        let result = recorder.add_frame(payload, frame_rate_hint);
        if matches!(
            result,
            Err(RecorderError::SinkOpen { .. } | RecorderError::WorkerSpawn { .. })
        ) {
            self.remove_if_same(id, &recorder);
        }
        result
    }

    /// Finalize and forget a session. `None` for unknown ids and for sessions
    /// that never produced a frame.
    pub fn finalize(&self, id: &str) -> Option<Recording> {
        let recorder = self.get(id)?;
        let recording = recorder.finalize();
        self.remove_if_same(id, &recorder);
        recording
    }

    /// Forced teardown of a session the transport considers dead.
    pub fn evict(&self, id: &str) -> Option<Recording> {
        if self.sessions.lock().contains_key(id) {
            warn!(session = id, "Evicting session");
        }
        self.finalize(id)
    }

    /// Finalize every session, draining them in parallel. Used on shutdown.
    pub fn finalize_all(&self) -> Vec<(SessionId, Recording)> {
        let recorders: Vec<_> = self.sessions.lock().drain().collect();
        if recorders.is_empty() {
            return Vec::new();
        }
        info!(sessions = recorders.len(), "Finalizing all sessions");

        let mut saved: Vec<_> = thread::scope(|scope| {
            let pending: Vec<_> = recorders
                .iter()
                .map(|(id, recorder)| (id, scope.spawn(move || recorder.finalize())))
                .collect();
            pending
                .into_iter()
                .filter_map(|(id, handle)| match handle.join() {
                    Ok(recording) => recording.map(|r| (id.clone(), r)),
                    Err(_) => {
                        warn!(session = %id, "Finalize panicked");
                        None
                    }
                })
                .collect()
        });
        saved.sort_by(|a, b| a.0.cmp(&b.0));
        saved
    }

    fn remove_if_same(&self, id: &str, recorder: &Arc<SessionRecorder>) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, recorder))
        {
            sessions.remove(id);
            info!(session = id, active = sessions.len(), "Session removed");
        }
    }
}
