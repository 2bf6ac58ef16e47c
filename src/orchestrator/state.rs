//! In-process bookkeeping for the orchestrator: stop-after-current flags
//! and pause channels for sessions this process is driving.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::intervention::PauseDirective;

#[derive(Default)]
pub struct OrchestratorState {
    stop_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    driving: Mutex<HashSet<Uuid>>,
    pause_channels: Mutex<HashMap<Uuid, mpsc::UnboundedSender<PauseDirective>>>,
}

impl OrchestratorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_flag(&self, project_id: Uuid) -> Arc<AtomicBool> {
        self.stop_flags
            .lock()
            .expect("stop flag lock")
            .entry(project_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn request_stop(&self, project_id: Uuid) {
        self.stop_flag(project_id).store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self, project_id: Uuid) -> bool {
        self.stop_flag(project_id).load(Ordering::SeqCst)
    }

    pub fn clear_stop(&self, project_id: Uuid) {
        self.stop_flag(project_id).store(false, Ordering::SeqCst);
    }

    /// Claim the drive loop for a project; a second claim while one is
    /// active fails.
    pub fn claim_drive(&self, project_id: Uuid) -> bool {
        self.driving.lock().expect("drive lock").insert(project_id)
    }

    pub fn release_drive(&self, project_id: Uuid) {
        self.driving.lock().expect("drive lock").remove(&project_id);
    }

    /// Register the pause channel of a session while its loop runs.
    pub fn register_session(
        &self,
        session_id: Uuid,
        pause_tx: mpsc::UnboundedSender<PauseDirective>,
    ) {
        self.pause_channels
            .lock()
            .expect("pause channel lock")
            .insert(session_id, pause_tx);
    }

    pub fn unregister_session(&self, session_id: Uuid) {
        self.pause_channels
            .lock()
            .expect("pause channel lock")
            .remove(&session_id);
    }

    /// Send a pause directive to a session driven by this process.
    pub fn send_pause(&self, session_id: Uuid, directive: PauseDirective) -> bool {
        self.pause_channels
            .lock()
            .expect("pause channel lock")
            .get(&session_id)
            .is_some_and(|tx| tx.send(directive).is_ok())
    }
}
