//! Per-station lifecycle state and script-session arbitration.
//!
//! States: offline -> idle on first heartbeat; idle -> testing when a
//! script starts; testing <-> paused under the starting operator; testing
//! or paused -> idle on terminate/abort; anything -> offline on liveness
//! expiry.  Manual device commands are permitted only while a station is
//! idle.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    Offline,
    Idle,
    Testing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Paused,
    Terminated,
    Aborted,
    Completed,
}

/// The record of one script execution bound to a station.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub station: String,
    pub script_path: String,
    pub script_name: String,
    pub operator: String,
    pub reference_id: Option<String>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Reason recorded on terminate.
    pub end_reason: Option<String>,
    /// Top-level statement cursor, shared with the interpreter.
    pub cursor: Arc<AtomicUsize>,
    /// Cancels the session's blocking operations.
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("E_STATION_BUSY: station '{0}' has an active session")]
    Busy(String),
    #[error("E_STATION_OFFLINE: station '{0}' is offline")]
    Offline(String),
    #[error("operator '{0}' does not own the active session")]
    OperatorMismatch(String),
    #[error("station '{0}' has no active session")]
    NoSession(String),
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct Slot {
    state: StationState,
    session: Option<Session>,
}

#[derive(Default)]
pub struct StationTracker {
    slots: Mutex<HashMap<String, Slot>>,
}

impl StationTracker {
    pub fn new() -> Self {
        StationTracker::default()
    }

    /// offline -> idle; no effect on a station that is testing or paused.
    pub fn heartbeat_received(&self, instance: &str) {
        let mut slots = self.slots.lock().expect("tracker lock poisoned");
        let slot = slots.entry(instance.to_owned()).or_insert(Slot {
            state: StationState::Offline,
            session: None,
        });
        if slot.state == StationState::Offline {
            slot.state = StationState::Idle;
            info!(station = %instance, "station online");
        }
    }

    /// Liveness expiry: any -> offline.  An active session is terminated
    /// and its cancellation token fired.
    pub fn mark_offline(&self, instance: &str) {
        let mut slots = self.slots.lock().expect("tracker lock poisoned");
        if let Some(slot) = slots.get_mut(instance) {
            if let Some(session) = &mut slot.session {
                if matches!(session.state, SessionState::Running | SessionState::Paused) {
                    warn!(station = %instance, session = %session.id, "station went offline mid-session");
                    session.state = SessionState::Terminated;
                    session.end_reason = Some("station offline".to_owned());
                    session.ended_at = Some(Utc::now());
                    session.cancel.cancel();
                }
            }
            slot.state = StationState::Offline;
        }
    }

    pub fn state(&self, instance: &str) -> StationState {
        self.slots
            .lock()
            .expect("tracker lock poisoned")
            .get(instance)
            .map(|slot| slot.state)
            .unwrap_or(StationState::Offline)
    }

    pub fn session(&self, instance: &str) -> Option<Session> {
        self.slots
            .lock()
            .expect("tracker lock poisoned")
            .get(instance)
            .and_then(|slot| slot.session.clone())
    }

    /// Manual device command gate: idle only.
    pub fn manual_allowed(&self, instance: &str) -> Result<(), TrackerError> {
        match self.state(instance) {
            StationState::Idle => Ok(()),
            StationState::Offline => Err(TrackerError::Offline(instance.to_owned())),
            StationState::Testing | StationState::Paused => {
                Err(TrackerError::Busy(instance.to_owned()))
            }
        }
    }

    /// idle -> testing.  The caller must have already verified the script
    /// parses cleanly.  At most one active session per station.
    pub fn start_test(
        &self,
        instance: &str,
        script_path: &str,
        script_name: &str,
        operator: &str,
        reference_id: Option<String>,
    ) -> Result<Session, TrackerError> {
        let mut slots = self.slots.lock().expect("tracker lock poisoned");
        let slot = slots
            .get_mut(instance)
            .ok_or_else(|| TrackerError::Offline(instance.to_owned()))?;
        match slot.state {
            StationState::Offline => return Err(TrackerError::Offline(instance.to_owned())),
            StationState::Testing | StationState::Paused => {
                return Err(TrackerError::Busy(instance.to_owned()));
            }
            StationState::Idle => {}
        }
        let session = Session {
            id: Uuid::new_v4(),
            station: instance.to_owned(),
            script_path: script_path.to_owned(),
            script_name: script_name.to_owned(),
            operator: operator.to_owned(),
            reference_id,
            state: SessionState::Running,
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
            cursor: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        };
        slot.state = StationState::Testing;
        slot.session = Some(session.clone());
        info!(station = %instance, session = %session.id, script = %script_name, "test started");
        Ok(session)
    }

    /// testing -> paused, by the starting operator.
    pub fn pause_test(&self, instance: &str, operator: &str) -> Result<(), TrackerError> {
        self.with_active(instance, |slot, session| {
            if session.operator != operator {
                return Err(TrackerError::OperatorMismatch(operator.to_owned()));
            }
            if slot.state != StationState::Testing {
                return Err(TrackerError::NoSession(instance.to_owned()));
            }
            slot.state = StationState::Paused;
            session.state = SessionState::Paused;
            Ok(())
        })
    }

    /// paused -> testing, by the starting operator.
    pub fn resume_test(&self, instance: &str, operator: &str) -> Result<(), TrackerError> {
        self.with_active(instance, |slot, session| {
            if session.operator != operator {
                return Err(TrackerError::OperatorMismatch(operator.to_owned()));
            }
            if slot.state != StationState::Paused {
                return Err(TrackerError::NoSession(instance.to_owned()));
            }
            slot.state = StationState::Testing;
            session.state = SessionState::Running;
            Ok(())
        })
    }

    /// testing|paused -> idle, recording the reason.
    pub fn terminate_test(&self, instance: &str, reason: &str) -> Result<(), TrackerError> {
        self.finish(instance, SessionState::Terminated, Some(reason))
    }

    /// testing|paused -> idle, discarding accumulated data.
    pub fn abort_test(&self, instance: &str) -> Result<(), TrackerError> {
        self.finish(instance, SessionState::Aborted, None)
    }

    /// Normal completion: testing -> idle.
    pub fn complete_test(&self, instance: &str) -> Result<(), TrackerError> {
        self.finish(instance, SessionState::Completed, None)
    }

    fn finish(
        &self,
        instance: &str,
        end_state: SessionState,
        reason: Option<&str>,
    ) -> Result<(), TrackerError> {
        self.with_active(instance, |slot, session| {
            session.state = end_state;
            session.ended_at = Some(Utc::now());
            session.end_reason = reason.map(|r| r.to_owned());
            session.cancel.cancel();
            slot.state = StationState::Idle;
            info!(
                station = %instance,
                session = %session.id,
                state = ?end_state,
                "session ended"
            );
            Ok(())
        })
    }

    /// Stations with a session currently running or paused.
    pub fn active_sessions(&self) -> Vec<Session> {
        self.slots
            .lock()
            .expect("tracker lock poisoned")
            .values()
            .filter_map(|slot| slot.session.clone())
            .filter(|session| {
                matches!(session.state, SessionState::Running | SessionState::Paused)
            })
            .collect()
    }

    fn with_active(
        &self,
        instance: &str,
        f: impl FnOnce(&mut Slot, &mut Session) -> Result<(), TrackerError>,
    ) -> Result<(), TrackerError> {
        let mut slots = self.slots.lock().expect("tracker lock poisoned");
        let slot = slots
            .get_mut(instance)
            .ok_or_else(|| TrackerError::NoSession(instance.to_owned()))?;
        let mut session = slot
            .session
            .take()
            .ok_or_else(|| TrackerError::NoSession(instance.to_owned()))?;
        if !matches!(session.state, SessionState::Running | SessionState::Paused) {
            slot.session = Some(session);
            return Err(TrackerError::NoSession(instance.to_owned()));
        }
        let result = f(slot, &mut session);
        slot.session = Some(session);
        result
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
