//! UDS session finite-state machine (`§4.2`, `§5`): states, events, a sparse
//! static transition table, and per-session P2/P2*/S3 timers.
//!
//! The transition table is modeled as a match over `(state, event)` rather
//! than an array of function pointers (`§9`: "model these as tagged-variant
//! arrays with dispatch on the tag"). Absent combinations are rejected
//! without side effect beyond incrementing the session's error counter.

mod reentrant;

use ecu_error::{ClassifiedError, ErrorKind};
use ecu_timers::Multitimer;
use enum_map::Enum;
use reentrant::ReentrantLock;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

ecu_ringbuf::ringbuf!(SESSION_RINGBUF, SessionLogEvent, 128, SessionLogEvent::Idle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionLogEvent {
    Idle,
    Created { id: u64 },
    Destroyed { id: u64 },
    Accepted { id: u64, to: SessionState },
    Rejected { id: u64 },
    TimerFired { id: u64 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
    Default,
    Programming,
    Extended,
    Safety,
    Supplier,
    Eol,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Timeout,
    Request { service_id: u8 },
    Response,
    SecurityAccess { request_byte: u8, level_byte: u8 },
    SecurityDenied,
    Error,
    Reset,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
enum SessionTimer {
    S3,
    P2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session table is at capacity")]
    TableFull,
    #[error("no session with id {0}")]
    UnknownSession(u64),
}

impl ClassifiedError for SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            SessionError::TableFull => ErrorKind::Transient,
            SessionError::UnknownSession(_) => ErrorKind::Protocol,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub capacity: usize,
    pub p2_ms: u64,
    pub p2_star_ms: u64,
    pub s3_ms: u64,
    pub max_error_count: u32,
    pub require_security_access: bool,
    pub allow_nested_response: bool,
    pub auto_session_cleanup: bool,
}

/// Per-session state (`§3`). Invariant: `id > 0` while active; all fields
/// are zeroed on destruction.
#[derive(Clone)]
pub struct SessionRecord {
    pub id: u64,
    pub state: SessionState,
    pub state_entered_ms: u64,
    pub last_activity_ms: u64,
    pub security_level: u8,
    pub pending_did: Option<u16>,
    pub pending_routine: Option<u16>,
    pub routine_active: bool,
    pub error_count: u32,
    timers: Multitimer<SessionTimer>,
}

impl SessionRecord {
    fn new(id: u64, now_ms: u64, cfg: &SessionConfig) -> Self {
        let mut timers = Multitimer::new();
        timers.set_timer(SessionTimer::S3, now_ms + cfg.s3_ms, None);
        SessionRecord {
            id,
            state: SessionState::Default,
            state_entered_ms: now_ms,
            last_activity_ms: now_ms,
            security_level: 0,
            pending_did: None,
            pending_routine: None,
            routine_active: false,
            error_count: 0,
            timers,
        }
    }

    fn refresh_activity(&mut self, now_ms: u64, cfg: &SessionConfig) {
        self.last_activity_ms = now_ms;
        self.timers.set_timer(SessionTimer::S3, now_ms + cfg.s3_ms, None);
    }

    fn enter_state(&mut self, state: SessionState, now_ms: u64) {
        self.state = state;
        self.state_entered_ms = now_ms;
    }

    fn arm_p2_if_pending(&mut self, now_ms: u64, cfg: &SessionConfig) {
        if self.pending_did.is_some() || self.pending_routine.is_some() {
            let budget = if self.routine_active {
                cfg.p2_star_ms
            } else {
                cfg.p2_ms
            };
            self.timers.set_timer(SessionTimer::P2, now_ms + budget, None);
        } else {
            self.timers.clear_timer(SessionTimer::P2);
        }
    }
}

enum Handler {
    ClearOnTimeout,
    RefreshOnSessionControl,
    SecurityAccessProgramming,
    RequestExtended,
    ErrorSafety,
    ResponseSupplier,
    ResetEol,
}

/// The static, sparse transition table (`§4.2`). Returns `None` when the
/// event is not accepted in this state.
fn lookup(state: SessionState, event: &SessionEvent) -> Option<(SessionState, Handler)> {
    use SessionEvent as E;
    use SessionState as S;
    match (state, event) {
        (S::Default, E::Timeout) => Some((S::Default, Handler::ClearOnTimeout)),
        (S::Default, E::Request { .. }) => Some((S::Extended, Handler::RefreshOnSessionControl)),
        (S::Programming, E::SecurityAccess { .. }) => {
            Some((S::Programming, Handler::SecurityAccessProgramming))
        }
        (S::Extended, E::Request { .. }) => Some((S::Extended, Handler::RequestExtended)),
        (S::Safety, E::Error) => Some((S::Default, Handler::ErrorSafety)),
        (S::Supplier, E::Response) => Some((S::Supplier, Handler::ResponseSupplier)),
        (S::Eol, E::Reset) => Some((S::Default, Handler::ResetEol)),
        _ => None,
    }
}

/// Applies `event` to `record`. Returns the accepted next state, or `None`
/// if the transition was rejected (either because it is absent from the
/// table, or because the handler itself vetoes it).
fn apply(
    record: &mut SessionRecord,
    event: SessionEvent,
    now_ms: u64,
    cfg: &SessionConfig,
) -> Option<SessionState> {
    let Some((next_state, handler)) = lookup(record.state, &event) else {
        record.error_count += 1;
        return None;
    };

    let committed = match handler {
        Handler::ClearOnTimeout => {
            record.security_level = 0;
            record.pending_did = None;
            record.pending_routine = None;
            record.error_count = 0;
            true
        }
        Handler::RefreshOnSessionControl => {
            if matches!(event, SessionEvent::Request { service_id } if service_id == 0x10) {
                record.refresh_activity(now_ms, cfg);
            }
            true
        }
        Handler::SecurityAccessProgramming => {
            if record.error_count >= cfg.max_error_count {
                false
            } else if let SessionEvent::SecurityAccess {
                request_byte,
                level_byte,
            } = event
            {
                if request_byte == 0x27 {
                    record.security_level = level_byte;
                    record.error_count = 0;
                } else {
                    record.error_count += 1;
                }
                true
            } else {
                true
            }
        }
        Handler::RequestExtended => {
            if cfg.require_security_access && record.security_level == 0 {
                record.error_count += 1;
                false
            } else {
                record.refresh_activity(now_ms, cfg);
                true
            }
        }
        Handler::ErrorSafety => {
            record.error_count += 1;
            record.error_count >= cfg.max_error_count
        }
        Handler::ResponseSupplier => {
            if !cfg.allow_nested_response && record.pending_did.is_some() {
                record.error_count += 1;
                false
            } else {
                record.refresh_activity(now_ms, cfg);
                true
            }
        }
        Handler::ResetEol => {
            let id = record.id;
            *record = SessionRecord::new(id, now_ms, cfg);
            true
        }
    };

    if committed {
        record.enter_state(next_state, now_ms);
        record.arm_p2_if_pending(now_ms, cfg);
        Some(next_state)
    } else {
        None
    }
}

struct Table {
    slots: Vec<Option<SessionRecord>>,
}

/// Owns the session table and dispatches events against it. All mutation
/// happens through the reentrant lock (`§5`): timer processing iterates the
/// table while holding it and calls back into `destroy_session`, which
/// re-enters the same lock on the same thread.
pub struct SessionManager {
    cfg: SessionConfig,
    next_id: AtomicU64,
    table: ReentrantLock<RefCell<Table>>,
}

impl SessionManager {
    pub fn new(cfg: SessionConfig) -> Self {
        SessionManager {
            cfg,
            next_id: AtomicU64::new(1),
            table: ReentrantLock::new(RefCell::new(Table {
                slots: (0..cfg.capacity).map(|_| None).collect(),
            })),
        }
    }

    pub fn create_session(&self, now_ms: u64) -> Result<u64, SessionError> {
        let guard = self.table.lock();
        let mut table = guard.borrow_mut();
        let slot = table
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(SessionError::TableFull)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        *slot = Some(SessionRecord::new(id, now_ms, &self.cfg));
        ecu_ringbuf::ringbuf_entry!(SESSION_RINGBUF, SessionLogEvent::Created { id });
        Ok(id)
    }

    /// Destroys the session, zeroing its slot. A no-op returning `false` if
    /// `id` is not active (`§5`: "destroying a non-existent session id is a
    /// no-op returning false").
    pub fn destroy_session(&self, id: u64) -> bool {
        let guard = self.table.lock();
        let mut table = guard.borrow_mut();
        for slot in table.slots.iter_mut() {
            if slot.as_ref().map(|s| s.id) == Some(id) {
                *slot = None;
                ecu_ringbuf::ringbuf_entry!(SESSION_RINGBUF, SessionLogEvent::Destroyed { id });
                return true;
            }
        }
        false
    }

    pub fn apply_event(
        &self,
        id: u64,
        event: SessionEvent,
        now_ms: u64,
    ) -> Result<Option<SessionState>, SessionError> {
        let guard = self.table.lock();
        let mut table = guard.borrow_mut();
        let slot = table
            .slots
            .iter_mut()
            .find(|s| s.as_ref().map(|r| r.id) == Some(id))
            .ok_or(SessionError::UnknownSession(id))?;
        let record = slot.as_mut().unwrap();
        let outcome = apply(record, event, now_ms, &self.cfg);
        match outcome {
            Some(to) => {
                ecu_ringbuf::ringbuf_entry!(SESSION_RINGBUF, SessionLogEvent::Accepted { id, to });
            }
            None => {
                ecu_ringbuf::ringbuf_entry!(SESSION_RINGBUF, SessionLogEvent::Rejected { id });
            }
        }
        Ok(outcome)
    }

    pub fn snapshot(&self, id: u64) -> Option<SessionRecord> {
        let guard = self.table.lock();
        let table = guard.borrow();
        table
            .slots
            .iter()
            .find_map(|s| s.as_ref().filter(|r| r.id == id).cloned())
    }

    /// Runs one S3/P2 timer tick over every active session (`§4.2`). Holds
    /// the table lock for the whole pass; any `Timeout` it generates, and
    /// any resulting `destroy_session`, re-enter the same lock on this
    /// thread rather than deadlocking.
    pub fn process_timers(&self, now_ms: u64) {
        let guard = self.table.lock();
        let ids: Vec<u64> = guard
            .borrow()
            .slots
            .iter()
            .flatten()
            .map(|s| s.id)
            .collect();

        for id in ids {
            let fired = {
                let mut table = guard.borrow_mut();
                let slot = table
                    .slots
                    .iter_mut()
                    .find(|s| s.as_ref().map(|r| r.id) == Some(id));
                match slot {
                    Some(Some(record)) => {
                        record.timers.poll_now(now_ms);
                        record.timers.iter_fired().collect::<Vec<_>>()
                    }
                    _ => Vec::new(),
                }
            };
            if fired.is_empty() {
                continue;
            }
            ecu_ringbuf::ringbuf_entry!(SESSION_RINGBUF, SessionLogEvent::TimerFired { id });
            let _ = self.apply_event(id, SessionEvent::Timeout, now_ms);
            if fired.contains(&SessionTimer::S3) && self.cfg.auto_session_cleanup {
                self.destroy_session(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SessionConfig {
        SessionConfig {
            capacity: 4,
            p2_ms: 50,
            p2_star_ms: 5000,
            s3_ms: 200,
            max_error_count: 3,
            require_security_access: true,
            allow_nested_response: false,
            auto_session_cleanup: true,
        }
    }

    #[test]
    fn create_and_destroy_round_trip() {
        let mgr = SessionManager::new(cfg());
        let id = mgr.create_session(0).unwrap();
        assert!(mgr.snapshot(id).is_some());
        assert!(mgr.destroy_session(id));
        assert!(mgr.snapshot(id).is_none());
        assert!(!mgr.destroy_session(id));
    }

    #[test]
    fn table_full_rejected() {
        let mgr = SessionManager::new(SessionConfig {
            capacity: 1,
            ..cfg()
        });
        mgr.create_session(0).unwrap();
        assert_eq!(mgr.create_session(0).unwrap_err(), SessionError::TableFull);
    }

    #[test]
    fn default_request_moves_to_extended() {
        let mgr = SessionManager::new(cfg());
        let id = mgr.create_session(0).unwrap();
        let to = mgr
            .apply_event(id, SessionEvent::Request { service_id: 0x10 }, 10)
            .unwrap();
        assert_eq!(to, Some(SessionState::Extended));
    }

    #[test]
    fn extended_request_without_security_is_rejected_when_required() {
        let mgr = SessionManager::new(cfg());
        let id = mgr.create_session(0).unwrap();
        mgr.apply_event(id, SessionEvent::Request { service_id: 0x10 }, 0)
            .unwrap();
        let outcome = mgr
            .apply_event(id, SessionEvent::Request { service_id: 0x22 }, 1)
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(mgr.snapshot(id).unwrap().error_count, 1);
    }

    #[test]
    fn programming_security_access_denied_after_max_errors() {
        let mgr = SessionManager::new(cfg());
        let id = mgr.create_session(0).unwrap();
        // Force PROGRAMMING by hand since DEFAULT->REQUEST always yields EXTENDED here.
        {
            let guard = mgr.table.lock();
            let mut t = guard.borrow_mut();
            t.slots[0].as_mut().unwrap().state = SessionState::Programming;
        }
        for _ in 0..3 {
            mgr.apply_event(
                id,
                SessionEvent::SecurityAccess {
                    request_byte: 0x99,
                    level_byte: 1,
                },
                0,
            )
            .unwrap();
        }
        assert_eq!(mgr.snapshot(id).unwrap().error_count, 3);
        let outcome = mgr
            .apply_event(
                id,
                SessionEvent::SecurityAccess {
                    request_byte: 0x27,
                    level_byte: 2,
                },
                0,
            )
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(mgr.snapshot(id).unwrap().security_level, 0);
    }

    #[test]
    fn successful_security_access_clears_error_counter() {
        let mgr = SessionManager::new(cfg());
        let id = mgr.create_session(0).unwrap();
        {
            let guard = mgr.table.lock();
            let mut t = guard.borrow_mut();
            t.slots[0].as_mut().unwrap().state = SessionState::Programming;
            t.slots[0].as_mut().unwrap().error_count = 2;
        }
        let outcome = mgr
            .apply_event(
                id,
                SessionEvent::SecurityAccess {
                    request_byte: 0x27,
                    level_byte: 5,
                },
                0,
            )
            .unwrap();
        assert_eq!(outcome, Some(SessionState::Programming));
        let snap = mgr.snapshot(id).unwrap();
        assert_eq!(snap.security_level, 5);
        assert_eq!(snap.error_count, 0);
    }

    #[test]
    fn unrecognized_event_in_state_is_rejected() {
        let mgr = SessionManager::new(cfg());
        let id = mgr.create_session(0).unwrap();
        let outcome = mgr.apply_event(id, SessionEvent::Response, 0).unwrap();
        assert_eq!(outcome, None);
        assert_eq!(mgr.snapshot(id).unwrap().error_count, 1);
    }

    #[test]
    fn s3_timeout_destroys_session_when_auto_cleanup_enabled() {
        let mgr = SessionManager::new(cfg());
        let id = mgr.create_session(0).unwrap();
        assert!(mgr.snapshot(id).is_some());
        mgr.process_timers(199);
        assert!(mgr.snapshot(id).is_some());
        mgr.process_timers(250);
        assert!(mgr.snapshot(id).is_none());
    }

    #[test]
    fn s3_timeout_in_default_state_clears_fields_without_destroying() {
        // DEFAULT is the only state the table gives TIMEOUT a handler for;
        // with cleanup disabled the session survives, cleared in place.
        let mgr = SessionManager::new(SessionConfig {
            auto_session_cleanup: false,
            ..cfg()
        });
        let id = mgr.create_session(0).unwrap();
        mgr.process_timers(1000);
        let snap = mgr.snapshot(id).unwrap();
        assert_eq!(snap.state, SessionState::Default);
        assert_eq!(snap.error_count, 0);
    }

    #[test]
    fn timeout_outside_default_is_rejected_by_the_sparse_table() {
        let mgr = SessionManager::new(SessionConfig {
            auto_session_cleanup: false,
            ..cfg()
        });
        let id = mgr.create_session(0).unwrap();
        mgr.apply_event(id, SessionEvent::Request { service_id: 0x10 }, 0)
            .unwrap();
        mgr.process_timers(1000);
        let snap = mgr.snapshot(id).unwrap();
        assert_eq!(snap.state, SessionState::Extended);
        assert_eq!(snap.error_count, 1);
    }

    #[test]
    fn unknown_session_event_rejected() {
        let mgr = SessionManager::new(cfg());
        assert_eq!(
            mgr.apply_event(999, SessionEvent::Response, 0).unwrap_err(),
            SessionError::UnknownSession(999)
        );
    }
}
