//! Call session registry
//!
//! Per-call isolated state. Every concurrent call owns exactly one
//! `CallSession` keyed by the transport-assigned stream sid; the registry's
//! two maps (stream sid → session, call sid → stream sid) are the only
//! cross-session shared state in the process.
//!
//! Locking contract: mutations take the registry lock on the map and the
//! session's own lock on its fields, never across an await point and never
//! while holding a transport send path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::calendar::Appointment;
use crate::config::SessionConfig;
use crate::phonebook::{CallerRole, PhonebookEntry};
use crate::telephony::OutboundFrame;
use crate::workflow::DelayData;

/// Why a session is being cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// Carrier WebSocket closed
    ConnectionClosed,
    /// Idle sweeper fired
    InactivityTimeout,
    /// Process shutdown
    Shutdown,
}

/// Caller identity resolved from the phonebook
#[derive(Debug, Clone)]
pub struct CallerInfo {
    pub name: String,
    pub phone: String,
    pub role: CallerRole,
}

impl CallerInfo {
    pub fn from_entry(phone: &str, entry: &PhonebookEntry) -> Self {
        Self {
            name: entry.name.clone(),
            phone: phone.to_string(),
            role: entry.role,
        }
    }
}

/// Mutable per-call fields, guarded by the session lock
#[derive(Default)]
struct SessionState {
    call_sid: Option<String>,
    caller: Option<CallerInfo>,
    thread_id: String,
    language: String,
    preloaded_appointments: Vec<Appointment>,
    delay_data: Option<DelayData>,
    immediate_callback: bool,
    ending: bool,
    greeted: bool,
    first_media_seen: bool,
    interruption_context: Option<String>,
    dialog_step: Option<String>,
    media_tx: Option<mpsc::Sender<OutboundFrame>>,
    last_activity: Option<Instant>,
}

/// One active call
pub struct CallSession {
    pub stream_sid: String,
    state: Mutex<SessionState>,
    /// Whether synthesized audio is currently streaming to the caller
    speaking: AtomicBool,
    /// Closed when the session is destroyed; every per-session task
    /// selects on this
    closed_tx: watch::Sender<bool>,
}

impl CallSession {
    fn new(stream_sid: &str) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            stream_sid: stream_sid.to_string(),
            state: Mutex::new(SessionState {
                thread_id: stream_sid.to_string(),
                language: "en".to_string(),
                last_activity: Some(Instant::now()),
                ..Default::default()
            }),
            speaking: AtomicBool::new(false),
            closed_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record activity, re-arming the inactivity timer
    pub fn touch(&self) {
        self.lock().last_activity = Some(Instant::now());
    }

    /// Time since the last activity
    pub fn idle_for(&self) -> Duration {
        self.lock()
            .last_activity
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn call_sid(&self) -> Option<String> {
        self.lock().call_sid.clone()
    }

    pub fn caller(&self) -> Option<CallerInfo> {
        self.lock().caller.clone()
    }

    /// Dialog thread id; defaults to the stream sid
    pub fn thread_id(&self) -> String {
        self.lock().thread_id.clone()
    }

    pub fn language(&self) -> String {
        self.lock().language.clone()
    }

    pub fn set_language(&self, language: &str) {
        self.lock().language = language.to_string();
    }

    pub fn delay_data(&self) -> Option<DelayData> {
        self.lock().delay_data.clone()
    }

    pub fn preloaded_appointments(&self) -> Vec<Appointment> {
        self.lock().preloaded_appointments.clone()
    }

    pub fn immediate_callback(&self) -> bool {
        self.lock().immediate_callback
    }

    pub fn dialog_step(&self) -> Option<String> {
        self.lock().dialog_step.clone()
    }

    /// Mark that the goodbye has been spoken; destruction defers by the
    /// grace window from here on
    pub fn mark_ending(&self) {
        self.lock().ending = true;
    }

    pub fn is_ending(&self) -> bool {
        self.lock().ending
    }

    pub fn set_speaking(&self, value: bool) {
        self.speaking.store(value, Ordering::Relaxed);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    /// First greeting guard: returns true exactly once
    pub fn claim_greeting(&self) -> bool {
        let mut state = self.lock();
        if state.greeted {
            false
        } else {
            state.greeted = true;
            true
        }
    }

    /// First media-frame guard: returns true exactly once
    pub fn claim_first_media(&self) -> bool {
        let mut state = self.lock();
        if state.first_media_seen {
            false
        } else {
            state.first_media_seen = true;
            true
        }
    }

    /// Stash interrupted reply text. Never resumed; replaced content is
    /// logged and dropped.
    pub fn store_interruption_context(&self, content: &str) {
        let mut state = self.lock();
        if let Some(previous) = state.interruption_context.take() {
            debug!(
                stream_sid = %self.stream_sid,
                "Discarding earlier interruption context ({} chars)",
                previous.len()
            );
        }
        state.interruption_context = Some(content.to_string());
    }

    pub fn take_interruption_context(&self) -> Option<String> {
        self.lock().interruption_context.take()
    }

    /// Install the transport's outbound frame sender
    pub fn set_media_sender(&self, tx: mpsc::Sender<OutboundFrame>) {
        self.lock().media_tx = Some(tx);
    }

    /// Clone the outbound frame sender, if the transport is attached
    pub fn media_sender(&self) -> Option<mpsc::Sender<OutboundFrame>> {
        self.lock().media_tx.clone()
    }

    /// Observe session destruction; the value flips to true exactly once
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn destroy(&self) {
        self.lock().media_tx = None;
        let _ = self.closed_tx.send(true);
    }

    #[cfg(test)]
    fn rewind_activity(&self, by: Duration) {
        let mut state = self.lock();
        state.last_activity = state.last_activity.map(|t| t - by);
    }
}

/// Per-component teardown hook, invoked with the stream sid on destroy
pub type Teardown = Box<dyn Fn(&str) + Send + Sync>;

struct RegistryInner {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<CallSession>>>,
    /// call sid → stream sid, used to refuse reconnects for ending calls
    call_index: Mutex<HashMap<String, String>>,
    /// Delay payloads for outbound legs that have no session yet,
    /// keyed by the outbound call sid
    pending_outbound: Mutex<HashMap<String, DelayData>>,
    teardowns: Mutex<Vec<Teardown>>,
}

/// Registry of active call sessions
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                sessions: Mutex::new(HashMap::new()),
                call_index: Mutex::new(HashMap::new()),
                pending_outbound: Mutex::new(HashMap::new()),
                teardowns: Mutex::new(Vec::new()),
            }),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CallSession>>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn call_index(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .call_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register a teardown hook run for every destroyed session
    pub fn register_teardown(&self, teardown: Teardown) {
        self.inner
            .teardowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(teardown);
    }

    /// Fetch or create the session for a stream sid, touching last-activity
    pub fn get_or_create(&self, stream_sid: &str) -> Arc<CallSession> {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(stream_sid.to_string())
            .or_insert_with(|| {
                info!(stream_sid, "Session created");
                CallSession::new(stream_sid)
            })
            .clone();
        drop(sessions);
        session.touch();
        session
    }

    /// Fetch without creating
    pub fn get(&self, stream_sid: &str) -> Option<Arc<CallSession>> {
        self.sessions().get(stream_sid).cloned()
    }

    /// Establish the call sid → stream sid reverse mapping
    pub fn associate_call_id(&self, stream_sid: &str, call_sid: &str) {
        let session = self.get_or_create(stream_sid);
        session.lock().call_sid = Some(call_sid.to_string());
        self.call_index()
            .insert(call_sid.to_string(), stream_sid.to_string());
    }

    /// Whether a reconnect attempt for this call sid must be refused
    /// (the call's session exists and is marked ending)
    pub fn is_call_ending(&self, call_sid: &str) -> bool {
        let stream_sid = match self.call_index().get(call_sid) {
            Some(sid) => sid.clone(),
            None => return false,
        };
        self.get(&stream_sid).map(|s| s.is_ending()).unwrap_or(false)
    }

    pub fn set_caller_info(&self, stream_sid: &str, caller: CallerInfo) {
        let session = self.get_or_create(stream_sid);
        session.lock().caller = Some(caller);
    }

    /// Record the dialog step the thread last settled on
    pub fn set_dialog_state(&self, stream_sid: &str, step: &str) {
        let session = self.get_or_create(stream_sid);
        session.lock().dialog_step = Some(step.to_string());
    }

    pub fn set_preloaded_appointments(&self, stream_sid: &str, appointments: Vec<Appointment>) {
        let session = self.get_or_create(stream_sid);
        session.lock().preloaded_appointments = appointments;
    }

    pub fn set_delay_data(&self, stream_sid: &str, delay: DelayData) {
        let session = self.get_or_create(stream_sid);
        session.lock().delay_data = Some(delay);
    }

    pub fn set_immediate_callback(&self, stream_sid: &str, value: bool) {
        let session = self.get_or_create(stream_sid);
        session.lock().immediate_callback = value;
    }

    /// Stash delay data for an outbound leg before its media stream exists
    pub fn stash_outbound_delay(&self, call_sid: &str, delay: DelayData) {
        self.inner
            .pending_outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(call_sid.to_string(), delay);
    }

    /// Claim stashed delay data when the outbound leg's stream starts
    pub fn take_outbound_delay(&self, call_sid: &str) -> Option<DelayData> {
        self.inner
            .pending_outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(call_sid)
    }

    /// Clean up a session. An ending session whose connection closed defers
    /// destruction by the grace window so a carrier retry with the same call
    /// sid is refused instead of resurrecting the dialog. Unknown stream
    /// sids are a no-op.
    pub fn cleanup(&self, stream_sid: &str, reason: CleanupReason) {
        let session = match self.get(stream_sid) {
            Some(s) => s,
            None => return,
        };

        if session.is_ending() && reason == CleanupReason::ConnectionClosed {
            let grace = Duration::from_secs(self.inner.config.ending_grace_secs);
            info!(
                stream_sid,
                "Session ending, deferring destruction by {:?}", grace
            );
            let registry = self.clone();
            let sid = stream_sid.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                registry.destroy(&sid, reason);
            });
        } else {
            self.destroy(stream_sid, reason);
        }
    }

    fn destroy(&self, stream_sid: &str, reason: CleanupReason) {
        let session = match self.sessions().remove(stream_sid) {
            Some(s) => s,
            None => return,
        };

        if let Some(call_sid) = session.call_sid() {
            self.call_index().remove(&call_sid);
        }

        let teardowns = self
            .inner
            .teardowns
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for teardown in teardowns.iter() {
            teardown(stream_sid);
        }
        drop(teardowns);

        session.destroy();
        info!(stream_sid, ?reason, "Session destroyed");
    }

    /// Destroy everything (process shutdown)
    pub fn shutdown(&self) {
        let sids: Vec<String> = self.sessions().keys().cloned().collect();
        for sid in sids {
            self.destroy(&sid, CleanupReason::Shutdown);
        }
    }

    /// Number of live sessions
    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Background sweeper destroying sessions idle past the threshold
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let interval = Duration::from_secs(registry.inner.config.sweep_interval_mins * 60);
        let idle_limit = Duration::from_secs(registry.inner.config.idle_timeout_mins * 60);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let stale: Vec<String> = registry
                    .sessions()
                    .iter()
                    .filter(|(_, s)| s.idle_for() > idle_limit)
                    .map(|(sid, _)| sid.clone())
                    .collect();
                for sid in stale {
                    warn!(stream_sid = %sid, "Sweeping idle session");
                    registry.cleanup(&sid, CleanupReason::InactivityTimeout);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(grace_secs: u64) -> SessionRegistry {
        SessionRegistry::new(SessionConfig {
            idle_timeout_mins: 10,
            ending_grace_secs: grace_secs,
            sweep_interval_mins: 2,
        })
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = test_registry(10);
        let a = registry.get_or_create("MZ1");
        let b = registry.get_or_create("MZ1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_mutator_on_unknown_stream_creates_session() {
        let registry = test_registry(10);
        registry.set_immediate_callback("MZ9", true);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.get("MZ9").unwrap().immediate_callback());
    }

    #[tokio::test]
    async fn test_cleanup_unknown_is_noop() {
        let registry = test_registry(10);
        registry.cleanup("missing", CleanupReason::ConnectionClosed);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let registry = test_registry(10);
        registry.get_or_create("A");
        registry.get_or_create("B");

        registry.set_dialog_state("A", "collect_date");
        registry.get("A").unwrap().set_language("hi");

        let b = registry.get("B").unwrap();
        assert_eq!(b.dialog_step(), None);
        assert_eq!(b.language(), "en");
        assert_eq!(
            registry.get("A").unwrap().dialog_step().as_deref(),
            Some("collect_date")
        );
    }

    #[tokio::test]
    async fn test_concurrent_mutations_keep_per_session_state() {
        let registry = test_registry(10);
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let sid = format!("S{}", i);
                for step in 0..50 {
                    registry.set_dialog_state(&sid, &format!("step-{}", step));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for i in 0..8 {
            let session = registry.get(&format!("S{}", i)).unwrap();
            assert_eq!(session.dialog_step().as_deref(), Some("step-49"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ending_session_refuses_reconnect_within_grace() {
        let registry = test_registry(10);
        let session = registry.get_or_create("MZ1");
        registry.associate_call_id("MZ1", "CA1");
        session.mark_ending();

        registry.cleanup("MZ1", CleanupReason::ConnectionClosed);

        // Inside the grace window the call sid still resolves and refuses
        assert!(registry.is_call_ending("CA1"));
        assert_eq!(registry.active_count(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert!(!registry.is_call_ending("CA1"));
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_non_ending_close_destroys_immediately() {
        let registry = test_registry(10);
        registry.get_or_create("MZ1");
        registry.cleanup("MZ1", CleanupReason::ConnectionClosed);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_runs_on_destroy() {
        let registry = test_registry(10);
        let hit = Arc::new(AtomicBool::new(false));
        let hit_clone = hit.clone();
        registry.register_teardown(Box::new(move |sid| {
            if sid == "MZ1" {
                hit_clone.store(true, Ordering::SeqCst);
            }
        }));
        registry.get_or_create("MZ1");
        registry.cleanup("MZ1", CleanupReason::ConnectionClosed);
        assert!(hit.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_watch_fires_on_destroy() {
        let registry = test_registry(10);
        let session = registry.get_or_create("MZ1");
        let mut closed = session.closed();
        registry.cleanup("MZ1", CleanupReason::Shutdown);
        closed.changed().await.unwrap();
        assert!(*closed.borrow());
    }

    #[tokio::test]
    async fn test_claim_guards_fire_once() {
        let registry = test_registry(10);
        let session = registry.get_or_create("MZ1");
        assert!(session.claim_greeting());
        assert!(!session.claim_greeting());
        assert!(session.claim_first_media());
        assert!(!session.claim_first_media());
    }

    #[tokio::test]
    async fn test_outbound_delay_stash_roundtrip() {
        let registry = test_registry(10);
        let delay = DelayData::sample();
        registry.stash_outbound_delay("CAout", delay.clone());
        let taken = registry.take_outbound_delay("CAout").unwrap();
        assert_eq!(taken.appointment_id, delay.appointment_id);
        assert!(registry.take_outbound_delay("CAout").is_none());
    }

    #[tokio::test]
    async fn test_idle_session_is_detected() {
        let registry = test_registry(10);
        let session = registry.get_or_create("MZ1");
        session.rewind_activity(Duration::from_secs(11 * 60));
        assert!(session.idle_for() > Duration::from_secs(10 * 60));
    }
}
