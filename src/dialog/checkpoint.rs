//! Per-thread dialog checkpoints
//!
//! The store maps thread ids to serializable checkpoint records. The
//! checkpoint is only mutated through the graph's transition function, and
//! concurrent invocations on one thread serialize on that thread's lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::DialogStep;

/// Serializable dialog state for one thread
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialogCheckpoint {
    /// Most recent inbound transcript
    pub transcript: String,
    /// Bounded ring of recent turns, oldest first
    pub conversation_history: Vec<String>,
    pub intent: Option<String>,
    pub current_step: DialogStep,
    pub date: Option<String>,
    pub date_iso: Option<String>,
    pub time: Option<String>,
    pub end_time: Option<String>,
    pub duration_hours: Option<u32>,
    pub additional_details: Option<String>,
    pub meeting_requested: bool,
    pub confirmed: bool,
    pub appointment_complete: bool,
}

impl Default for DialogCheckpoint {
    fn default() -> Self {
        Self {
            transcript: String::new(),
            conversation_history: Vec::new(),
            intent: None,
            current_step: DialogStep::Greeting,
            date: None,
            date_iso: None,
            time: None,
            end_time: None,
            duration_hours: None,
            additional_details: None,
            meeting_requested: false,
            confirmed: false,
            appointment_complete: false,
        }
    }
}

impl DialogCheckpoint {
    /// Clear the booking slots when the caller starts another appointment
    pub fn reset_slots(&mut self) {
        self.date = None;
        self.date_iso = None;
        self.time = None;
        self.end_time = None;
        self.duration_hours = None;
        self.additional_details = None;
        self.confirmed = false;
        self.appointment_complete = false;
    }
}

/// History reducer: append entries, then keep only the `limit` most recent
pub fn append_history<I>(checkpoint: &mut DialogCheckpoint, entries: I, limit: usize)
where
    I: IntoIterator<Item = String>,
{
    checkpoint.conversation_history.extend(entries);
    let len = checkpoint.conversation_history.len();
    if len > limit {
        checkpoint.conversation_history.drain(..len - limit);
    }
}

/// Thread id → checkpoint, with a per-thread async lock for serialization
pub struct CheckpointStore {
    threads: Mutex<HashMap<String, Arc<tokio::sync::Mutex<DialogCheckpoint>>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the checkpoint cell for a thread. Callers lock the
    /// returned cell for the whole read-transition-write cycle.
    pub fn entry(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<DialogCheckpoint>> {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(DialogCheckpoint::default())))
            .clone()
    }

    /// Drop a thread's state (session teardown)
    pub fn remove(&self, thread_id: &str) {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.remove(thread_id);
    }

    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_never_exceeds_bound() {
        let mut checkpoint = DialogCheckpoint::default();
        for i in 0..100 {
            append_history(&mut checkpoint, [format!("turn {}", i)], 20);
            assert!(checkpoint.conversation_history.len() <= 20);
        }
        assert_eq!(checkpoint.conversation_history.len(), 20);
        assert_eq!(checkpoint.conversation_history[0], "turn 80");
        assert_eq!(checkpoint.conversation_history[19], "turn 99");
    }

    #[test]
    fn test_history_accepts_sequences() {
        let mut checkpoint = DialogCheckpoint::default();
        append_history(
            &mut checkpoint,
            ["user: hi".to_string(), "agent: hello".to_string()],
            10,
        );
        assert_eq!(checkpoint.conversation_history.len(), 2);
    }

    #[test]
    fn test_checkpoint_roundtrips_through_serde() {
        let mut checkpoint = DialogCheckpoint::default();
        checkpoint.current_step = DialogStep::CollectTime;
        checkpoint.date = Some("tomorrow".to_string());
        checkpoint.meeting_requested = true;

        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: DialogCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn test_reset_slots_keeps_history() {
        let mut checkpoint = DialogCheckpoint::default();
        append_history(&mut checkpoint, ["turn".to_string()], 10);
        checkpoint.date = Some("tomorrow".to_string());
        checkpoint.time = Some("11 AM".to_string());
        checkpoint.appointment_complete = true;

        checkpoint.reset_slots();
        assert!(checkpoint.date.is_none());
        assert!(checkpoint.time.is_none());
        assert!(!checkpoint.appointment_complete);
        assert_eq!(checkpoint.conversation_history.len(), 1);
    }

    #[tokio::test]
    async fn test_store_entry_is_shared_per_thread() {
        let store = CheckpointStore::new();
        let a = store.entry("t1");
        let b = store.entry("t1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.thread_count(), 1);

        store.remove("t1");
        assert_eq!(store.thread_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_threads_do_not_interfere() {
        let store = Arc::new(CheckpointStore::new());
        let mut handles = Vec::new();

        for t in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let thread_id = format!("thread-{}", t);
                for i in 0..25 {
                    let cell = store.entry(&thread_id);
                    let mut checkpoint = cell.lock().await;
                    append_history(&mut checkpoint, [format!("{}:{}", t, i)], 20);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for t in 0..4 {
            let cell = store.entry(&format!("thread-{}", t));
            let checkpoint = cell.lock().await;
            // Only this thread's entries, bounded to the most recent 20
            assert_eq!(checkpoint.conversation_history.len(), 20);
            assert!(checkpoint
                .conversation_history
                .iter()
                .all(|e| e.starts_with(&format!("{}:", t))));
            assert_eq!(
                checkpoint.conversation_history.last().unwrap(),
                &format!("{}:24", t)
            );
        }
    }
}
