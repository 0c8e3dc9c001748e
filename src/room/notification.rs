//! Outbound notification queue.
//!
//! Pipeline worker threads produce; the manager's tick consumes. The
//! queue is the only piece of state shared across threads, guarded by a
//! single mutex, and a drain is total: everything enqueued before the
//! tick leaves with it.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// One outbound signalling notification awaiting the manager's drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomNotification {
    /// `pcm_data` or `tts_opus_data`.
    pub method: &'static str,
    pub room_id: String,
    pub user_id: String,
    /// Base64 payload: PCM inbound, Opus outbound.
    pub msg_b64: String,
    /// Utterance counter on the TTS path; 0 means absent.
    pub task_index: u64,
}

#[derive(Debug, Default)]
pub struct NotificationQueue {
    inner: Mutex<VecDeque<RoomNotification>>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: RoomNotification) {
        self.inner.lock().push_back(notification);
    }

    /// Take everything currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<RoomNotification> {
        let mut inner = self.inner.lock();
        inner.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn note(room: &str, n: u64) -> RoomNotification {
        RoomNotification {
            method: "pcm_data",
            room_id: room.to_string(),
            user_id: "U".to_string(),
            msg_b64: n.to_string(),
            task_index: 0,
        }
    }

    #[test]
    fn drain_is_total_and_fifo() {
        let q = NotificationQueue::new();
        for i in 0..10 {
            q.push(note("R", i));
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 10);
        assert!(q.is_empty());
        for (i, n) in drained.iter().enumerate() {
            assert_eq!(n.msg_b64, i.to_string());
        }
    }

    #[test]
    fn drain_on_empty_queue_is_empty() {
        let q = NotificationQueue::new();
        assert!(q.drain().is_empty());
    }

    #[test]
    fn concurrent_producers_never_lose_entries() {
        let q = Arc::new(NotificationQueue::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    q.push(note(&format!("R{t}"), i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut total = 0;
        loop {
            let batch = q.drain();
            if batch.is_empty() {
                break;
            }
            total += batch.len();
        }
        assert_eq!(total, 1000);
    }
}
