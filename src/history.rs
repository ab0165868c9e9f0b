//! Per-room message log with vector-clock tagging and duplicate
//! suppression. The log is the dedup gate for all gossip: a message
//! that fails insertion here must produce no user-visible effect.
use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::protocol::{unix_time_f64, Message, MessageExtra, MessageKind};

/// Logical clock tagging each locally emitted message.
pub struct VectorClock {
    node_id: String,
    clock: Mutex<HashMap<String, u64>>,
}

impl VectorClock {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            clock: Mutex::new(HashMap::from([(node_id.to_string(), 0)])),
        }
    }

    /// Bump own entry and return the post-increment snapshot. The snapshot
    /// is taken inside the same critical section so the pair is atomic.
    pub fn increment(&self) -> HashMap<String, u64> {
        let mut clock = self.clock.lock();
        *clock.entry(self.node_id.clone()).or_insert(0) += 1;
        clock.clone()
    }

    /// Pointwise maximum with a remote clock.
    pub fn merge(&self, other: &HashMap<String, u64>) {
        let mut clock = self.clock.lock();
        for (node, count) in other {
            let entry = clock.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.clock.lock().clone()
    }
}

struct LogInner {
    messages: Vec<Message>,
    seen_ids: HashSet<String>,
}

/// Append-only room history. One mutex covers the list and the seen-id
/// set; the vector clock has its own lock and the two are never nested.
pub struct HistoryLog {
    session_id: String,
    clock: VectorClock,
    inner: Mutex<LogInner>,
}

impl HistoryLog {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            clock: VectorClock::new(session_id),
            inner: Mutex::new(LogInner {
                messages: Vec::new(),
                seen_ids: HashSet::new(),
            }),
        }
    }

    /// Record a locally emitted message. Increments the clock exactly once
    /// and derives `msg_id` from the post-increment own entry.
    pub fn add_local_message(
        &self,
        kind: MessageKind,
        sender_nickname: &str,
        sender_short_id: &str,
        content: &str,
        extra: MessageExtra,
    ) -> Message {
        let vclock = self.clock.increment();
        let own = vclock.get(&self.session_id).copied().unwrap_or(0);
        let msg = Message {
            kind,
            msg_id: format!("{}_{}", self.session_id, own),
            sender_session: self.session_id.clone(),
            sender_nickname: sender_nickname.to_string(),
            sender_short_id: sender_short_id.to_string(),
            content: content.to_string(),
            timestamp: unix_time_f64(),
            vclock,
            req_id: extra.req_id,
            file_name: extra.file_name,
            file_size: extra.file_size,
            is_zip: extra.is_zip,
            file_sha256: extra.file_sha256,
            downloader_nickname: extra.downloader_nickname,
            downloader_short_id: extra.downloader_short_id,
        };
        let mut inner = self.inner.lock();
        inner.seen_ids.insert(msg.msg_id.clone());
        inner.messages.push(msg.clone());
        msg
    }

    /// Record a message received from a peer. Returns false for duplicates,
    /// in which case nothing changed and no callback may fire.
    pub fn receive_remote_message(&self, msg: &Message) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.seen_ids.contains(&msg.msg_id) {
                return false;
            }
            inner.seen_ids.insert(msg.msg_id.clone());
            inner.messages.push(msg.clone());
            // Stable sort: equal timestamps keep insertion order.
            inner
                .messages
                .sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        }
        // Merge outside the log lock to keep the two locks unnested.
        if !msg.vclock.is_empty() {
            self.clock.merge(&msg.vclock);
        }
        true
    }

    pub fn get_history_snapshot(&self) -> Vec<Message> {
        self.inner.lock().messages.clone()
    }

    pub fn clock_snapshot(&self) -> HashMap<String, u64> {
        self.clock.snapshot()
    }
}
