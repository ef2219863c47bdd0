use std::net::SocketAddr;

use ahash::AHashMap;

use crate::{RequestKey, BUSY_CAP_MS, MAX_SEGMENTS, QUIET_TIMEOUT_MS, TIMEOUT_RETRANS_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Request is not yet complete; more segments needed.
    Pending,
    /// A duplicate of an already-filled slot; nothing changed.
    Duplicate,
    /// Reassembly finished; returned exactly once per completed request.
    Assembled(Vec<u8>),
}

struct InboundEntry {
    date_time: u32,
    slots: Vec<Option<Vec<u8>>>,
    final_id: Option<u8>,
    delivered: bool,
    created_ms: u64,
    last_activity_ms: u64,
    last_gap_request_ms: u64,
}

impl InboundEntry {
    fn new(date_time: u32, now_ms: u64) -> Self {
        Self {
            date_time,
            slots: Vec::new(),
            final_id: None,
            delivered: false,
            created_ms: now_ms,
            last_activity_ms: now_ms,
            last_gap_request_ms: 0,
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.slots.len() < len {
            self.slots.resize(len, None);
        }
    }

    fn is_complete(&self) -> bool {
        match self.final_id {
            Some(final_id) => {
                self.slots.len() == final_id as usize + 1 && self.slots.iter().all(Option::is_some)
            }
            None => false,
        }
    }

    fn lowest_missing(&self) -> Option<u8> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(|idx| idx as u8)
    }

    fn assemble(&self) -> Vec<u8> {
        self.slots.iter().flat_map(|s| s.clone().unwrap()).collect()
    }
}

/// Tracks in-flight inbound segmented requests, one per channel master.
#[derive(Default)]
pub struct InboundSegmentor {
    entries: AHashMap<RequestKey, InboundEntry>,
}

impl InboundSegmentor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one received segment into the reassembly state machine.
    ///
    /// # Test
    ///
    /// ```
    /// use lonip_segmentor::{InboundOutcome, InboundSegmentor};
    ///
    /// let mut inb = InboundSegmentor::new();
    /// let peer = "127.0.0.1:1628".parse().unwrap();
    ///
    /// let a = inb.on_segment(peer, 1, 0, 0, 0x80, b"hello ", 0);
    /// assert_eq!(a, InboundOutcome::Pending);
    ///
    /// let b = inb.on_segment(peer, 1, 1, 0, 0x80 | 0x40, b"world", 10);
    /// assert_eq!(b, InboundOutcome::Assembled(b"hello world".to_vec()));
    /// ```
    pub fn on_segment(
        &mut self,
        peer: SocketAddr,
        request_id: u16,
        segment_id: u8,
        date_time: u32,
        flags: u8,
        payload: &[u8],
        now_ms: u64,
    ) -> InboundOutcome {
        if segment_id as usize >= MAX_SEGMENTS {
            return InboundOutcome::Duplicate;
        }

        let key = RequestKey { peer, request_id };

        let supersede = self
            .entries
            .get(&key)
            .is_some_and(|e| date_time > e.date_time);

        if supersede {
            self.entries.remove(&key);
        }

        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| InboundEntry::new(date_time, now_ms));

        if date_time < entry.date_time {
            // Stale segment for a superseded dateTime; drop silently.
            return InboundOutcome::Duplicate;
        }

        entry.ensure_len(segment_id as usize + 1);

        if entry.slots[segment_id as usize].is_some() {
            return InboundOutcome::Duplicate;
        }

        entry.slots[segment_id as usize] = Some(payload.to_vec());
        entry.last_activity_ms = now_ms;

        if flags & codec::packet::SEGMENT_FLAG_FINAL != 0 {
            entry.final_id = Some(segment_id);
        }

        if entry.is_complete() && !entry.delivered {
            entry.delivered = true;
            return InboundOutcome::Assembled(entry.assemble());
        }

        InboundOutcome::Pending
    }

    /// Once-a-second driver: expires entries past quiet-time or busy-cap,
    /// and reports entries that need a gap-fill request after
    /// `TIMEOUT_RETRANS_MS` of no progress.
    pub fn tick(&mut self, now_ms: u64) -> Vec<(SocketAddr, u16, u8)> {
        let mut gap_requests = Vec::new();

        self.entries.retain(|key, entry| {
            if now_ms.saturating_sub(entry.created_ms) >= BUSY_CAP_MS {
                return false;
            }

            if now_ms.saturating_sub(entry.last_activity_ms) >= QUIET_TIMEOUT_MS {
                return false;
            }

            if !entry.is_complete()
                && now_ms.saturating_sub(entry.last_activity_ms) >= TIMEOUT_RETRANS_MS
                && now_ms.saturating_sub(entry.last_gap_request_ms) >= TIMEOUT_RETRANS_MS
            {
                if let Some(missing) = entry.lowest_missing() {
                    gap_requests.push((key.peer, key.request_id, missing));
                    entry.last_gap_request_ms = now_ms;
                }
            }

            true
        });

        gap_requests
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
