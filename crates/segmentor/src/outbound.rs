use std::net::SocketAddr;

use ahash::AHashMap;

use crate::{Error, RequestKey, BUSY_CAP_MS, MAX_PAYLOAD_LEN, MAX_SEGMENTS, MAX_SEGMENT_LEN, TIMEOUT_RETRANS_MS};

/// One outbound fragment of a larger control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub segment_id: u8,
    pub date_time: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

struct OutboundEntry {
    segments: Vec<Segment>,
    /// Set when this side is responsible for resending segment 0 until the
    /// peer answers; cleared on the peer's first response.
    has_ball: bool,
    created_ms: u64,
    last_sent_ms: u64,
}

/// Tracks in-flight outbound segmented requests, one per channel master.
#[derive(Default)]
pub struct OutboundSegmentor {
    entries: AHashMap<RequestKey, OutboundEntry>,
}

impl OutboundSegmentor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `payload` into segments and records a resend-tracking entry
    /// keyed by `peer`/`request_id`. Returns the segments to send now.
    ///
    /// # Test
    ///
    /// ```
    /// use lonip_segmentor::OutboundSegmentor;
    ///
    /// let mut out = OutboundSegmentor::new();
    /// let payload = vec![0x7au8; 1000];
    /// let peer = "127.0.0.1:1628".parse().unwrap();
    ///
    /// let segments = out.build_segments(peer, 1, 1, &payload, 0).unwrap();
    ///
    /// assert_eq!(segments.len(), 3);
    /// assert!(segments.last().unwrap().flags & codec::packet::SEGMENT_FLAG_FINAL != 0);
    /// ```
    pub fn build_segments(
        &mut self,
        peer: SocketAddr,
        request_id: u16,
        date_time: u32,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<Vec<Segment>, Error> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }

        let chunks: Vec<&[u8]> = payload.chunks(MAX_SEGMENT_LEN).collect();
        let chunks = if chunks.is_empty() { vec![&payload[..]] } else { chunks };

        if chunks.len() > MAX_SEGMENTS {
            return Err(Error::TooManySegments);
        }

        let last = chunks.len() - 1;
        let segments: Vec<Segment> = chunks
            .into_iter()
            .enumerate()
            .map(|(id, chunk)| {
                let mut flags = codec::packet::SEGMENT_FLAG_VALID;
                if id == last {
                    flags |= codec::packet::SEGMENT_FLAG_FINAL;
                }

                Segment {
                    segment_id: id as u8,
                    date_time,
                    flags,
                    payload: chunk.to_vec(),
                }
            })
            .collect();

        self.entries.insert(
            RequestKey { peer, request_id },
            OutboundEntry {
                segments: segments.clone(),
                has_ball: true,
                created_ms: now_ms,
                last_sent_ms: now_ms,
            },
        );

        Ok(segments)
    }

    /// Peer acknowledged (via a segment request or a RESPONSE) — clears the
    /// resend obligation for this request.
    pub fn on_peer_response(&mut self, peer: SocketAddr, request_id: u16) {
        if let Some(entry) = self.entries.get_mut(&RequestKey { peer, request_id }) {
            entry.has_ball = false;
        }
    }

    /// Returns the segments the peer asked for, from `from_segment_id`
    /// onward (the resolved reading of `reason = REQUEST_ALL`).
    pub fn segments_from(&self, peer: SocketAddr, request_id: u16, from_segment_id: u8) -> Vec<Segment> {
        self.entries
            .get(&RequestKey { peer, request_id })
            .map(|entry| {
                entry
                    .segments
                    .iter()
                    .filter(|s| s.segment_id >= from_segment_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove(&mut self, peer: SocketAddr, request_id: u16) {
        self.entries.remove(&RequestKey { peer, request_id });
    }

    /// Once-a-second driver: resends segment 0 for entries still holding
    /// the ball past `TIMEOUT_RETRANS_MS`, and discards entries past the
    /// busy cap.
    pub fn tick(&mut self, now_ms: u64) -> Vec<(SocketAddr, u16, Segment)> {
        let mut resend = Vec::new();

        self.entries.retain(|key, entry| {
            if now_ms.saturating_sub(entry.created_ms) >= BUSY_CAP_MS {
                return false;
            }

            if entry.has_ball && now_ms.saturating_sub(entry.last_sent_ms) >= TIMEOUT_RETRANS_MS {
                if let Some(first) = entry.segments.first() {
                    resend.push((key.peer, key.request_id, first.clone()));
                }
                entry.last_sent_ms = now_ms;
            }

            true
        });

        resend
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
