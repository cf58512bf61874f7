//! Receive and send tracks.
//!
//! A receive track owns the loss bookkeeping for one inbound ssrc: every
//! RTP packet lands in the ring, advances the highest-seen sequence, and
//! files fresh gaps into the NACK list. A send track owns the outbound
//! sequence space for one ssrc and applies the marker policy: video honors
//! the bridge-set marker, audio marks every packet.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::rtp::nack::{NackList, NackOptions, PacketRing, SequenceTracker};
use crate::rtp::{RtpHeader, RtpPacket};

/// Which media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Inbound track state for one ssrc.
pub struct RecvTrack {
    ssrc: u32,
    kind: TrackKind,
    inner: Mutex<RecvInner>,
}

struct RecvInner {
    ring: PacketRing,
    tracker: SequenceTracker,
    nacks: NackList,
}

impl RecvTrack {
    /// Creates a track with the given NACK tuning.
    pub fn new(ssrc: u32, kind: TrackKind, opts: NackOptions, ring_size: usize) -> Arc<Self> {
        Arc::new(Self {
            ssrc,
            kind,
            inner: Mutex::new(RecvInner {
                ring: PacketRing::new(ring_size),
                tracker: SequenceTracker::new(),
                nacks: NackList::new(opts),
            }),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Feeds one received packet.
    ///
    /// Returns `false` for duplicates. Gaps discovered by this arrival are
    /// filed for NACK; a late packet filling a gap clears its entry.
    pub fn on_rtp(&self, pkt: &Arc<RtpPacket>, now: Instant) -> bool {
        let seq = pkt.header.sequence_number;
        let mut inner = self.inner.lock();

        if !inner.ring.set(Arc::clone(pkt)) {
            return false;
        }

        let gaps = inner.tracker.on_seq(seq);
        for gap in gaps {
            inner.nacks.insert(gap, now);
        }
        // Either way this sequence is no longer missing.
        inner.nacks.remove(seq);

        if let Some(highest) = inner.tracker.highest() {
            inner.nacks.evict_below(highest);
        }
        true
    }

    /// Sequences due for a (re)request now.
    pub fn nacks_due(&self, now: Instant) -> Vec<u16> {
        self.inner.lock().nacks.due(now)
    }

    /// Sequences abandoned after exhausting their retry or age budget; a
    /// non-empty result calls for a PLI.
    pub fn nacks_abandoned(&self, now: Instant) -> Vec<u16> {
        self.inner.lock().nacks.abandoned(now)
    }

    /// Currently missing sequences (diagnostics).
    pub fn missing(&self) -> Vec<u16> {
        let inner = self.inner.lock();
        match inner.tracker.highest() {
            Some(highest) => inner.nacks.missing(highest),
            None => Vec::new(),
        }
    }

    /// Fetches a resident packet by sequence.
    pub fn fetch(&self, seq: u16) -> Option<Arc<RtpPacket>> {
        self.inner.lock().ring.get(seq)
    }
}

/// Outbound track state for one ssrc.
pub struct SendTrack {
    ssrc: u32,
    payload_type: u8,
    kind: TrackKind,
    seq: Mutex<u16>,
}

impl SendTrack {
    pub fn new(ssrc: u32, payload_type: u8, kind: TrackKind) -> Self {
        Self {
            ssrc,
            payload_type,
            kind,
            seq: Mutex::new(0),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Builds the next outbound packet.
    ///
    /// Video honors the caller's marker (set by the bridge on the last
    /// packet of a frame); audio closes a frame with every packet.
    pub fn packetize(&self, timestamp: u32, marker: bool, payload: Bytes) -> RtpPacket {
        let seq = {
            let mut guard = self.seq.lock();
            let s = *guard;
            *guard = guard.wrapping_add(1);
            s
        };
        let marker = match self.kind {
            TrackKind::Video => marker,
            TrackKind::Audio => true,
        };
        RtpPacket {
            header: RtpHeader {
                marker,
                payload_type: self.payload_type,
                sequence_number: seq,
                timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload,
        }
    }
}
