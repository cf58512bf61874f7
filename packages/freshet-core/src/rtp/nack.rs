//! Receiver-side loss bookkeeping.
//!
//! [`SequenceTracker`] advances the highest-seen sequence and reports gaps;
//! [`NackList`] holds the currently missed sequences with age and retry
//! counters and decides which are due for a (re)request and which should be
//! abandoned in favor of a keyframe request. [`PacketRing`] is the bounded
//! reorder/dedup ring of recently received packets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::rtp::packet::{seq_distance, seq_newer, RtpPacket};

/// Tuning for the NACK list.
#[derive(Debug, Clone, Copy)]
pub struct NackOptions {
    /// Maximum (re)requests per sequence before abandoning it.
    pub max_retries: u32,
    /// Delay before the first request of a fresh gap.
    pub first_interval: Duration,
    /// Minimum delay between requests of the same sequence.
    pub retry_interval: Duration,
    /// Entries older than this are abandoned regardless of retries.
    pub max_age: Duration,
    /// Sequences further than this behind the highest-seen are evicted.
    pub window: u16,
}

impl Default for NackOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            first_interval: Duration::from_millis(10),
            retry_interval: Duration::from_millis(50),
            max_age: Duration::from_millis(1000),
            window: 512,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NackEntry {
    inserted_at: Instant,
    last_request_at: Option<Instant>,
    retries: u32,
}

/// The currently missed sequences.
pub struct NackList {
    opts: NackOptions,
    entries: HashMap<u16, NackEntry>,
}

impl NackList {
    /// Creates an empty list.
    pub fn new(opts: NackOptions) -> Self {
        Self {
            opts,
            entries: HashMap::new(),
        }
    }

    /// Registers a missed sequence.
    pub fn insert(&mut self, seq: u16, now: Instant) {
        self.entries.entry(seq).or_insert(NackEntry {
            inserted_at: now,
            last_request_at: None,
            retries: 0,
        });
    }

    /// Removes a sequence that has been recovered.
    pub fn remove(&mut self, seq: u16) {
        self.entries.remove(&seq);
    }

    /// Whether the sequence is currently considered missing.
    pub fn contains(&self, seq: u16) -> bool {
        self.entries.contains_key(&seq)
    }

    /// Currently missed sequences, in wire order relative to `highest`.
    pub fn missing(&self, highest: u16) -> Vec<u16> {
        let mut seqs: Vec<u16> = self.entries.keys().copied().collect();
        seqs.sort_by_key(|s| u16::MAX - seq_distance(highest, *s));
        seqs
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is missing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequences due for a (re)request, marking them requested.
    pub fn due(&mut self, now: Instant) -> Vec<u16> {
        let mut due = Vec::new();
        for (seq, entry) in self.entries.iter_mut() {
            let ready = match entry.last_request_at {
                None => now.duration_since(entry.inserted_at) >= self.opts.first_interval,
                Some(last) => now.duration_since(last) >= self.opts.retry_interval,
            };
            if ready && entry.retries < self.opts.max_retries {
                entry.last_request_at = Some(now);
                entry.retries += 1;
                due.push(*seq);
            }
        }
        due.sort_unstable();
        due
    }

    /// Removes and returns sequences past their retry or age budget.
    ///
    /// The caller escalates to a PLI when this is non-empty.
    pub fn abandoned(&mut self, now: Instant) -> Vec<u16> {
        let opts = self.opts;
        let mut gone = Vec::new();
        self.entries.retain(|seq, entry| {
            let dead = entry.retries >= opts.max_retries
                || now.duration_since(entry.inserted_at) >= opts.max_age;
            if dead {
                gone.push(*seq);
            }
            !dead
        });
        gone.sort_unstable();
        gone
    }

    /// Evicts entries that fell out of the window behind `highest`.
    pub fn evict_below(&mut self, highest: u16) {
        let window = self.opts.window;
        self.entries
            .retain(|seq, _| seq_distance(highest, *seq) <= window);
    }
}

/// Highest-seen tracker that reports fresh gaps.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    highest: Option<u16>,
}

impl SequenceTracker {
    /// Creates a tracker with nothing seen.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest sequence seen so far.
    pub fn highest(&self) -> Option<u16> {
        self.highest
    }

    /// Feeds one received sequence.
    ///
    /// Returns the gap sequences newly discovered by this arrival: empty for
    /// in-order, duplicate or late packets.
    pub fn on_seq(&mut self, seq: u16) -> Vec<u16> {
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            return Vec::new();
        };

        if !seq_newer(seq, highest) {
            // Duplicate or reordered late arrival.
            return Vec::new();
        }

        let mut gaps = Vec::new();
        let mut cursor = highest.wrapping_add(1);
        while cursor != seq {
            gaps.push(cursor);
            cursor = cursor.wrapping_add(1);
        }
        self.highest = Some(seq);
        gaps
    }
}

/// Bounded ring of received packets indexed by sequence.
///
/// Detects duplicates and serves reordered reads; eviction is implicit as
/// newer sequences overwrite the slot modulo the ring size.
pub struct PacketRing {
    slots: Vec<Option<(u16, Arc<RtpPacket>)>>,
}

impl PacketRing {
    /// Creates a ring with the given capacity.
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size.max(1)],
        }
    }

    fn index(&self, seq: u16) -> usize {
        seq as usize % self.slots.len()
    }

    /// Stores a packet; returns false for a duplicate of the slot's current
    /// occupant.
    pub fn set(&mut self, pkt: Arc<RtpPacket>) -> bool {
        let seq = pkt.header.sequence_number;
        let idx = self.index(seq);
        if let Some((existing, _)) = &self.slots[idx] {
            if *existing == seq {
                return false;
            }
        }
        self.slots[idx] = Some((seq, pkt));
        true
    }

    /// Fetches the packet with exactly this sequence, if still resident.
    pub fn get(&self, seq: u16) -> Option<Arc<RtpPacket>> {
        let idx = self.index(seq);
        match &self.slots[idx] {
            Some((s, pkt)) if *s == seq => Some(Arc::clone(pkt)),
            _ => None,
        }
    }
}
