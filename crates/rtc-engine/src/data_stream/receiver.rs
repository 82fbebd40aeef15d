//! Receive side of data streams.
//!
//! Ordered streams are delivered in sequence order per (sender, stream). A
//! gap is waited on for the delivery timeout; after that the missing
//! sequence numbers are skipped and reported as missed. Sequence numbers
//! wrap, so ordering uses serial-number arithmetic.
//!
//! A sender that joins mid-session numbers its streams from 0. Senders
//! already present when we joined may be mid-stream, so the first frame seen
//! sets the baseline and anything older than it is reported, not delivered.
//!
//! Messages from a sender already marked offline are parked in a bounded
//! per-sender cache. If the sender comes back the cache is replayed; if the
//! timeout passes first, the cache is dropped and reported.

use crate::transport::InboundData;
use bytes::Bytes;
use common::types::{DataStreamId, Uid};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Half the sequence space: the comparison horizon for wrapping sequences.
const SERIAL_HALF: u32 = 1 << 31;

/// `a` comes before `b` in wrapping sequence order.
fn seq_before(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < SERIAL_HALF
}

/// What the receiver hands to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Deliver {
        uid: Uid,
        stream_id: DataStreamId,
        payload: Bytes,
    },
    Failed {
        uid: Uid,
        stream_id: DataStreamId,
        missed: u32,
        cached: u32,
    },
}

#[derive(Debug, Default)]
struct Pushed {
    ready: Vec<Bytes>,
    /// Frames older than the stream's baseline: never deliverable in order.
    rejected: u32,
}

#[derive(Debug)]
struct OrderedBuffer {
    /// Baseline while it is still comparable with `next_expected`.
    first: Option<u32>,
    next_expected: u32,
    pending: BTreeMap<u32, Bytes>,
    gap_since: Option<Instant>,
}

impl OrderedBuffer {
    fn starting_at(sequence: u32) -> Self {
        Self {
            first: Some(sequence),
            next_expected: sequence,
            pending: BTreeMap::new(),
            gap_since: None,
        }
    }

    fn push(&mut self, sequence: u32, payload: Bytes, now: Instant) -> Pushed {
        if seq_before(sequence, self.next_expected) {
            let rejected = u32::from(
                self.first
                    .is_some_and(|first| seq_before(sequence, first)),
            );
            // Otherwise a duplicate, or inside a gap already reported.
            return Pushed {
                ready: Vec::new(),
                rejected,
            };
        }
        self.pending.insert(sequence, payload);
        let ready = self.drain_ready();
        self.gap_since = if self.pending.is_empty() {
            None
        } else {
            Some(self.gap_since.unwrap_or(now))
        };
        Pushed { ready, rejected: 0 }
    }

    fn drain_ready(&mut self) -> Vec<Bytes> {
        let mut ready = Vec::new();
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            ready.push(payload);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        if self
            .first
            .is_some_and(|first| self.next_expected.wrapping_sub(first) >= SERIAL_HALF / 2)
        {
            self.first = None;
        }
        ready
    }

    /// Skip the current gap. Returns the number of skipped sequence numbers
    /// and the messages that became deliverable.
    fn skip_gap(&mut self, now: Instant) -> (u32, Vec<Bytes>) {
        let next = self.next_expected;
        let Some(&first) = self
            .pending
            .keys()
            .min_by_key(|sequence| sequence.wrapping_sub(next))
        else {
            self.gap_since = None;
            return (0, Vec::new());
        };
        let missed = first.wrapping_sub(next);
        self.next_expected = first;
        let ready = self.drain_ready();
        self.gap_since = if self.pending.is_empty() {
            None
        } else {
            Some(now)
        };
        (missed, ready)
    }

    /// Skip every gap: all pending messages become deliverable.
    fn flush(&mut self, now: Instant) -> (u32, Vec<Bytes>) {
        let mut missed = 0u32;
        let mut ready = Vec::new();
        while !self.pending.is_empty() {
            let (skipped, delivered) = self.skip_gap(now);
            missed = missed.saturating_add(skipped);
            ready.extend(delivered);
        }
        (missed, ready)
    }
}

#[derive(Debug)]
struct OfflineCache {
    since: Instant,
    frames: Vec<InboundData>,
    overflowed: u32,
}

/// Reassembles inbound data streams.
#[derive(Debug)]
pub struct DataReceiver {
    timeout: Duration,
    cache_capacity: usize,
    ordered: HashMap<(Uid, DataStreamId), OrderedBuffer>,
    offline: HashMap<Uid, OfflineCache>,
    /// Senders seen joining during this session: their streams start at 0.
    joined_fresh: HashSet<Uid>,
}

impl DataReceiver {
    #[must_use]
    pub fn new(timeout: Duration, cache_capacity: usize) -> Self {
        Self {
            timeout,
            cache_capacity,
            ordered: HashMap::new(),
            offline: HashMap::new(),
            joined_fresh: HashSet::new(),
        }
    }

    pub fn receive(&mut self, frame: InboundData, now: Instant) -> Vec<Inbound> {
        if let Some(cache) = self.offline.get_mut(&frame.uid) {
            if cache.frames.len() >= self.cache_capacity {
                cache.frames.remove(0);
                cache.overflowed += 1;
            }
            debug!(
                target: "rtc.data",
                uid = %frame.uid,
                stream_id = %frame.stream_id,
                cached = cache.frames.len() + 1,
                "Cached message from offline sender"
            );
            cache.frames.push(frame);
            return Vec::new();
        }

        let (uid, stream_id) = (frame.uid, frame.stream_id);
        if !frame.ordered {
            return vec![Inbound::Deliver {
                uid,
                stream_id,
                payload: frame.payload,
            }];
        }

        let baseline = if self.joined_fresh.contains(&uid) {
            0
        } else {
            frame.sequence
        };
        let pushed = self
            .ordered
            .entry((uid, stream_id))
            .or_insert_with(|| OrderedBuffer::starting_at(baseline))
            .push(frame.sequence, frame.payload, now);

        let mut out = Vec::with_capacity(pushed.ready.len() + 1);
        if pushed.rejected > 0 {
            debug!(
                target: "rtc.data",
                uid = %uid,
                stream_id = %stream_id,
                sequence = frame.sequence,
                "Message older than the stream baseline"
            );
            out.push(Inbound::Failed {
                uid,
                stream_id,
                missed: pushed.rejected,
                cached: 0,
            });
        }
        out.extend(pushed.ready.into_iter().map(|payload| Inbound::Deliver {
            uid,
            stream_id,
            payload,
        }));
        out
    }

    /// A sender went offline: close out its ordered streams and start
    /// caching. Open gaps are skipped and reported as missed.
    pub fn peer_offline(&mut self, uid: Uid, now: Instant) -> Vec<Inbound> {
        self.joined_fresh.remove(&uid);
        self.offline.entry(uid).or_insert(OfflineCache {
            since: now,
            frames: Vec::new(),
            overflowed: 0,
        });

        let mut keys: Vec<(Uid, DataStreamId)> = self
            .ordered
            .keys()
            .filter(|(owner, _)| *owner == uid)
            .copied()
            .collect();
        keys.sort();

        let mut out = Vec::new();
        for key in keys {
            let Some(mut buffer) = self.ordered.remove(&key) else {
                continue;
            };
            let (missed, ready) = buffer.flush(now);
            if missed > 0 {
                out.push(Inbound::Failed {
                    uid,
                    stream_id: key.1,
                    missed,
                    cached: 0,
                });
            }
            out.extend(ready.into_iter().map(|payload| Inbound::Deliver {
                uid,
                stream_id: key.1,
                payload,
            }));
        }
        out
    }

    /// A sender joined the channel: its streams start over at 0. Anything
    /// cached while it was away is replayed through the normal path.
    pub fn peer_online(&mut self, uid: Uid, now: Instant) -> Vec<Inbound> {
        self.joined_fresh.insert(uid);
        let Some(cache) = self.offline.remove(&uid) else {
            return Vec::new();
        };
        let mut out: Vec<Inbound> = cache
            .frames
            .into_iter()
            .flat_map(|frame| self.receive(frame, now))
            .collect();
        if cache.overflowed > 0 {
            if let Some(stream_id) = out.iter().find_map(|item| match item {
                Inbound::Deliver { stream_id, .. } | Inbound::Failed { stream_id, .. } => {
                    Some(*stream_id)
                }
            }) {
                out.push(Inbound::Failed {
                    uid,
                    stream_id,
                    missed: cache.overflowed,
                    cached: 0,
                });
            }
        }
        out
    }

    /// Resolve gaps and offline caches older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Inbound> {
        let mut out = Vec::new();

        let mut stale_gaps: Vec<(Uid, DataStreamId)> = self
            .ordered
            .iter()
            .filter(|(_, buf)| {
                buf.gap_since
                    .is_some_and(|since| now.duration_since(since) >= self.timeout)
            })
            .map(|(key, _)| *key)
            .collect();
        stale_gaps.sort();

        for (uid, stream_id) in stale_gaps {
            let Some(buffer) = self.ordered.get_mut(&(uid, stream_id)) else {
                continue;
            };
            let (missed, ready) = buffer.skip_gap(now);
            if missed > 0 {
                out.push(Inbound::Failed {
                    uid,
                    stream_id,
                    missed,
                    cached: 0,
                });
            }
            out.extend(ready.into_iter().map(|payload| Inbound::Deliver {
                uid,
                stream_id,
                payload,
            }));
        }

        let mut expired: Vec<Uid> = self
            .offline
            .iter()
            .filter(|(_, cache)| now.duration_since(cache.since) >= self.timeout)
            .map(|(uid, _)| *uid)
            .collect();
        expired.sort();

        for uid in expired {
            let Some(cache) = self.offline.remove(&uid) else {
                continue;
            };
            out.extend(report_dropped_cache(uid, &cache));
        }

        out
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.offline.clear();
        self.joined_fresh.clear();
    }
}

fn report_dropped_cache(uid: Uid, cache: &OfflineCache) -> Vec<Inbound> {
    let mut per_stream: BTreeMap<DataStreamId, (u32, u32)> = BTreeMap::new();
    for frame in &cache.frames {
        per_stream.entry(frame.stream_id).or_default().1 += 1;
    }

    if cache.overflowed > 0 {
        match per_stream.values_mut().next() {
            Some(entry) => entry.0 += cache.overflowed,
            None => debug!(
                target: "rtc.data",
                uid = %uid,
                overflowed = cache.overflowed,
                "Offline cache overflowed with no stream to report on"
            ),
        }
    }

    per_stream
        .into_iter()
        .map(|(stream_id, (missed, cached))| Inbound::Failed {
            uid,
            stream_id,
            missed,
            cached,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn frame(uid: u32, stream: u16, sequence: u32, ordered: bool) -> InboundData {
        InboundData {
            uid: Uid(uid),
            stream_id: DataStreamId(stream),
            sequence,
            reliable: ordered,
            ordered,
            payload: Bytes::from(format!("m{sequence}")),
        }
    }

    fn payloads(out: &[Inbound]) -> Vec<String> {
        out.iter()
            .filter_map(|i| match i {
                Inbound::Deliver { payload, .. } => {
                    Some(String::from_utf8_lossy(payload).into_owned())
                }
                Inbound::Failed { .. } => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_reorders() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        let now = Instant::now();

        assert_eq!(payloads(&rx.receive(frame(7, 1, 0, true), now)), ["m0"]);
        assert!(rx.receive(frame(7, 1, 2, true), now).is_empty());
        assert!(rx.receive(frame(7, 1, 3, true), now).is_empty());
        assert_eq!(
            payloads(&rx.receive(frame(7, 1, 1, true), now)),
            ["m1", "m2", "m3"]
        );
        // Duplicate is dropped.
        assert!(rx.receive(frame(7, 1, 2, true), now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_delivers_immediately() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        let now = Instant::now();

        assert_eq!(payloads(&rx.receive(frame(7, 2, 5, false), now)), ["m5"]);
        assert_eq!(payloads(&rx.receive(frame(7, 2, 3, false), now)), ["m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_skipped_after_timeout() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        rx.receive(frame(7, 1, 0, true), Instant::now());
        rx.receive(frame(7, 1, 3, true), Instant::now());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(rx.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let out = rx.expire(Instant::now());
        assert_eq!(
            out.first(),
            Some(&Inbound::Failed {
                uid: Uid(7),
                stream_id: DataStreamId(1),
                missed: 2,
                cached: 0
            })
        );
        assert_eq!(payloads(&out), ["m3"]);

        // A late straggler from the skipped range is not delivered.
        assert!(rx.receive(frame(7, 1, 1, true), Instant::now()).is_empty());
        assert_eq!(payloads(&rx.receive(frame(7, 1, 4, true), Instant::now())), ["m4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_sender_cache_replayed_on_return() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        rx.receive(frame(7, 1, 0, true), Instant::now());
        rx.receive(frame(7, 1, 1, true), Instant::now());
        assert!(rx.peer_offline(Uid(7), Instant::now()).is_empty());

        // The returning sender numbers from 0 again.
        assert!(rx.receive(frame(7, 1, 0, true), Instant::now()).is_empty());
        assert!(rx.receive(frame(7, 1, 1, true), Instant::now()).is_empty());

        let out = rx.peer_online(Uid(7), Instant::now());
        assert_eq!(payloads(&out), ["m0", "m1"]);
        assert_eq!(payloads(&rx.receive(frame(7, 1, 2, true), Instant::now())), ["m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returning_sender_restarts_at_zero() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        for seq in 0..5 {
            rx.receive(frame(7, 1, seq, true), Instant::now());
        }
        rx.peer_offline(Uid(7), Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rx.peer_online(Uid(7), Instant::now()).is_empty());

        assert_eq!(payloads(&rx.receive(frame(7, 1, 0, true), Instant::now())), ["m0"]);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(rx.expire(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_offline_reports_open_gap() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        rx.receive(frame(7, 1, 0, true), Instant::now());
        rx.receive(frame(7, 1, 2, true), Instant::now());
        rx.receive(frame(7, 1, 3, true), Instant::now());

        let out = rx.peer_offline(Uid(7), Instant::now());
        assert_eq!(
            out.first(),
            Some(&Inbound::Failed {
                uid: Uid(7),
                stream_id: DataStreamId(1),
                missed: 1,
                cached: 0
            })
        );
        assert_eq!(payloads(&out), ["m2", "m3"]);

        tokio::time::advance(TIMEOUT).await;
        assert!(rx.expire(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_sender_stream_waits_for_first_message() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        assert!(rx.peer_online(Uid(7), Instant::now()).is_empty());

        assert!(rx.receive(frame(7, 1, 1, true), Instant::now()).is_empty());
        assert_eq!(
            payloads(&rx.receive(frame(7, 1, 0, true), Instant::now())),
            ["m0", "m1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_older_than_baseline_is_reported() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        assert_eq!(payloads(&rx.receive(frame(7, 1, 1, true), Instant::now())), ["m1"]);

        assert_eq!(
            rx.receive(frame(7, 1, 0, true), Instant::now()),
            vec![Inbound::Failed {
                uid: Uid(7),
                stream_id: DataStreamId(1),
                missed: 1,
                cached: 0
            }]
        );
        // A repeat of something delivered is not an error.
        assert!(rx.receive(frame(7, 1, 1, true), Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_wrap() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        let now = Instant::now();

        assert_eq!(
            payloads(&rx.receive(frame(7, 1, u32::MAX - 1, true), now)),
            [format!("m{}", u32::MAX - 1)]
        );
        assert!(rx.receive(frame(7, 1, 0, true), now).is_empty());
        assert_eq!(
            payloads(&rx.receive(frame(7, 1, u32::MAX, true), now)),
            [format!("m{}", u32::MAX), "m0".to_string()]
        );

        // Past the wrap, gaps are skipped as usual.
        rx.receive(frame(7, 1, 2, true), Instant::now());
        tokio::time::advance(TIMEOUT).await;
        let out = rx.expire(Instant::now());
        assert_eq!(
            out.first(),
            Some(&Inbound::Failed {
                uid: Uid(7),
                stream_id: DataStreamId(1),
                missed: 1,
                cached: 0
            })
        );
        assert_eq!(payloads(&out), ["m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_cache_reported_on_timeout() {
        let mut rx = DataReceiver::new(TIMEOUT, 2);
        rx.receive(frame(7, 1, 0, true), Instant::now());
        rx.peer_offline(Uid(7), Instant::now());
        for seq in 1..=3 {
            rx.receive(frame(7, 1, seq, true), Instant::now());
        }

        tokio::time::advance(TIMEOUT).await;
        let out = rx.expire(Instant::now());

        // Capacity 2: one message overflowed and counts as missed.
        assert_eq!(
            out,
            vec![Inbound::Failed {
                uid: Uid(7),
                stream_id: DataStreamId(1),
                missed: 1,
                cached: 2
            }]
        );
        assert!(rx.peer_online(Uid(7), Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_are_independent() {
        let mut rx = DataReceiver::new(TIMEOUT, 8);
        let now = Instant::now();

        rx.receive(frame(7, 1, 0, true), now);
        rx.receive(frame(7, 1, 2, true), now);
        assert_eq!(payloads(&rx.receive(frame(7, 3, 0, true), now)), ["m0"]);
        assert_eq!(payloads(&rx.receive(frame(8, 1, 9, true), now)), ["m9"]);
    }
}
