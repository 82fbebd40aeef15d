//! Periodic network quality sampling.
//!
//! The monitor turns cumulative transport counters into per-window
//! [`QualitySample`]s. The first observation of any link only records a
//! baseline, so a link's grade stays `Unknown` until one full window has
//! elapsed. A window without traffic is also `Unknown`.

use super::classify::{classify, NetworkQuality};
use crate::transport::{DirectionCounters, TransportCounters};
use common::types::Uid;
use serde::Serialize;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::debug;

/// One classified measurement window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    pub taken_at: Instant,
    pub rtt_ms: u32,
    /// NaN when the window carried no packets.
    pub loss_fraction: f64,
    pub jitter_ms: u32,
    pub grade: NetworkQuality,
}

/// Send and receive grade of one user, as exposed to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkQuality {
    pub tx: NetworkQuality,
    pub rx: NetworkQuality,
}

/// Output of one sampling round.
#[derive(Debug, Clone)]
pub struct QualityRound {
    pub uplink: QualitySample,
    /// Downlink sample per remote peer, ordered by uid.
    pub downlinks: Vec<(Uid, QualitySample)>,
}

impl QualityRound {
    /// Report rows: the local user (uid 0) first, then each peer.
    #[must_use]
    pub fn reports(&self) -> Vec<(Uid, LinkQuality)> {
        let worst_downlink = self
            .downlinks
            .iter()
            .fold(NetworkQuality::Unknown, |acc, (_, s)| acc.worst_known(s.grade));

        let mut rows = Vec::with_capacity(self.downlinks.len() + 1);
        rows.push((
            Uid::LOCAL,
            LinkQuality {
                tx: self.uplink.grade,
                rx: worst_downlink,
            },
        ));
        rows.extend(self.downlinks.iter().map(|(uid, sample)| {
            (
                *uid,
                LinkQuality {
                    tx: NetworkQuality::Unknown,
                    rx: sample.grade,
                },
            )
        }));
        rows
    }
}

#[derive(Debug, Default)]
struct Window {
    previous: Option<DirectionCounters>,
}

impl Window {
    fn sample(&mut self, current: DirectionCounters, now: Instant) -> QualitySample {
        let previous = self.previous.replace(current);

        let loss_fraction = match previous {
            // Counters restarting (new connection) behave like a fresh baseline.
            Some(prev)
                if current.packets >= prev.packets && current.packets_lost >= prev.packets_lost =>
            {
                let delivered = current.packets - prev.packets;
                let lost = current.packets_lost - prev.packets_lost;
                let total = delivered + lost;
                if total == 0 {
                    f64::NAN
                } else {
                    // Packet counts per window are far below 2^53.
                    #[allow(clippy::cast_precision_loss)]
                    let fraction = lost as f64 / total as f64;
                    fraction
                }
            }
            _ => f64::NAN,
        };

        QualitySample {
            taken_at: now,
            rtt_ms: current.rtt_ms,
            loss_fraction,
            jitter_ms: current.jitter_ms,
            grade: classify(
                loss_fraction,
                f64::from(current.rtt_ms),
                f64::from(current.jitter_ms),
            ),
        }
    }
}

/// Samples uplink, per-peer downlink, and the optional last-mile probe.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    uplink: Window,
    downlinks: HashMap<Uid, Window>,
    lastmile: Window,
    latest: HashMap<Uid, LinkQuality>,
}

impl QualityMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample the uplink and the downlink of every peer in `known_peers`.
    ///
    /// History of peers no longer in `known_peers` is dropped.
    pub fn evaluate(
        &mut self,
        counters: &TransportCounters,
        known_peers: &[Uid],
        now: Instant,
    ) -> QualityRound {
        let uplink = self.uplink.sample(counters.uplink, now);

        self.downlinks.retain(|uid, _| known_peers.contains(uid));
        let mut downlinks: Vec<(Uid, QualitySample)> = known_peers
            .iter()
            .filter_map(|uid| {
                counters.downlink.get(uid).map(|c| {
                    let sample = self.downlinks.entry(*uid).or_default().sample(*c, now);
                    (*uid, sample)
                })
            })
            .collect();
        downlinks.sort_by_key(|(uid, _)| *uid);

        let round = QualityRound { uplink, downlinks };
        self.latest = round.reports().into_iter().collect();

        debug!(
            target: "rtc.quality",
            uplink = %round.uplink.grade,
            peers = round.downlinks.len(),
            "Quality sampled"
        );
        round
    }

    /// Grade of one last-mile probe window.
    pub fn sample_lastmile(&mut self, probe: DirectionCounters, now: Instant) -> NetworkQuality {
        self.lastmile.sample(probe, now).grade
    }

    pub fn reset_lastmile(&mut self) {
        self.lastmile = Window::default();
    }

    /// Most recent grade of `uid`; `Unknown` if never sampled.
    #[must_use]
    pub fn quality_of(&self, uid: Uid) -> LinkQuality {
        self.latest.get(&uid).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<Uid, LinkQuality> {
        self.latest.clone()
    }

    pub fn forget(&mut self, uid: Uid) {
        self.downlinks.remove(&uid);
        self.latest.remove(&uid);
    }

    /// Drop all link history. Used on join, rejoin, and leave.
    pub fn reset(&mut self) {
        self.uplink = Window::default();
        self.downlinks.clear();
        self.latest.clear();
    }
}
