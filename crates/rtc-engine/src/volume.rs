//! Speaker volume aggregation and active speaker detection.
//!
//! Raw PCM frames are reduced to a 0-255 level per participant. Each report
//! window keeps the peak level per participant. Only participants above the
//! silence floor are reported; someone who stopped speaking simply drops out
//! of the next report.
//!
//! The active speaker is the arg-max of an exponentially smoothed level.
//! The smoothing factor `smooth` (0-10) maps to `alpha = (smooth + 1) / 11`:
//! a larger value reacts faster to a new loudest speaker.

use common::types::Uid;
use serde::Serialize;
use std::collections::HashMap;

/// Levels at or below this are silence.
pub const SILENCE_FLOOR: u8 = 10;

/// Highest accepted smoothing factor.
pub const MAX_SMOOTH: u8 = 10;

/// Recommended smoothing factor.
pub const DEFAULT_SMOOTH: u8 = 3;

/// Smoothed levels below this are dropped from tracking.
const FORGET_BELOW: f64 = 0.5;

/// One speaker in a volume report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpeakerVolume {
    /// `Uid::LOCAL` for the local user.
    pub uid: Uid,
    pub volume: u8,
}

/// Output of one report window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRound {
    /// Speakers above the silence floor, ordered by uid.
    pub speakers: Vec<SpeakerVolume>,
    /// Mixed level of all speakers.
    pub total: u8,
    /// Set when the active speaker changed this window.
    pub active_speaker_changed: Option<Uid>,
}

/// RMS level of one frame, scaled to 0-255.
#[must_use]
pub fn frame_level(samples: &[i16]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|s| {
            let v = f64::from(*s);
            v * v
        })
        .sum();
    // Frame lengths are far below 2^53.
    #[allow(clippy::cast_precision_loss)]
    let rms = (sum_squares / samples.len() as f64).sqrt();
    scale(rms / f64::from(i16::MAX) * 255.0)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale(level: f64) -> u8 {
    // Clamped to the u8 range first.
    level.round().clamp(0.0, 255.0) as u8
}

/// Aggregates frames between report ticks.
#[derive(Debug)]
pub struct VolumeAggregator {
    alpha: f64,
    window_peaks: HashMap<Uid, u8>,
    smoothed: HashMap<Uid, f64>,
    active_speaker: Option<Uid>,
}

impl VolumeAggregator {
    #[must_use]
    pub fn new(smooth: u8) -> Self {
        let smooth = smooth.min(MAX_SMOOTH);
        Self {
            alpha: (f64::from(smooth) + 1.0) / 11.0,
            window_peaks: HashMap::new(),
            smoothed: HashMap::new(),
            active_speaker: None,
        }
    }

    #[must_use]
    pub fn active_speaker(&self) -> Option<Uid> {
        self.active_speaker
    }

    pub fn push_frame(&mut self, uid: Uid, samples: &[i16]) {
        let level = frame_level(samples);
        let peak = self.window_peaks.entry(uid).or_insert(0);
        *peak = (*peak).max(level);
    }

    /// Close the current window.
    pub fn report(&mut self) -> VolumeRound {
        let peaks = std::mem::take(&mut self.window_peaks);

        let mut speakers: Vec<SpeakerVolume> = peaks
            .iter()
            .filter(|(_, level)| **level > SILENCE_FLOOR)
            .map(|(uid, level)| SpeakerVolume {
                uid: *uid,
                volume: *level,
            })
            .collect();
        speakers.sort_by_key(|s| s.uid);

        let energy: f64 = speakers
            .iter()
            .map(|s| {
                let v = f64::from(s.volume);
                v * v
            })
            .sum();
        let total = scale(energy.sqrt());

        // Participants with no frames this window decay toward silence.
        for (uid, smoothed) in &mut self.smoothed {
            let level = f64::from(peaks.get(uid).copied().unwrap_or(0));
            *smoothed += self.alpha * (level - *smoothed);
        }
        for (uid, level) in &peaks {
            self.smoothed
                .entry(*uid)
                .or_insert_with(|| self.alpha * f64::from(*level));
        }
        self.smoothed.retain(|_, level| *level >= FORGET_BELOW);

        let loudest = self
            .smoothed
            .iter()
            .filter(|(_, level)| **level > f64::from(SILENCE_FLOOR))
            .max_by(|(a_uid, a), (b_uid, b)| a.total_cmp(b).then_with(|| b_uid.cmp(a_uid)))
            .map(|(uid, _)| *uid);

        let active_speaker_changed = match loudest {
            Some(uid) if self.active_speaker != Some(uid) => {
                self.active_speaker = Some(uid);
                Some(uid)
            }
            _ => None,
        };

        VolumeRound {
            speakers,
            total,
            active_speaker_changed,
        }
    }

    pub fn forget(&mut self, uid: Uid) {
        self.window_peaks.remove(&uid);
        self.smoothed.remove(&uid);
        if self.active_speaker == Some(uid) {
            self.active_speaker = None;
        }
    }

    pub fn clear(&mut self) {
        self.window_peaks.clear();
        self.smoothed.clear();
        self.active_speaker = None;
    }
}
