//! Publish and subscribe fallback decisions.
//!
//! Two independent toggles, both debounced:
//!
//! - **Publish**: `Normal` <-> `AudioOnly`, driven by the uplink grade.
//! - **Subscribe**, per remote peer: `High` <-> `Low` <-> `AudioOnly`, one rung
//!   per transition, driven by that peer's downlink grade.
//!
//! A transition needs the triggering condition on `debounce_samples`
//! consecutive samples. A sample pointing the other way, or pointing nowhere,
//! restarts the streak. `Unknown` grades freeze the state. The controller
//! never fails; it only returns the transitions the engine must apply.

use super::classify::NetworkQuality;
use common::types::Uid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Fallback policy for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FallbackPolicy {
    /// Never fall back.
    #[default]
    Disabled,
    /// Subscribe only: drop to the low video layer, never to audio only.
    VideoStreamLow,
    /// Drop to audio only under severe degradation.
    AudioOnly,
}

/// Resolution layer of a remote video stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoLayer {
    #[default]
    High,
    Low,
}

/// What is received from one remote peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscribeLevel {
    #[default]
    High,
    Low,
    AudioOnly,
}

impl SubscribeLevel {
    /// The video layer received at this level, if any.
    #[must_use]
    pub const fn layer(self) -> Option<VideoLayer> {
        match self {
            SubscribeLevel::High => Some(VideoLayer::High),
            SubscribeLevel::Low => Some(VideoLayer::Low),
            SubscribeLevel::AudioOnly => None,
        }
    }
}

impl From<VideoLayer> for SubscribeLevel {
    fn from(layer: VideoLayer) -> Self {
        match layer {
            VideoLayer::High => SubscribeLevel::High,
            VideoLayer::Low => SubscribeLevel::Low,
        }
    }
}

/// Local publish state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PublishState {
    #[default]
    Normal,
    AudioOnly,
}

/// A subscribe transition the engine must apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeChange {
    pub uid: Uid,
    pub from: SubscribeLevel,
    pub to: SubscribeLevel,
}

impl SubscribeChange {
    /// `Some(true)` entering audio only, `Some(false)` leaving it.
    #[must_use]
    pub fn fallback_toggle(&self) -> Option<bool> {
        match (self.from, self.to) {
            (SubscribeLevel::AudioOnly, SubscribeLevel::AudioOnly) => None,
            (_, SubscribeLevel::AudioOnly) => Some(true),
            (SubscribeLevel::AudioOnly, _) => Some(false),
            _ => None,
        }
    }

    /// New layer when switching between two video layers.
    #[must_use]
    pub fn layer_switch(&self) -> Option<VideoLayer> {
        match (self.from.layer(), self.to.layer()) {
            (Some(from), Some(to)) if from != to => Some(to),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Degrade,
    Recover,
}

/// Consecutive-sample counter for one toggle.
#[derive(Debug, Default)]
struct Streak {
    direction: Option<Direction>,
    count: u32,
}

impl Streak {
    /// Feed one sample's direction. Returns true once `required` consecutive
    /// samples agree, and starts over.
    fn push(&mut self, direction: Option<Direction>, required: u32) -> bool {
        match direction {
            None => {
                self.reset();
                false
            }
            Some(dir) => {
                if self.direction == Some(dir) {
                    self.count += 1;
                } else {
                    self.direction = Some(dir);
                    self.count = 1;
                }
                if self.count >= required {
                    self.reset();
                    true
                } else {
                    false
                }
            }
        }
    }

    fn reset(&mut self) {
        self.direction = None;
        self.count = 0;
    }
}

#[derive(Debug)]
struct PeerSubscription {
    level: SubscribeLevel,
    streak: Streak,
    dual_stream: bool,
}

/// Fallback state machine for the publish direction and every peer.
#[derive(Debug)]
pub struct QualityController {
    debounce_samples: u32,
    publish_policy: FallbackPolicy,
    subscribe_policy: FallbackPolicy,
    publish: PublishState,
    publish_streak: Streak,
    peers: HashMap<Uid, PeerSubscription>,
    default_layer: VideoLayer,
    preferred_layers: HashMap<Uid, VideoLayer>,
}

impl QualityController {
    #[must_use]
    pub fn new(debounce_samples: u32) -> Self {
        Self {
            debounce_samples: debounce_samples.max(1),
            publish_policy: FallbackPolicy::Disabled,
            subscribe_policy: FallbackPolicy::Disabled,
            publish: PublishState::Normal,
            publish_streak: Streak::default(),
            peers: HashMap::new(),
            default_layer: VideoLayer::High,
            preferred_layers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn publish_state(&self) -> PublishState {
        self.publish
    }

    #[must_use]
    pub fn subscribe_level(&self, uid: Uid) -> Option<SubscribeLevel> {
        self.peers.get(&uid).map(|p| p.level)
    }

    /// Takes effect at the next evaluation.
    pub fn set_publish_policy(&mut self, policy: FallbackPolicy) {
        self.publish_policy = policy;
    }

    /// Takes effect at the next evaluation.
    pub fn set_subscribe_policy(&mut self, policy: FallbackPolicy) {
        self.subscribe_policy = policy;
    }

    /// Publish only honours the audio-only policy.
    fn publish_allows_fallback(&self) -> bool {
        self.publish_policy == FallbackPolicy::AudioOnly
    }

    /// Feed one uplink grade. Returns `Some(is_fallback)` on a transition.
    pub fn evaluate_publish(&mut self, grade: NetworkQuality) -> Option<bool> {
        let required = self.debounce_samples;

        let transition = match self.publish {
            PublishState::Normal => {
                let degrade = self.publish_allows_fallback()
                    && grade.is_known()
                    && grade >= NetworkQuality::Bad;
                self.publish_streak
                    .push(degrade.then_some(Direction::Degrade), required)
                    .then_some(PublishState::AudioOnly)
            }
            PublishState::AudioOnly if !self.publish_allows_fallback() => {
                self.publish_streak.reset();
                Some(PublishState::Normal)
            }
            PublishState::AudioOnly => {
                let recover = grade.is_known() && grade <= NetworkQuality::Good;
                self.publish_streak
                    .push(recover.then_some(Direction::Recover), required)
                    .then_some(PublishState::Normal)
            }
        }?;

        debug!(
            target: "rtc.quality",
            from = ?self.publish,
            to = ?transition,
            grade = %grade,
            "Publish fallback transition"
        );
        self.publish = transition;
        Some(transition == PublishState::AudioOnly)
    }

    /// Return to `Normal` without debouncing, e.g. when the local user stops
    /// broadcasting. Returns `Some(false)` if a recovery happened.
    pub fn reset_publish(&mut self) -> Option<bool> {
        self.publish_streak.reset();
        if self.publish == PublishState::AudioOnly {
            self.publish = PublishState::Normal;
            Some(false)
        } else {
            None
        }
    }

    /// Start tracking a peer at its preferred layer.
    pub fn register_peer(&mut self, uid: Uid, dual_stream: bool) -> SubscribeLevel {
        let level = self.ceiling(uid, dual_stream);
        self.peers.insert(
            uid,
            PeerSubscription {
                level,
                streak: Streak::default(),
                dual_stream,
            },
        );
        level
    }

    pub fn forget_peer(&mut self, uid: Uid) {
        self.peers.remove(&uid);
    }

    /// Drop all peer state. Caller preferences are kept.
    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    /// A peer started or stopped offering a low layer.
    pub fn set_dual_stream(&mut self, uid: Uid, enabled: bool) -> Option<SubscribeChange> {
        let ceiling = self.ceiling(uid, enabled);
        let peer = self.peers.get_mut(&uid)?;
        peer.dual_stream = enabled;
        if !enabled && peer.level == SubscribeLevel::Low {
            peer.streak.reset();
            peer.level = SubscribeLevel::High;
            return Some(SubscribeChange {
                uid,
                from: SubscribeLevel::Low,
                to: SubscribeLevel::High,
            });
        }
        if enabled && ceiling == SubscribeLevel::Low && peer.level == SubscribeLevel::High {
            peer.level = SubscribeLevel::Low;
            return Some(SubscribeChange {
                uid,
                from: SubscribeLevel::High,
                to: SubscribeLevel::Low,
            });
        }
        None
    }

    /// Caller's preferred layer for one peer.
    pub fn set_preferred_layer(&mut self, uid: Uid, layer: VideoLayer) -> Option<SubscribeChange> {
        self.preferred_layers.insert(uid, layer);
        self.apply_preference(uid)
    }

    /// Preferred layer for peers without an explicit preference.
    pub fn set_default_layer(&mut self, layer: VideoLayer) -> Vec<SubscribeChange> {
        self.default_layer = layer;
        let mut uids: Vec<Uid> = self
            .peers
            .keys()
            .filter(|uid| !self.preferred_layers.contains_key(*uid))
            .copied()
            .collect();
        uids.sort();
        uids.into_iter()
            .filter_map(|uid| self.apply_preference(uid))
            .collect()
    }

    fn preferred_layer(&self, uid: Uid) -> VideoLayer {
        self.preferred_layers
            .get(&uid)
            .copied()
            .unwrap_or(self.default_layer)
    }

    /// Best level the peer may be received at.
    fn ceiling(&self, uid: Uid, dual_stream: bool) -> SubscribeLevel {
        if dual_stream && self.preferred_layer(uid) == VideoLayer::Low {
            SubscribeLevel::Low
        } else {
            SubscribeLevel::High
        }
    }

    fn apply_preference(&mut self, uid: Uid) -> Option<SubscribeChange> {
        let dual_stream = self.peers.get(&uid)?.dual_stream;
        let ceiling = self.ceiling(uid, dual_stream);
        let peer = self.peers.get_mut(&uid)?;

        let to = match (peer.level, ceiling) {
            (SubscribeLevel::High, SubscribeLevel::Low) => SubscribeLevel::Low,
            (SubscribeLevel::Low, SubscribeLevel::High) => SubscribeLevel::High,
            _ => return None,
        };
        let change = SubscribeChange {
            uid,
            from: peer.level,
            to,
        };
        peer.level = to;
        peer.streak.reset();
        Some(change)
    }

    /// Feed one downlink grade per peer. Returns the transitions, in input order.
    pub fn evaluate_subscribe(&mut self, grades: &[(Uid, NetworkQuality)]) -> Vec<SubscribeChange> {
        grades
            .iter()
            .filter_map(|(uid, grade)| self.evaluate_peer(*uid, *grade))
            .collect()
    }

    fn evaluate_peer(&mut self, uid: Uid, grade: NetworkQuality) -> Option<SubscribeChange> {
        let policy = self.subscribe_policy;
        let required = self.debounce_samples;
        let dual_stream = self.peers.get(&uid)?.dual_stream;
        let ceiling = self.ceiling(uid, dual_stream);
        let peer = self.peers.get_mut(&uid)?;

        let low_reachable = peer.dual_stream && policy != FallbackPolicy::Disabled;
        let audio_only_allowed = policy == FallbackPolicy::AudioOnly;

        // Policy tightened while degraded: step back up immediately.
        let forced = match peer.level {
            SubscribeLevel::AudioOnly if !audio_only_allowed => {
                Some(if low_reachable {
                    SubscribeLevel::Low
                } else {
                    ceiling
                })
            }
            SubscribeLevel::Low if !low_reachable && ceiling == SubscribeLevel::High => {
                Some(SubscribeLevel::High)
            }
            _ => None,
        };

        let to = if let Some(to) = forced {
            peer.streak.reset();
            to
        } else {
            let (direction, target) = if grade.is_known() {
                step(peer.level, grade, low_reachable, audio_only_allowed, ceiling)
            } else {
                (None, peer.level)
            };
            if !peer.streak.push(direction, required) {
                return None;
            }
            target
        };

        if to == peer.level {
            return None;
        }

        let change = SubscribeChange {
            uid,
            from: peer.level,
            to,
        };
        debug!(
            target: "rtc.quality",
            uid = %uid,
            from = ?change.from,
            to = ?change.to,
            grade = %grade,
            "Subscribe level transition"
        );
        peer.level = to;
        Some(change)
    }
}

/// Direction a known grade pushes a peer, and the level it would land on.
fn step(
    level: SubscribeLevel,
    grade: NetworkQuality,
    low_reachable: bool,
    audio_only_allowed: bool,
    ceiling: SubscribeLevel,
) -> (Option<Direction>, SubscribeLevel) {
    let degrade = |to| (Some(Direction::Degrade), to);
    let recover = |to| (Some(Direction::Recover), to);
    let hold = (None, level);

    match level {
        SubscribeLevel::High => {
            if low_reachable && grade >= NetworkQuality::Poor {
                degrade(SubscribeLevel::Low)
            } else if !low_reachable && audio_only_allowed && grade >= NetworkQuality::Bad {
                degrade(SubscribeLevel::AudioOnly)
            } else {
                hold
            }
        }
        SubscribeLevel::Low => {
            if audio_only_allowed && grade >= NetworkQuality::Bad {
                degrade(SubscribeLevel::AudioOnly)
            } else if grade <= NetworkQuality::Good && ceiling == SubscribeLevel::High {
                recover(SubscribeLevel::High)
            } else {
                hold
            }
        }
        SubscribeLevel::AudioOnly => {
            if low_reachable && grade <= NetworkQuality::Poor {
                recover(SubscribeLevel::Low)
            } else if !low_reachable && grade <= NetworkQuality::Good {
                recover(ceiling)
            } else {
                hold
            }
        }
    }
}
