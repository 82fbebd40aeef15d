//! Mock video encoder control.
//!
//! Records every decision the engine makes about local video so tests can
//! assert on publish fallback and dual stream mode.

use rtc_engine::transport::EncoderControl;
use std::sync::Mutex;

/// One call made by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderCall {
    VideoPublishing(bool),
    DualStream(bool),
}

/// Recording encoder. Share it with the engine as `Arc<dyn EncoderControl>`.
#[derive(Debug, Default)]
pub struct MockEncoder {
    calls: Mutex<Vec<EncoderCall>>,
}

impl MockEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<EncoderCall> {
        self.calls.lock().expect("mock encoder lock poisoned").clone()
    }

    /// Whether local video is currently published. True until told otherwise.
    #[must_use]
    pub fn is_publishing_video(&self) -> bool {
        self.calls()
            .iter()
            .rev()
            .find_map(|c| match c {
                EncoderCall::VideoPublishing(enabled) => Some(*enabled),
                EncoderCall::DualStream(_) => None,
            })
            .unwrap_or(true)
    }

    #[must_use]
    pub fn dual_stream(&self) -> bool {
        self.calls()
            .iter()
            .rev()
            .find_map(|c| match c {
                EncoderCall::DualStream(enabled) => Some(*enabled),
                EncoderCall::VideoPublishing(_) => None,
            })
            .unwrap_or(false)
    }

    fn record(&self, call: EncoderCall) {
        self.calls
            .lock()
            .expect("mock encoder lock poisoned")
            .push(call);
    }
}

impl EncoderControl for MockEncoder {
    fn set_video_publishing(&self, enabled: bool) {
        self.record(EncoderCall::VideoPublishing(enabled));
    }

    fn set_dual_stream(&self, enabled: bool) {
        self.record(EncoderCall::DualStream(enabled));
    }
}
