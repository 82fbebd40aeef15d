//! Data streams: small application messages sent over the session transport.
//!
//! A session may hold a bounded number of open streams. Each stream is
//! either reliable and ordered, or neither. Reliable messages are tracked
//! until the remote side acknowledges them; a message not acknowledged
//! within the delivery timeout is reported back to the sender.

pub mod budget;
pub mod receiver;

pub use budget::{BudgetExceeded, SendBudget};
pub use receiver::{DataReceiver, Inbound};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::transport::OutboundData;
use bytes::Bytes;
use common::types::DataStreamId;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Limits applied to outgoing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLimits {
    pub max_streams: usize,
    pub max_message_bytes: usize,
    pub messages_per_second: usize,
    pub bytes_per_second: usize,
    pub delivery_timeout: Duration,
}

impl From<&EngineConfig> for DataLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_streams: config.max_data_streams,
            max_message_bytes: config.max_data_message_bytes,
            messages_per_second: config.data_messages_per_second,
            bytes_per_second: config.data_bytes_per_second,
            delivery_timeout: config.reliable_delivery_timeout,
        }
    }
}

/// A reliable message that was not acknowledged in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndeliveredMessage {
    pub stream_id: DataStreamId,
    pub sequence: u32,
}

#[derive(Debug)]
struct OutboundStream {
    reliable: bool,
    ordered: bool,
    next_sequence: u32,
    /// Reliable messages awaiting acknowledgment, by sequence.
    unacked: BTreeMap<u32, Instant>,
}

/// Send side of all data streams in a session.
#[derive(Debug)]
pub struct DataChannel {
    limits: DataLimits,
    streams: HashMap<DataStreamId, OutboundStream>,
    budget: SendBudget,
}

impl DataChannel {
    #[must_use]
    pub fn new(limits: DataLimits) -> Self {
        Self {
            limits,
            streams: HashMap::new(),
            budget: SendBudget::per_second(limits.messages_per_second, limits.bytes_per_second),
        }
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.streams.len()
    }

    /// Open a stream.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `reliable != ordered`
    /// - `AlreadyInUse` if the id is open
    /// - `TooManyDataStreams` if the stream limit is reached
    pub fn open(
        &mut self,
        stream_id: DataStreamId,
        reliable: bool,
        ordered: bool,
    ) -> Result<(), EngineError> {
        if reliable != ordered {
            return Err(EngineError::InvalidArgument(format!(
                "stream {stream_id}: reliable ({reliable}) and ordered ({ordered}) must match"
            )));
        }
        if self.streams.contains_key(&stream_id) {
            return Err(EngineError::AlreadyInUse(format!("data stream {stream_id}")));
        }
        if self.streams.len() >= self.limits.max_streams {
            return Err(EngineError::TooManyDataStreams {
                max: self.limits.max_streams,
            });
        }

        self.streams.insert(
            stream_id,
            OutboundStream {
                reliable,
                ordered,
                next_sequence: 0,
                unacked: BTreeMap::new(),
            },
        );
        info!(
            target: "rtc.data",
            stream_id = %stream_id,
            reliable,
            open = self.streams.len(),
            "Data stream opened"
        );
        Ok(())
    }

    /// Close a stream. Its unacknowledged messages are returned as undelivered.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the stream is not open.
    pub fn close(&mut self, stream_id: DataStreamId) -> Result<Vec<UndeliveredMessage>, EngineError> {
        let stream = self
            .streams
            .remove(&stream_id)
            .ok_or_else(|| EngineError::InvalidArgument(format!("data stream {stream_id} is not open")))?;
        info!(target: "rtc.data", stream_id = %stream_id, "Data stream closed");
        Ok(undelivered(stream_id, &stream))
    }

    /// Validate, rate-limit, and sequence one message.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an unknown stream
    /// - `SizeTooLarge` when the payload exceeds the per-message limit
    /// - `TooOften` / `BitrateLimit` when the send budget is exhausted
    pub fn prepare_send(
        &mut self,
        stream_id: DataStreamId,
        payload: Bytes,
        now: Instant,
    ) -> Result<OutboundData, EngineError> {
        let max = self.limits.max_message_bytes;
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| EngineError::InvalidArgument(format!("data stream {stream_id} is not open")))?;

        if payload.len() > max {
            return Err(EngineError::SizeTooLarge {
                size: payload.len(),
                max,
            });
        }

        self.budget
            .try_consume(payload.len(), now)
            .map_err(|exceeded| match exceeded {
                BudgetExceeded::Messages => EngineError::TooOften,
                BudgetExceeded::Bytes => EngineError::BitrateLimit,
            })?;

        let sequence = stream.next_sequence;
        stream.next_sequence = stream.next_sequence.wrapping_add(1);
        if stream.reliable {
            stream.unacked.insert(sequence, now);
        }

        Ok(OutboundData {
            stream_id,
            sequence,
            reliable: stream.reliable,
            ordered: stream.ordered,
            payload,
        })
    }

    /// Record an acknowledgment. Returns false for unknown messages.
    pub fn acknowledge(&mut self, stream_id: DataStreamId, sequence: u32) -> bool {
        self.streams
            .get_mut(&stream_id)
            .is_some_and(|s| s.unacked.remove(&sequence).is_some())
    }

    /// Reliable messages whose delivery deadline passed.
    pub fn expire_unacked(&mut self, now: Instant) -> Vec<UndeliveredMessage> {
        let timeout = self.limits.delivery_timeout;
        let mut expired = Vec::new();
        for (stream_id, stream) in &mut self.streams {
            let late: Vec<u32> = stream
                .unacked
                .iter()
                .filter(|(_, sent_at)| now.duration_since(**sent_at) >= timeout)
                .map(|(seq, _)| *seq)
                .collect();
            for sequence in late {
                stream.unacked.remove(&sequence);
                expired.push(UndeliveredMessage {
                    stream_id: *stream_id,
                    sequence,
                });
            }
        }
        expired.sort_by_key(|m| (m.stream_id, m.sequence));
        if !expired.is_empty() {
            debug!(target: "rtc.data", count = expired.len(), "Reliable messages timed out");
        }
        expired
    }

    /// Close every stream, failing all unacknowledged messages.
    pub fn close_all(&mut self) -> Vec<UndeliveredMessage> {
        let mut failed: Vec<UndeliveredMessage> = self
            .streams
            .drain()
            .flat_map(|(id, stream)| undelivered(id, &stream))
            .collect();
        failed.sort_by_key(|m| (m.stream_id, m.sequence));
        self.budget.clear();
        failed
    }
}

fn undelivered(stream_id: DataStreamId, stream: &OutboundStream) -> Vec<UndeliveredMessage> {
    stream
        .unacked
        .keys()
        .map(|sequence| UndeliveredMessage {
            stream_id,
            sequence: *sequence,
        })
        .collect()
}
