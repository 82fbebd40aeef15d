//! Join request validation.

use crate::errors::EngineError;

/// Channel ids must be shorter than this many bytes.
pub const MAX_CHANNEL_ID_BYTES: usize = 64;

/// Punctuation allowed in channel ids besides ASCII letters and digits.
const CHANNEL_ID_PUNCTUATION: &str = " !#$%&()+-:;<=.>?@[]^_{|}~,";

/// Validate a channel id.
///
/// # Errors
///
/// Returns `InvalidChannelId` if the id is empty, too long, or contains a
/// character outside the allowed set.
pub fn validate_channel_id(channel: &str) -> Result<(), EngineError> {
    if channel.is_empty() {
        return Err(EngineError::InvalidChannelId(
            "channel id is empty".to_string(),
        ));
    }
    if channel.len() >= MAX_CHANNEL_ID_BYTES {
        return Err(EngineError::InvalidChannelId(format!(
            "channel id is {} bytes, must be under {MAX_CHANNEL_ID_BYTES}",
            channel.len()
        )));
    }
    if let Some(bad) = channel
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || CHANNEL_ID_PUNCTUATION.contains(*c)))
    {
        return Err(EngineError::InvalidChannelId(format!(
            "character {bad:?} is not allowed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_channel_ids() {
        for channel in [
            "room1",
            "Room 1",
            "a",
            "team-standup_2024",
            "x!#$%&()+-:;<=.>?@[]^_{|}~,",
            &"c".repeat(63),
        ] {
            assert!(validate_channel_id(channel).is_ok(), "{channel} should be valid");
        }
    }

    #[test]
    fn test_invalid_channel_ids() {
        for channel in [
            "",
            "room/1",
            "room\\1",
            "room*",
            "caf\u{e9}",
            "tab\tchannel",
            "quote\"d",
            &"c".repeat(64),
        ] {
            assert!(
                matches!(
                    validate_channel_id(channel),
                    Err(EngineError::InvalidChannelId(_))
                ),
                "{channel:?} should be rejected"
            );
        }
    }
}
