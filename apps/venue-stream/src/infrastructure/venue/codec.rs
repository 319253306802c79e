//! Frame Inspection
//!
//! The sessions forward frames untouched; the only thing ever decoded is the
//! event type of a JSON object frame, to spot the venue's credential-expiry
//! notification on the private stream:
//!
//! ```json
//! {"e":"listenKeyExpired","E":1576653824250,"listenKey":"WsCMN0a4..."}
//! ```

use std::borrow::Cow;

use serde::Deserialize;

/// Event type the venue pushes when the listen key expired.
pub const EVENT_LISTEN_KEY_EXPIRED: &str = "listenKeyExpired";

/// Classification of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Regular payload to forward to consumers.
    Data,
    /// The session credential expired.
    CredentialExpired,
}

#[derive(Deserialize)]
struct EventEnvelope<'a> {
    #[serde(rename = "e", borrow)]
    event: Option<Cow<'a, str>>,
}

/// Classify a frame by its event type.
///
/// Anything that is not a JSON object with a recognized `"e"` field is data,
/// including arrays (ticker batches) and non-JSON payloads.
#[must_use]
pub fn inspect(frame: &[u8]) -> FrameKind {
    let Some(first) = frame.iter().find(|b| !b.is_ascii_whitespace()) else {
        return FrameKind::Data;
    };
    if *first != b'{' {
        return FrameKind::Data;
    }

    match serde_json::from_slice::<EventEnvelope<'_>>(frame) {
        Ok(envelope) if envelope.event.as_deref() == Some(EVENT_LISTEN_KEY_EXPIRED) => {
            FrameKind::CredentialExpired
        }
        Ok(_) => FrameKind::Data,
        Err(e) => {
            tracing::trace!(error = %e, len = frame.len(), "Frame is not a decodable event object");
            FrameKind::Data
        }
    }
}
