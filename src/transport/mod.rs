//! Event channel to the analysis service.

pub mod loopback;
pub mod tcp;

use std::time::Instant;

use crate::{
    CoachError,
    protocol::{ClientMessage, Envelope, ServerMessage},
};

pub use loopback::LoopbackTransport;
pub use tcp::TcpTransport;

#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message(Envelope<ServerMessage>),
    /// A line arrived that could not be decoded. `event` is the event name
    /// when it could still be read.
    Malformed {
        event: Option<String>,
        error: CoachError,
    },
}

/// A persistent, bidirectional channel to the analysis service.
///
/// `poll` never blocks: it hands out at most one event that is due at `now`
/// and returns `None` once nothing is pending, so the caller can interleave
/// transport events with its own timers on one thread.
pub trait Transport {
    fn send(&mut self, envelope: &Envelope<ClientMessage>) -> Result<(), CoachError>;
    fn poll(&mut self, now: Instant) -> Option<TransportEvent>;
    fn is_connected(&self) -> bool;
}

/// Decodes one line received from the service.
pub fn decode_line(line: &str) -> TransportEvent {
    match Envelope::<ServerMessage>::decode(line) {
        Ok(envelope) => TransportEvent::Message(envelope),
        Err(error) => {
            let event = match &error {
                CoachError::MalformedMessage { event, .. } => event.clone(),
                _ => None,
            };
            TransportEvent::Malformed { event, error }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line_classifies_messages() {
        assert!(matches!(
            decode_line(r#"{"event":"counter_reset","data":{"count":0},"epoch":2}"#),
            TransportEvent::Message(_)
        ));
        match decode_line(r#"{"event":"frame_processed","data":true}"#) {
            TransportEvent::Malformed { event, .. } => {
                assert_eq!(event.as_deref(), Some("frame_processed"))
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            decode_line("}{"),
            TransportEvent::Malformed { event: None, .. }
        ));
    }
}
