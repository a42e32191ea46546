use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::{
    CoachError,
    protocol::{ClientMessage, Envelope, ServerMessage},
    service::{AnalysisService, AngleSource},
};

use super::{Transport, TransportEvent, decode_line};

/// Transport talking to an in-process `AnalysisService`.
///
/// Every message goes through the same JSON-lines encoding as on a real
/// connection. Replies become visible `latency` after the request was sent,
/// measured on the clock passed to `poll`; replies sent before the first
/// poll are due immediately.
pub struct LoopbackTransport {
    service: AnalysisService,
    latency: Duration,
    connected: bool,
    clock: Option<Instant>,
    events: VecDeque<TransportEvent>,
    replies: VecDeque<(Option<Instant>, String)>,
    sent: Vec<Envelope<ClientMessage>>,
}

impl LoopbackTransport {
    pub fn new(angles: Box<dyn AngleSource + Send>) -> Self {
        Self {
            service: AnalysisService::new(angles),
            latency: Duration::ZERO,
            connected: true,
            clock: None,
            events: VecDeque::from([TransportEvent::Connected]),
            replies: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn service(&self) -> &AnalysisService {
        &self.service
    }

    /// Every message sent so far, in order, as the service decoded it.
    pub fn sent(&self) -> &[Envelope<ClientMessage>] {
        &self.sent
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    /// Number of replies produced but not yet delivered.
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    /// Queues a reply as if the service had sent it now.
    pub fn inject(&mut self, envelope: &Envelope<ServerMessage>) -> Result<(), CoachError> {
        let line = envelope.encode()?;
        self.inject_line(line);
        Ok(())
    }

    /// Queues a raw line, which does not need to be valid.
    pub fn inject_line(&mut self, line: impl Into<String>) {
        self.replies.push_back((self.clock, line.into()));
    }

    /// Drops the connection. Undelivered replies are lost and the service
    /// forgets the analysis session.
    pub fn disconnect(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.replies.clear();
        self.service.reset();
        self.events.push_back(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
        info!("Loopback connection dropped: {reason}");
    }

    pub fn reconnect(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        self.events.push_back(TransportEvent::Connected);
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, envelope: &Envelope<ClientMessage>) -> Result<(), CoachError> {
        if !self.connected {
            return Err(CoachError::NotConnected);
        }
        let request = Envelope::<ClientMessage>::decode(&envelope.encode()?)?;
        self.sent.push(request.clone());

        let due = self.clock.map(|clock| clock + self.latency);
        for reply in self.service.handle(request) {
            self.replies.push_back((due, reply.encode()?));
        }
        Ok(())
    }

    fn poll(&mut self, now: Instant) -> Option<TransportEvent> {
        self.clock = Some(self.clock.map_or(now, |clock| clock.max(now)));
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        if !self.connected {
            return None;
        }
        let (due, _) = self.replies.front()?;
        if due.is_some_and(|due| due > now) {
            return None;
        }
        let (_, line) = self.replies.pop_front()?;
        debug!("Loopback delivering {line:.80}");
        Some(decode_line(&line))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
