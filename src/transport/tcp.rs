use std::{
    collections::VecDeque,
    io::{BufRead, BufReader, Write},
    net::TcpStream,
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    CoachError,
    protocol::{ClientMessage, Envelope},
};

use super::{Transport, TransportEvent, decode_line};

/// JSON-lines transport over TCP.
///
/// A reader thread per connection decodes incoming lines and moves them onto
/// a channel; `poll` drains that channel without blocking. Every connection
/// gets a generation number so events of a connection that was already
/// replaced are ignored. After a connection is lost a new one is attempted
/// every `reconnect_wait`.
pub struct TcpTransport {
    addr: String,
    reconnect_wait: Duration,
    stream: Option<TcpStream>,
    generation: u64,
    next_attempt: Option<Instant>,
    sender: Sender<(u64, TransportEvent)>,
    receiver: Receiver<(u64, TransportEvent)>,
    events: VecDeque<TransportEvent>,
}

impl TcpTransport {
    /// Creates the transport; the first connection attempt happens on the
    /// first `poll`.
    pub fn new(addr: &str, reconnect_wait: Duration) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            addr: addr.to_string(),
            reconnect_wait,
            stream: None,
            generation: 0,
            next_attempt: Some(Instant::now()),
            sender,
            receiver,
            events: VecDeque::new(),
        }
    }

    /// Creates the transport and connects right away.
    pub fn connect(addr: &str, reconnect_wait: Duration) -> Result<Self, CoachError> {
        let mut transport = Self::new(addr, reconnect_wait);
        transport.open()?;
        Ok(transport)
    }

    fn open(&mut self) -> Result<(), CoachError> {
        let stream =
            TcpStream::connect(&self.addr).map_err(|e| CoachError::TransportIOError { source: e })?;
        stream
            .set_nodelay(true)
            .map_err(|e| CoachError::TransportIOError { source: e })?;
        let reader = stream
            .try_clone()
            .map_err(|e| CoachError::TransportIOError { source: e })?;

        self.generation += 1;
        let generation = self.generation;
        let sender = self.sender.clone();
        thread::spawn(move || read_lines(reader, generation, sender));

        self.stream = Some(stream);
        self.next_attempt = None;
        self.events.push_back(TransportEvent::Connected);
        info!("Connected to analysis service at {}", self.addr);
        Ok(())
    }

    fn lost(&mut self, now: Instant, reason: String) -> TransportEvent {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.next_attempt = Some(now + self.reconnect_wait);
        warn!("Lost connection to analysis service: {reason}");
        TransportEvent::Disconnected { reason }
    }
}

fn read_lines(stream: TcpStream, generation: u64, sender: Sender<(u64, TransportEvent)>) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let event = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => decode_line(&line),
            Err(e) => {
                let _ = sender.send((
                    generation,
                    TransportEvent::Disconnected {
                        reason: e.to_string(),
                    },
                ));
                return;
            }
        };
        if sender.send((generation, event)).is_err() {
            return;
        }
    }
    let _ = sender.send((
        generation,
        TransportEvent::Disconnected {
            reason: "connection closed by the service".to_string(),
        },
    ));
}

impl Transport for TcpTransport {
    fn send(&mut self, envelope: &Envelope<ClientMessage>) -> Result<(), CoachError> {
        let line = envelope.encode()?;
        let stream = self.stream.as_mut().ok_or(CoachError::NotConnected)?;
        let written = writeln!(stream, "{line}").and_then(|_| stream.flush());
        if let Err(e) = written {
            let reason = e.to_string();
            let event = self.lost(Instant::now(), reason);
            self.events.push_back(event);
            return Err(CoachError::TransportIOError { source: e });
        }
        Ok(())
    }

    fn poll(&mut self, now: Instant) -> Option<TransportEvent> {
        if self.stream.is_none() && self.next_attempt.is_some_and(|at| at <= now) {
            if let Err(e) = self.open() {
                debug!("Connection attempt to {} failed: {e}", self.addr);
                self.next_attempt = Some(now + self.reconnect_wait);
            }
        }
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.try_recv() {
                Ok((generation, _)) if generation != self.generation => continue,
                Ok((_, TransportEvent::Disconnected { reason })) => {
                    if self.stream.is_none() {
                        continue;
                    }
                    return Some(self.lost(now, reason));
                }
                Ok((_, event)) => return Some(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
