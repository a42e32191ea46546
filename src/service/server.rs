use std::{
    io::{BufRead, BufReader, BufWriter, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
};

use log::{error, info, warn};

use crate::{CoachError, protocol::ClientMessage, protocol::Envelope};

use super::{AnalysisService, AngleSource, undecodable};

/// JSON-lines analysis service over TCP, one analysis session per
/// connection, each served on its own thread.
pub struct AnalysisServer {
    listener: TcpListener,
}

impl AnalysisServer {
    pub fn bind(addr: &str) -> Result<Self, CoachError> {
        let listener = TcpListener::bind(addr).map_err(|e| CoachError::ServiceBindError {
            addr: addr.to_string(),
            source: e,
        })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoachError> {
        self.listener
            .local_addr()
            .map_err(|e| CoachError::TransportIOError { source: e })
    }

    /// Accepts connections until the listener fails. `angles` builds the
    /// angle source for each new connection.
    pub fn run<F>(self, angles: F) -> Result<(), CoachError>
    where
        F: Fn() -> Box<dyn AngleSource + Send>,
    {
        info!("Analysis service listening on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Could not accept connection: {e}");
                    continue;
                }
            };
            let service = AnalysisService::new(angles());
            thread::spawn(move || {
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown peer".to_string());
                info!("Client connected: {peer}");
                match serve_connection(stream, service) {
                    Ok(()) => info!("Client disconnected: {peer}"),
                    Err(e) => error!("Connection to {peer} failed: {e}"),
                }
            });
        }
        Ok(())
    }
}

fn serve_connection(stream: TcpStream, mut service: AnalysisService) -> Result<(), CoachError> {
    let reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|e| CoachError::TransportIOError { source: e })?,
    );
    let mut writer = BufWriter::new(stream);

    for line in reader.lines() {
        let line = line.map_err(|e| CoachError::TransportIOError { source: e })?;
        if line.trim().is_empty() {
            continue;
        }
        let replies = match Envelope::<ClientMessage>::decode(&line) {
            Ok(envelope) => service.handle(envelope),
            Err(e) => {
                warn!("Rejecting malformed client message: {e}");
                vec![undecodable(&e)]
            }
        };
        for reply in replies {
            writeln!(writer, "{}", reply.encode()?)
                .map_err(|e| CoachError::TransportIOError { source: e })?;
        }
        writer
            .flush()
            .map_err(|e| CoachError::TransportIOError { source: e })?;
    }
    Ok(())
}
