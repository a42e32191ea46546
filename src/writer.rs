use std::{fs::File, io::BufWriter, path::Path, sync::mpsc::Receiver};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_jsonlines::JsonLinesWriter;

use crate::{
    CoachError,
    coach::NoticeKind,
    protocol::Epoch,
    session::{ArmSide, CalibrationPhase, Mode},
};

/// One entry of the session event log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ModeChanged {
        mode: Mode,
        epoch: Epoch,
        arm_side: ArmSide,
    },
    CalibrationResult {
        phase: CalibrationPhase,
        angle: f32,
        calibrated: bool,
    },
    Progress {
        count: u32,
        percentage: f32,
    },
    Notice {
        kind: NoticeKind,
        message: String,
    },
}

/// Writes every event received on `events` as one JSON line until all
/// senders are gone.
pub fn write_session_events(
    file: &Path,
    events: Receiver<SessionEvent>,
) -> Result<(), CoachError> {
    let event_file = File::create(file).map_err(|e| CoachError::WriterError { source: e })?;
    let mut event_writer = JsonLinesWriter::new(BufWriter::new(event_file));
    for event in &events {
        if let Err(e) = event_writer.write(&event) {
            warn!("Error while writing session event to {}: {}", file.display(), e);
        }
    }
    event_writer
        .flush()
        .map_err(|e| CoachError::WriterError { source: e })
}

/// Reads a session event log back. A broken line fails the whole read.
pub fn read_session_events(file: &Path) -> Result<Vec<SessionEvent>, CoachError> {
    serde_jsonlines::json_lines(file)
        .map_err(|e| CoachError::WriterError { source: e })?
        .collect::<Result<Vec<SessionEvent>, _>>()
        .map_err(|e| CoachError::WriterError { source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, thread};

    #[test]
    fn test_events_are_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let (tx, rx) = mpsc::channel();

        let writer_path = path.clone();
        let writer = thread::spawn(move || write_session_events(&writer_path, rx));
        let events = vec![
            SessionEvent::ModeChanged {
                mode: Mode::Setup,
                epoch: Epoch::new(0),
                arm_side: ArmSide::Left,
            },
            SessionEvent::CalibrationResult {
                phase: CalibrationPhase::Min,
                angle: 35.,
                calibrated: false,
            },
            SessionEvent::Notice {
                kind: NoticeKind::Validation,
                message: "Please complete MIN calibration first.".to_string(),
            },
        ];
        for event in &events {
            tx.send(event.clone()).unwrap();
        }
        drop(tx);
        writer.join().unwrap().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.lines().next().unwrap().contains(r#""type":"mode_changed""#));
        assert_eq!(read_session_events(&path).unwrap(), events);
    }
}
