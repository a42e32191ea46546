// Library interface for repcoach
// The binary and the integration tests drive the coach through these modules

pub mod camera;
pub mod coach;
pub mod config;
pub mod errors;
pub mod frame;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod transport;
pub mod writer;

// Re-export commonly used types
pub use camera::{CameraBackend, CaptureHints, DeviceId, SyntheticCamera, VideoSampler};
pub use coach::{Coach, Notice, NoticeKind, Prompt};
pub use config::CoachConfig;
pub use errors::CoachError;
pub use pipeline::{CanvasSurface, Surface};
pub use protocol::{ClientMessage, Envelope, Epoch, ServerMessage};
pub use session::{AngleRange, ArmSide, CalibrationPhase, Mode, Session};
pub use transport::{LoopbackTransport, TcpTransport, Transport, TransportEvent};
pub use writer::SessionEvent;
