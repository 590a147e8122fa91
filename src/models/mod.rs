pub mod envelope;
pub mod terminal;
pub use envelope::{Envelope, EnvelopeKind};
pub use terminal::{DevInfo, LogRecord, RegisterRequest, SendLogRequest, TerminalRequest};
