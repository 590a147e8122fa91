pub mod dispatch_bridge;
pub mod log_sink;
pub mod relay_queue;
pub mod session_registry;
pub mod terminal_session;
pub mod trace_logger;

// Re-export commonly used types
pub use dispatch_bridge::{DispatchBridge, DispatchOutcome};
pub use log_sink::{DisabledLogSink, LogSink, RecordKind, SinkRecord};
pub use relay_queue::{ChannelKeys, Direction, QueueError, RelayQueue};
pub use session_registry::{CloseConnection, SessionRegistry};
pub use terminal_session::{create_terminal_session, SessionServices, TerminalSession};
pub use trace_logger::TraceLogger;
