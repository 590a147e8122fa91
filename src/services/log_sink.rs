use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::error::AppError;
use crate::models::{DevInfo, LogRecord};

/// Which terminal command produced a batch of records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Reg,
    Sendlog,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Reg => "reg",
            RecordKind::Sendlog => "sendlog",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SinkRecord {
    Registration(DevInfo),
    Access(LogRecord),
}

/// Persists structured records extracted from terminal uploads.
///
/// Failures are reported to the caller for logging only; they never change
/// what the terminal is told.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append_records(
        &self,
        device_sn: &str,
        kind: RecordKind,
        records: Vec<SinkRecord>,
    ) -> Result<(), AppError>;
}

/// Used when persistence is switched off
#[derive(Debug, Default, Clone)]
pub struct DisabledLogSink;

#[async_trait]
impl LogSink for DisabledLogSink {
    async fn append_records(
        &self,
        device_sn: &str,
        kind: RecordKind,
        records: Vec<SinkRecord>,
    ) -> Result<(), AppError> {
        debug!(
            device_sn = %device_sn,
            kind = %kind,
            count = records.len(),
            "Log sink disabled; records not persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    pub struct SinkCall {
        pub device_sn: String,
        pub kind: RecordKind,
        pub records: Vec<SinkRecord>,
    }

    /// Records every call; optionally fails after recording.
    #[derive(Default)]
    pub struct RecordingLogSink {
        pub calls: Mutex<Vec<SinkCall>>,
        pub fail: bool,
    }

    impl RecordingLogSink {
        pub fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogSink for RecordingLogSink {
        async fn append_records(
            &self,
            device_sn: &str,
            kind: RecordKind,
            records: Vec<SinkRecord>,
        ) -> Result<(), AppError> {
            self.calls.lock().unwrap().push(SinkCall {
                device_sn: device_sn.to_string(),
                kind,
                records,
            });
            if self.fail {
                return Err(AppError::LogSink("simulated outage".to_string()));
            }
            Ok(())
        }
    }

    /// Holds every call open until `release` is notified.
    #[derive(Default)]
    pub struct BlockingLogSink {
        pub release: Notify,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl BlockingLogSink {
        pub fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        pub fn finished(&self) -> usize {
            self.finished.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogSink for BlockingLogSink {
        async fn append_records(
            &self,
            _device_sn: &str,
            _kind: RecordKind,
            _records: Vec<SinkRecord>,
        ) -> Result<(), AppError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
