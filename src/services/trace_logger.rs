//! Human-readable session trace, separate from the operational `tracing` log.
//!
//! Every write is best-effort: I/O failures are dropped after a debug event.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::config::settings::TraceConfig;
use crate::models::Envelope;
use crate::models::terminal::CLOUD_TIME_FORMAT;

pub struct TraceLogger {
    file: Option<Mutex<File>>,
    dump_dir: Option<PathBuf>,
    server_prefix: String,
    client_prefix: String,
}

impl TraceLogger {
    pub fn new(config: &TraceConfig) -> Self {
        let file = config.log_path.as_deref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| debug!(path = %path, error = %e, "Trace log file unavailable"))
                .ok()
                .map(Mutex::new)
        });

        Self {
            file,
            dump_dir: config.dump_dir.as_ref().map(PathBuf::from),
            server_prefix: config.server_prefix.clone(),
            client_prefix: config.client_prefix.clone(),
        }
    }

    /// Discards lines; only mirrors them to `tracing` at debug level.
    pub fn disabled() -> Self {
        Self {
            file: None,
            dump_dir: None,
            server_prefix: "SERVER".to_string(),
            client_prefix: "CLIENT".to_string(),
        }
    }

    pub fn append_line(&self, text: &str) {
        let line = format!("[{}] {}", Local::now().format(CLOUD_TIME_FORMAT), text);
        debug!(target: "trace", "{}", line);

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                if let Err(e) = writeln!(file, "{}", line) {
                    debug!(error = %e, "Trace line dropped");
                }
            }
        }
    }

    /// Line attributed to the server side of a session
    pub fn server(&self, text: &str) {
        self.append_line(&format!("[{}] {}", self.server_prefix, text));
    }

    /// Line attributed to the terminal side of a session
    pub fn client(&self, text: &str) {
        self.append_line(&format!("[{}] {}", self.client_prefix, text));
    }

    /// Writes the message to `<dump_dir>/<cmd-or-ret>.json`, replacing the previous one of that kind.
    pub fn dump_message(&self, envelope: &Envelope) {
        let Some(dir) = &self.dump_dir else {
            return;
        };

        if let Err(e) = write_dump(dir, envelope) {
            debug!(dir = %dir.display(), error = %e, "Message dump dropped");
        }
    }
}

fn write_dump(dir: &Path, envelope: &Envelope) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let name: String = envelope
        .kind()
        .name()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if name.is_empty() {
        return Ok(());
    }
    let pretty = serde_json::to_string_pretty(&envelope.to_value())?;
    fs::write(dir.join(format!("{}.json", name)), pretty)
}
