//! # Event Logger
//!
//! An [`EventListener`] that writes every framework event it receives to a
//! configurable destination, either as a human readable line or as a JSON
//! object:
//! - Console logging through `tracing`
//! - Append-only file
//! - Custom callback
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vcx_node::event::EventBus;
//! use vcx_node::event::logger::{EventLogger, EventLoggerConfig, LogDestination};
//!
//! let bus = EventBus::default();
//! let logger = EventLogger::new(EventLoggerConfig {
//!     destination: LogDestination::File {
//!         path: "/var/log/vcx/events.log".to_string(),
//!     },
//!     structured: true,
//!     log_level: tracing::Level::INFO,
//! });
//! bus.subscribe_all(Arc::new(logger));
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, trace, warn, Level};

use crate::event::{Event, EventListener, ListenerError};

/// Configuration for where event logs should be sent
#[derive(Clone)]
pub enum LogDestination {
    /// Log through `tracing`
    Console,

    /// Append to a file
    File {
        /// Path to the log file
        path: String,
    },

    /// Custom logging function
    Custom(Arc<dyn Fn(&str) + Send + Sync>),
}

impl fmt::Debug for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogDestination::Console => write!(f, "LogDestination::Console"),
            LogDestination::File { path } => f
                .debug_struct("LogDestination::File")
                .field("path", path)
                .finish(),
            LogDestination::Custom(_) => write!(f, "LogDestination::Custom(<function>)"),
        }
    }
}

/// Configuration for the event logger
#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    pub destination: LogDestination,

    /// Whether to use structured (JSON) logging
    pub structured: bool,

    /// Level used for console output
    pub log_level: Level,
}

impl Default for EventLoggerConfig {
    fn default() -> Self {
        Self {
            destination: LogDestination::Console,
            structured: false,
            log_level: Level::INFO,
        }
    }
}

pub struct EventLogger {
    config: EventLoggerConfig,

    /// File handle if using file destination
    file: Option<Arc<Mutex<File>>>,
}

impl EventLogger {
    pub fn new(config: EventLoggerConfig) -> Self {
        let file = match &config.destination {
            LogDestination::File { path } => match Self::open_log_file(path) {
                Ok(file) => Some(Arc::new(Mutex::new(file))),
                Err(err) => {
                    error!("Failed to open log file {}: {}", path, err);
                    None
                }
            },
            _ => None,
        };

        Self { config, file }
    }

    fn open_log_file(path: &str) -> io::Result<File> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn log_event(&self, event: &Event) -> Result<(), ListenerError> {
        let line = if self.config.structured {
            Self::format_structured(event)?
        } else {
            Self::format_plain(event)
        };

        match &self.config.destination {
            LogDestination::Console => {
                match self.config.log_level {
                    Level::ERROR => error!("{}", line),
                    Level::WARN => warn!("{}", line),
                    Level::INFO => info!("{}", line),
                    Level::DEBUG => debug!("{}", line),
                    Level::TRACE => trace!("{}", line),
                }
                Ok(())
            }
            LogDestination::File { .. } => {
                if let Some(file) = &self.file {
                    let mut guard = file
                        .lock()
                        .map_err(|_| anyhow::anyhow!("event log file lock poisoned"))?;
                    writeln!(guard, "{}", line)?;
                    guard.flush()?;
                } else {
                    // File could not be opened; keep the event visible.
                    error!("{}", line);
                }
                Ok(())
            }
            LogDestination::Custom(func) => {
                func(&line);
                Ok(())
            }
        }
    }

    fn format_plain(event: &Event) -> String {
        format!(
            "[{}] {} {}: source={} id={} payload={}",
            event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            event.topic.to_string().to_uppercase(),
            event.kind.to_string().to_uppercase(),
            event.source_id,
            event.id,
            event.payload
        )
    }

    fn format_structured(event: &Event) -> Result<String, serde_json::Error> {
        serde_json::to_string(&json!({
            "timestamp": event.timestamp.to_rfc3339(),
            "event_id": event.id,
            "event_type": format!("{}_{}", event.topic, event.kind),
            "source_id": event.source_id,
            "data": event.payload,
        }))
    }
}

#[async_trait]
impl EventListener for EventLogger {
    async fn handle_event(&self, event: &Event) -> Result<(), ListenerError> {
        self.log_event(event)
    }
}

impl fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogger")
            .field("config", &self.config)
            .field("file", &self.file.is_some())
            .finish()
    }
}
