//! Bridge event log
//!
//! Records the lifecycle of native resources (allocations, frees, loaded
//! libraries, resolved symbols) and every dispatched or rejected call, so
//! hosts can inspect what crossed the boundary.

use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Bridge event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfiEvent {
    /// Stable allocation created
    Allocated {
        key: String,
        address: usize,
        size: usize,
        alignment: usize,
    },
    /// Allocation refused
    AllocationRejected { key: String, reason: String },
    /// Stable allocation released
    Freed {
        key: String,
        address: usize,
        size: usize,
    },
    /// Free of a key with no live allocation
    FreeIgnored { key: String },
    /// Shared library opened
    LibraryLoaded { name: String, path: PathBuf },
    /// Symbol lookup succeeded
    SymbolResolved { name: String, address: usize },
    /// Symbol lookup failed
    SymbolMissing { name: String },
    /// Native call performed
    CallDispatched {
        address: usize,
        variadic: bool,
        args: usize,
    },
    /// Call refused before reaching native code
    CallRejected { address: usize, reason: String },
}

impl fmt::Display for FfiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiEvent::Allocated {
                key,
                address,
                size,
                alignment,
            } => write!(
                f,
                "Allocated {}: {} bytes at {:#x} (align {})",
                key, size, address, alignment
            ),
            FfiEvent::AllocationRejected { key, reason } => {
                write!(f, "Allocation rejected for {}: {}", key, reason)
            }
            FfiEvent::Freed { key, address, size } => {
                write!(f, "Freed {}: {} bytes at {:#x}", key, size, address)
            }
            FfiEvent::FreeIgnored { key } => write!(f, "Free ignored: {} is not live", key),
            FfiEvent::LibraryLoaded { name, path } => {
                write!(f, "Library loaded: {} from {}", name, path.display())
            }
            FfiEvent::SymbolResolved { name, address } => {
                write!(f, "Symbol resolved: {} at {:#x}", name, address)
            }
            FfiEvent::SymbolMissing { name } => write!(f, "Symbol not found: {}", name),
            FfiEvent::CallDispatched {
                address,
                variadic,
                args,
            } => {
                let kind = if *variadic { "variadic" } else { "fixed" };
                write!(f, "Call {:#x} ({}, {} args)", address, kind, args)
            }
            FfiEvent::CallRejected { address, reason } => {
                write!(f, "Call {:#x} rejected: {}", address, reason)
            }
        }
    }
}

/// Event log entry with timestamp
#[derive(Debug, Clone)]
pub struct EventEntry {
    /// Event timestamp (Unix timestamp in milliseconds)
    pub timestamp: u64,
    pub event: FfiEvent,
}

impl EventEntry {
    /// Create a new entry stamped with the current time
    pub fn new(event: FfiEvent) -> Self {
        Self {
            timestamp: current_timestamp_ms(),
            event,
        }
    }

    /// Format as log line
    pub fn to_log_line(&self) -> String {
        format!(
            "[{}+{:03}ms] {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.event
        )
    }
}

fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Event logger backends
pub trait EventLogger: Send + Sync {
    fn log(&self, event: FfiEvent);

    /// All logged entries, oldest first
    fn entries(&self) -> Vec<EventEntry>;

    fn clear(&self);
}

/// In-memory event logger
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLogger {
    entries: Arc<Mutex<Vec<EventEntry>>>,
}

impl MemoryEventLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLogger for MemoryEventLogger {
    fn log(&self, event: FfiEvent) {
        self.entries.lock().push(EventEntry::new(event));
    }

    fn entries(&self) -> Vec<EventEntry> {
        self.entries.lock().clone()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Null event logger (no-op, for performance)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventLogger;

impl NullEventLogger {
    pub fn new() -> Self {
        Self
    }
}

impl EventLogger for NullEventLogger {
    fn log(&self, _event: FfiEvent) {}

    fn entries(&self) -> Vec<EventEntry> {
        Vec::new()
    }

    fn clear(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = FfiEvent::Allocated {
            key: "buf".to_string(),
            address: 0x1000,
            size: 16,
            alignment: 8,
        };
        assert_eq!(event.to_string(), "Allocated buf: 16 bytes at 0x1000 (align 8)");

        let event = FfiEvent::CallDispatched {
            address: 0xff,
            variadic: true,
            args: 3,
        };
        assert_eq!(event.to_string(), "Call 0xff (variadic, 3 args)");
    }

    #[test]
    fn test_entry_log_line_format() {
        let entry = EventEntry::new(FfiEvent::SymbolMissing {
            name: "nope".to_string(),
        });
        assert!(entry.timestamp > 0);
        let line = entry.to_log_line();
        assert!(line.starts_with('['));
        assert!(line.ends_with("Symbol not found: nope"));
    }

    #[test]
    fn test_memory_logger_stores_and_clears() {
        let logger = MemoryEventLogger::new();
        logger.log(FfiEvent::FreeIgnored {
            key: "a".to_string(),
        });
        logger.log(FfiEvent::FreeIgnored {
            key: "b".to_string(),
        });

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1].event,
            FfiEvent::FreeIgnored {
                key: "b".to_string()
            }
        );

        logger.clear();
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn test_memory_logger_clones_share_entries() {
        let logger = MemoryEventLogger::new();
        let other = logger.clone();
        other.log(FfiEvent::SymbolMissing {
            name: "x".to_string(),
        });
        assert_eq!(logger.entries().len(), 1);
    }

    #[test]
    fn test_null_logger_no_op() {
        let logger = NullEventLogger::new();
        logger.log(FfiEvent::SymbolMissing {
            name: "x".to_string(),
        });
        assert!(logger.entries().is_empty());
    }
}
