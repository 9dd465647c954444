//! Debug event fan-out.
//!
//! The loop emits [`DebugEvent`]s through a `DebugBus`. When the bus is
//! disabled, or the event's kind is filtered out, the event is never built.
//! Sinks receive events in emission order on the loop thread.

use crate::config::DebugConfig;
use serde::{Deserialize, Serialize};
use smithers_proto::{DebugEvent, DebugEventKind};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Receives debug events.
pub trait DebugSink: Send + Sync {
    fn on_event(&self, event: &DebugEvent);
}

impl<F> DebugSink for F
where
    F: Fn(&DebugEvent) + Send + Sync,
{
    fn on_event(&self, event: &DebugEvent) {
        self(event);
    }
}

/// Filtered fan-out of debug events to sinks.
#[derive(Default)]
pub struct DebugBus {
    enabled: bool,
    /// `None` passes every kind.
    filter: Option<HashSet<DebugEventKind>>,
    sinks: Vec<Box<dyn DebugSink>>,
}

impl DebugBus {
    /// A bus that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// An enabled bus with no sinks and no filter.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Builds a bus from configuration: a tracing sink, plus a JSONL sink
    /// when `jsonl_path` is set. Unknown filter tags are ignored here;
    /// `SmithersConfig::validate` reports them.
    pub fn from_config(config: &DebugConfig) -> io::Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let mut bus = Self::enabled();
        if !config.event_filter.is_empty() {
            bus.filter = Some(
                config
                    .event_filter
                    .iter()
                    .filter_map(|tag| DebugEventKind::from_tag(tag))
                    .collect(),
            );
        }
        bus.add_sink(TracingSink);
        if let Some(path) = &config.jsonl_path {
            bus.add_sink(JsonlSink::create(path)?);
            debug!(path = %path, "Recording debug events");
        }
        Ok(bus)
    }

    /// Restricts emission to the given kinds.
    pub fn with_filter(mut self, kinds: impl IntoIterator<Item = DebugEventKind>) -> Self {
        self.filter = Some(kinds.into_iter().collect());
        self
    }

    pub fn add_sink(&mut self, sink: impl DebugSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_enabled_for(&self, kind: DebugEventKind) -> bool {
        self.enabled && self.filter.as_ref().is_none_or(|f| f.contains(&kind))
    }

    /// Emits the event built by `build` if `kind` passes the filter.
    pub fn emit_with(&self, kind: DebugEventKind, build: impl FnOnce() -> DebugEvent) {
        if !self.is_enabled_for(kind) {
            return;
        }
        let event = build();
        for sink in &self.sinks {
            sink.on_event(&event);
        }
    }

    pub fn emit(&self, event: DebugEvent) {
        self.emit_with(event.kind(), || event);
    }
}

/// Logs every event at debug level.
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn on_event(&self, event: &DebugEvent) {
        match serde_json::to_value(event) {
            Ok(value) => debug!(event = event.tag(), data = %value["data"], "debug event"),
            Err(_) => debug!(event = event.tag(), "debug event"),
        }
    }
}

/// One line of a debug event recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unix timestamp in milliseconds.
    pub ts: u64,
    pub event: String,
    pub data: serde_json::Value,
}

impl Record {
    pub fn from_event(event: &DebugEvent) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let data = serde_json::to_value(event)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null);
        Self {
            ts,
            event: event.tag().to_string(),
            data,
        }
    }
}

/// Writes each event as a JSON line, flushing immediately.
pub struct JsonlSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl JsonlSink<BufWriter<File>> {
    /// Appends to the file at `path`, creating parent directories.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_record(&self, record: &Record) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

impl<W: Write + Send> DebugSink for JsonlSink<W> {
    fn on_event(&self, event: &DebugEvent) {
        if let Err(e) = self.write_record(&Record::from_event(event)) {
            warn!(error = %e, "Failed to record debug event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_bus(bus: &mut DebugBus) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.add_sink(move |event: &DebugEvent| {
            sink.lock().unwrap().push(event.tag().to_string());
        });
        seen
    }

    #[test]
    fn test_disabled_bus_never_builds_events() {
        let built = AtomicUsize::new(0);
        let bus = DebugBus::disabled();
        bus.emit_with(DebugEventKind::FrameStart, || {
            built.fetch_add(1, Ordering::SeqCst);
            DebugEvent::FrameStart { frame: 1 }
        });
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_filter_limits_kinds() {
        let mut bus = DebugBus::enabled().with_filter([DebugEventKind::LoopTerminated]);
        let seen = counting_bus(&mut bus);
        bus.emit(DebugEvent::FrameStart { frame: 1 });
        bus.emit(DebugEvent::LoopTerminated {
            reason: "no_pending_nodes".to_string(),
        });
        assert_eq!(*seen.lock().unwrap(), vec!["loop:terminated"]);
    }

    #[test]
    fn test_events_reach_sinks_in_order() {
        let mut bus = DebugBus::enabled();
        let seen = counting_bus(&mut bus);
        bus.emit(DebugEvent::FrameStart { frame: 1 });
        bus.emit(DebugEvent::FrameEnd {
            frame: 1,
            dispatched: 0,
            running: 0,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["frame:start", "frame:end"]);
    }

    #[test]
    fn test_jsonl_sink_writes_records() {
        let sink = JsonlSink::new(Vec::new());
        sink.on_event(&DebugEvent::NodeExecuteStart {
            path: "claude[0]".to_string(),
            node_type: "claude".to_string(),
        });
        let output = String::from_utf8(sink.into_inner()).unwrap();
        let record: Record = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(record.event, "node:execute:start");
        assert_eq!(record.data["path"], "claude[0]");
        assert!(record.ts > 0);
    }

    #[test]
    fn test_from_config_creates_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug/events.jsonl");
        let config = DebugConfig {
            enabled: true,
            event_filter: vec!["frame:start".to_string()],
            jsonl_path: Some(path.display().to_string()),
        };
        let bus = DebugBus::from_config(&config).unwrap();
        bus.emit(DebugEvent::FrameStart { frame: 1 });
        bus.emit(DebugEvent::FrameStart { frame: 2 });
        bus.emit(DebugEvent::ControlStop { reason: None });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
