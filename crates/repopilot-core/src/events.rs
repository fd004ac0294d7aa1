//! Plan lifecycle events
//!
//! The engine reports plan and step lifecycle notifications to an
//! [`EventSink`]. Emission is fire-and-forget: sinks must not fail the
//! caller, and nothing inside the engine reads events back.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Plan lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Unique event ID
    pub event_id: Uuid,
    /// Plan the event belongs to
    pub plan_id: String,
    /// Event type
    pub event_type: PlanEventType,
    /// Step the event refers to, if any
    pub step_id: Option<String>,
    /// Event payload (inputs, outputs, durations, reasons)
    pub data: Value,
}

impl PlanEvent {
    /// Create a plan-level event
    pub fn new(plan_id: impl Into<String>, event_type: PlanEventType, data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            event_type,
            step_id: None,
            data,
        }
    }

    /// Create a step-level event
    pub fn for_step(
        plan_id: impl Into<String>,
        step_id: impl Into<String>,
        event_type: PlanEventType,
        data: Value,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::new(plan_id, event_type, data)
        }
    }
}

/// Type of plan event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanEventType {
    PlanBuilt,
    PlanStarted,
    StepStarted,
    StepRetrying,
    StepFinished,
    PlanFinished,
    Replanned,
    ReplanExhausted,
}

impl std::fmt::Display for PlanEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PlanBuilt => "plan_built",
            Self::PlanStarted => "plan_started",
            Self::StepStarted => "step_started",
            Self::StepRetrying => "step_retrying",
            Self::StepFinished => "step_finished",
            Self::PlanFinished => "plan_finished",
            Self::Replanned => "replanned",
            Self::ReplanExhausted => "replan_exhausted",
        };
        write!(f, "{}", name)
    }
}

/// Destination for lifecycle events
pub trait EventSink: Send + Sync {
    /// Record an event. Must not panic or block for long.
    fn emit(&self, event: PlanEvent);
}

/// Shared handle to a sink
pub type SharedSink = Arc<dyn EventSink>;

/// Default sink: forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PlanEvent) {
        match event.event_type {
            PlanEventType::StepStarted | PlanEventType::StepRetrying => debug!(
                plan_id = %event.plan_id,
                step_id = event.step_id.as_deref().unwrap_or("-"),
                event = %event.event_type,
                data = %event.data,
                "plan event"
            ),
            _ => info!(
                plan_id = %event.plan_id,
                step_id = event.step_id.as_deref().unwrap_or("-"),
                event = %event.event_type,
                "plan event"
            ),
        }
    }
}

/// Sink that keeps events in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<PlanEvent>>>,
}

impl MemoryEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of collected events
    pub fn events(&self) -> Vec<PlanEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events of one type
    pub fn of_type(&self, event_type: PlanEventType) -> Vec<PlanEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Drop collected events
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: PlanEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Sink appending one JSON object per line to a file
pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlEventSink {
    /// Open (or create) the file for appending.
    ///
    /// A file that cannot be opened turns the sink into a no-op.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(path = %parent.display(), error = %e, "Could not create event directory");
        }

        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not open event file");
                None
            }
        };

        Self {
            path,
            file: Mutex::new(file),
        }
    }

    /// Path of the event file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: PlanEvent) {
        if let Ok(mut guard) = self.file.lock()
            && let Some(ref mut file) = *guard
            && let Ok(json) = serde_json::to_string(&event)
        {
            if let Err(e) = writeln!(file, "{}", json).and_then(|_| file.flush()) {
                warn!(path = %self.path.display(), error = %e, "Could not write event");
            }
        }
    }
}

impl std::fmt::Debug for JsonlEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlEventSink")
            .field("path", &self.path)
            .finish()
    }
}

/// Read events back from a JSONL file, skipping malformed lines
pub fn read_events(path: &Path) -> Vec<PlanEvent> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    BufReader::new(file)
        .lines()
        .map_while(std::result::Result::ok)
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect()
}
