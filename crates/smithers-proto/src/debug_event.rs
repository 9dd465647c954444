//! Debug events describing scheduling decisions.
//!
//! The execution loop emits these for tests and observability. They are
//! tagged with the same `scope:action` names used by event filters.

use serde::{Deserialize, Serialize};

/// A structured trace event from the execution loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DebugEvent {
    #[serde(rename = "frame:start")]
    FrameStart { frame: u32 },

    #[serde(rename = "frame:render")]
    FrameRender { frame: u32, node_count: usize },

    #[serde(rename = "frame:end")]
    FrameEnd {
        frame: u32,
        dispatched: usize,
        running: usize,
    },

    #[serde(rename = "node:found")]
    NodeFound {
        path: String,
        node_type: String,
        content_hash: String,
    },

    #[serde(rename = "node:execute:start")]
    NodeExecuteStart { path: String, node_type: String },

    #[serde(rename = "node:execute:end")]
    NodeExecuteEnd {
        path: String,
        duration_ms: u64,
        status: String,
    },

    #[serde(rename = "phase:advance")]
    PhaseAdvance {
        phase: String,
        index: usize,
        status: String,
    },

    #[serde(rename = "control:stop")]
    ControlStop { reason: Option<String> },

    #[serde(rename = "control:human")]
    ControlHuman { request_id: String, message: String },

    #[serde(rename = "loop:terminated")]
    LoopTerminated { reason: String },
}

/// Tag of a debug event, available without building the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugEventKind {
    FrameStart,
    FrameRender,
    FrameEnd,
    NodeFound,
    NodeExecuteStart,
    NodeExecuteEnd,
    PhaseAdvance,
    ControlStop,
    ControlHuman,
    LoopTerminated,
}

impl DebugEventKind {
    /// All kinds, in emission-lifecycle order.
    pub const ALL: [DebugEventKind; 10] = [
        DebugEventKind::FrameStart,
        DebugEventKind::FrameRender,
        DebugEventKind::FrameEnd,
        DebugEventKind::NodeFound,
        DebugEventKind::NodeExecuteStart,
        DebugEventKind::NodeExecuteEnd,
        DebugEventKind::PhaseAdvance,
        DebugEventKind::ControlStop,
        DebugEventKind::ControlHuman,
        DebugEventKind::LoopTerminated,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            DebugEventKind::FrameStart => "frame:start",
            DebugEventKind::FrameRender => "frame:render",
            DebugEventKind::FrameEnd => "frame:end",
            DebugEventKind::NodeFound => "node:found",
            DebugEventKind::NodeExecuteStart => "node:execute:start",
            DebugEventKind::NodeExecuteEnd => "node:execute:end",
            DebugEventKind::PhaseAdvance => "phase:advance",
            DebugEventKind::ControlStop => "control:stop",
            DebugEventKind::ControlHuman => "control:human",
            DebugEventKind::LoopTerminated => "loop:terminated",
        }
    }

    /// Parses a tag such as `node:found`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl DebugEvent {
    pub fn kind(&self) -> DebugEventKind {
        match self {
            DebugEvent::FrameStart { .. } => DebugEventKind::FrameStart,
            DebugEvent::FrameRender { .. } => DebugEventKind::FrameRender,
            DebugEvent::FrameEnd { .. } => DebugEventKind::FrameEnd,
            DebugEvent::NodeFound { .. } => DebugEventKind::NodeFound,
            DebugEvent::NodeExecuteStart { .. } => DebugEventKind::NodeExecuteStart,
            DebugEvent::NodeExecuteEnd { .. } => DebugEventKind::NodeExecuteEnd,
            DebugEvent::PhaseAdvance { .. } => DebugEventKind::PhaseAdvance,
            DebugEvent::ControlStop { .. } => DebugEventKind::ControlStop,
            DebugEvent::ControlHuman { .. } => DebugEventKind::ControlHuman,
            DebugEvent::LoopTerminated { .. } => DebugEventKind::LoopTerminated,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.kind().tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_colon_tags() {
        let event = DebugEvent::NodeExecuteEnd {
            path: "group[0]/claude[0]".to_string(),
            duration_ms: 12,
            status: "complete".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "node:execute:end");
        assert_eq!(json["data"]["duration_ms"], 12);

        let back: DebugEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_tag_lookup() {
        for kind in DebugEventKind::ALL {
            assert_eq!(DebugEventKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(DebugEventKind::from_tag("frame:unknown"), None);
        assert_eq!(
            DebugEvent::ControlStop { reason: None }.tag(),
            "control:stop"
        );
    }
}
