//! Evaluation tracing and explanation filters.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::ast::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceOp {
    Enter,
    Exit,
    Eval,
    Fail,
    Redo,
    Note,
}

impl fmt::Display for TraceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TraceOp::Enter => "Enter",
            TraceOp::Exit => "Exit",
            TraceOp::Eval => "Eval",
            TraceOp::Fail => "Fail",
            TraceOp::Redo => "Redo",
            TraceOp::Note => "Note",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub op: TraceOp,
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub depth: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub locals: BTreeMap<String, Value>,
}

/// Collects trace events in evaluation order.
#[derive(Debug, Default)]
pub struct BufferTracer {
    events: Vec<TraceEvent>,
}

impl BufferTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}

/// Keep only `trace()` notes.
pub fn filter_notes(events: Vec<TraceEvent>) -> Vec<TraceEvent> {
    events.into_iter().filter(|e| e.op == TraceOp::Note).collect()
}

/// Keep only failed expressions.
pub fn filter_fails(events: Vec<TraceEvent>) -> Vec<TraceEvent> {
    events.into_iter().filter(|e| e.op == TraceOp::Fail).collect()
}

/// Drop variable bindings from every event.
pub fn strip_locals(mut events: Vec<TraceEvent>) -> Vec<TraceEvent> {
    for e in &mut events {
        e.locals.clear();
    }
    events
}

/// Render events as indented, human-readable lines.
pub fn pretty(events: &[TraceEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| {
            let indent = "| ".repeat(e.depth);
            let location = e
                .location
                .map(|l| format!("{l} "))
                .unwrap_or_default();
            match &e.message {
                Some(msg) => format!("{location}{indent}{} {:?}", e.op, msg),
                None => format!("{location}{indent}{} {}", e.op, e.node),
            }
        })
        .collect()
}
