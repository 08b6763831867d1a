//! One notebook cell: identity, input text, output buffer, execution and
//! display state, and a cached rendered height.

use std::fmt;

use kernel_driver::StreamName;
use uuid::Uuid;

use crate::render::RenderContext;

/// Stable identity for a cell, independent of its position in the notebook.
///
/// Positions shift under move/cut/paste while executions are in flight; the
/// id is what routing resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(Uuid);

impl CellId {
    pub fn new() -> Self {
        CellId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a cell holds: executable code or markdown text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Code,
    Markdown,
}

/// Whether the cell's input is being edited or viewed.
///
/// Editing is only legal for the focused cell; `Notebook` enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Readonly,
    Editing,
}

/// Execution label shown next to a code cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionLabel {
    /// Never executed, or cleared.
    None,
    /// Submitted, output still arriving. Rendered as `*`.
    Pending,
    /// Finished with this sequence number.
    Completed(u32),
}

/// One entry in a cell's output buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEntry {
    /// stdout/stderr text. Consecutive writes to the same stream merge.
    Stream { name: StreamName, text: String },
    /// An exception and its rendered traceback.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// An execution result (labelled) or display payload (unlabelled),
    /// text/plain form.
    Value { text: String, label: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct Cell {
    id: CellId,
    kind: CellKind,
    source: String,
    outputs: Vec<OutputEntry>,
    label: ExecutionLabel,
    display_state: DisplayState,
    /// Cached rendered height in terminal rows; `None` when stale.
    height: Option<usize>,
}

impl Cell {
    pub fn new(kind: CellKind) -> Self {
        Cell {
            id: CellId::new(),
            kind,
            source: String::new(),
            outputs: Vec::new(),
            label: ExecutionLabel::None,
            display_state: DisplayState::Readonly,
            height: None,
        }
    }

    pub fn with_source(kind: CellKind, source: impl Into<String>) -> Self {
        let mut cell = Cell::new(kind);
        cell.source = source.into();
        cell
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn outputs(&self) -> &[OutputEntry] {
        &self.outputs
    }

    pub fn label(&self) -> ExecutionLabel {
        self.label
    }

    pub fn display_state(&self) -> DisplayState {
        self.display_state
    }

    /// True if there is nothing to execute.
    pub fn is_blank(&self) -> bool {
        self.source.trim().is_empty()
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
        self.height = None;
    }

    /// Change the cell kind. Idempotent; switching away from code drops the
    /// execution state and outputs. Returns whether anything changed.
    pub fn set_kind(&mut self, kind: CellKind) -> bool {
        if self.kind == kind {
            return false;
        }
        self.kind = kind;
        if kind == CellKind::Markdown {
            self.outputs.clear();
            self.label = ExecutionLabel::None;
        }
        self.height = None;
        true
    }

    pub fn begin_edit(&mut self) {
        self.display_state = DisplayState::Editing;
        self.height = None;
    }

    pub fn end_edit(&mut self) {
        self.display_state = DisplayState::Readonly;
        self.height = None;
    }

    /// Drop all outputs and the execution label. No-op when the output
    /// buffer is already empty, so unrelated updates cause no height churn.
    /// Returns whether anything changed.
    pub fn clear_output(&mut self) -> bool {
        if self.outputs.is_empty() && self.label == ExecutionLabel::None {
            return false;
        }
        self.outputs.clear();
        self.label = ExecutionLabel::None;
        self.height = None;
        true
    }

    /// Append an output entry, folding consecutive writes to the same
    /// stream into one entry.
    pub fn push_output(&mut self, entry: OutputEntry) {
        if let OutputEntry::Stream { name, text } = &entry {
            if let Some(OutputEntry::Stream {
                name: last_name,
                text: last_text,
            }) = self.outputs.last_mut()
            {
                if *last_name == *name {
                    last_text.push_str(text);
                    self.height = None;
                    return;
                }
            }
        }
        self.outputs.push(entry);
        self.height = None;
    }

    pub fn set_label(&mut self, label: ExecutionLabel) {
        self.label = label;
    }

    /// Deep copy with a fresh id, for copy/paste.
    pub fn duplicate(&self) -> Cell {
        let mut copy = self.clone();
        copy.id = CellId::new();
        copy.display_state = DisplayState::Readonly;
        copy
    }

    /// Rendered height in rows, computed through the render context and
    /// cached until input, outputs, kind, or display state change.
    pub fn rendered_height(&mut self, render: &RenderContext) -> usize {
        if let Some(height) = self.height {
            return height;
        }
        let input = render.input_block(self.kind, &self.source, self.display_state);
        let outputs = render.output_block(&self.outputs);
        let height = input.height + outputs.height;
        self.height = Some(height);
        height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderContext;

    #[test]
    fn test_new_cell_is_empty_readonly() {
        let cell = Cell::new(CellKind::Code);
        assert!(cell.is_blank());
        assert!(cell.outputs().is_empty());
        assert_eq!(cell.label(), ExecutionLabel::None);
        assert_eq!(cell.display_state(), DisplayState::Readonly);
    }

    #[test]
    fn test_set_kind_is_idempotent() {
        let mut cell = Cell::new(CellKind::Code);
        cell.push_output(OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "hi\n".into(),
        });
        assert!(!cell.set_kind(CellKind::Code));
        assert_eq!(cell.outputs().len(), 1);
    }

    #[test]
    fn test_set_kind_markdown_drops_execution_state() {
        let mut cell = Cell::new(CellKind::Code);
        cell.push_output(OutputEntry::Value {
            text: "2".into(),
            label: Some(1),
        });
        cell.set_label(ExecutionLabel::Completed(1));

        assert!(cell.set_kind(CellKind::Markdown));
        assert!(cell.outputs().is_empty());
        assert_eq!(cell.label(), ExecutionLabel::None);
    }

    #[test]
    fn test_clear_output_twice_is_idempotent() {
        let mut cell = Cell::new(CellKind::Code);
        cell.push_output(OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "hi\n".into(),
        });
        cell.set_label(ExecutionLabel::Completed(3));

        assert!(cell.clear_output());
        let after_first = cell.clone();
        assert!(!cell.clear_output());
        assert_eq!(cell.outputs(), after_first.outputs());
        assert_eq!(cell.label(), after_first.label());
    }

    #[test]
    fn test_push_output_merges_consecutive_same_stream() {
        let mut cell = Cell::new(CellKind::Code);
        cell.push_output(OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "a".into(),
        });
        cell.push_output(OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "b".into(),
        });

        assert_eq!(cell.outputs().len(), 1);
        assert_eq!(
            cell.outputs()[0],
            OutputEntry::Stream {
                name: StreamName::Stdout,
                text: "ab".into()
            }
        );
    }

    #[test]
    fn test_push_output_does_not_merge_across_streams() {
        let mut cell = Cell::new(CellKind::Code);
        cell.push_output(OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "a".into(),
        });
        cell.push_output(OutputEntry::Stream {
            name: StreamName::Stderr,
            text: "b".into(),
        });

        assert_eq!(cell.outputs().len(), 2);
    }

    #[test]
    fn test_duplicate_gets_fresh_id() {
        let cell = Cell::with_source(CellKind::Code, "x = 1");
        let copy = cell.duplicate();

        assert_ne!(cell.id(), copy.id());
        assert_eq!(cell.source(), copy.source());
    }

    #[test]
    fn test_rendered_height_is_cached_and_invalidated() {
        let render = RenderContext::plain();
        let mut cell = Cell::with_source(CellKind::Code, "a\nb");
        assert_eq!(cell.rendered_height(&render), 2);

        cell.set_source("a\nb\nc");
        assert_eq!(cell.rendered_height(&render), 3);

        cell.push_output(OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "out\n".into(),
        });
        assert_eq!(cell.rendered_height(&render), 4);
    }
}
