//! The rendering collaborator boundary.
//!
//! The core never draws; it asks a [`CellRenderer`] for displayed text and a
//! line count, and only the line count feeds back into layout. The context
//! object is owned by the notebook and passed down explicitly; there is no
//! process-global formatting state.

use crate::cell::{CellKind, DisplayState, OutputEntry};

/// Displayed text plus the number of terminal rows it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBlock {
    pub text: String,
    pub height: usize,
}

impl RenderedBlock {
    pub fn empty() -> Self {
        RenderedBlock {
            text: String::new(),
            height: 0,
        }
    }
}

/// Converts cell content into displayed text and heights.
///
/// Implementations supply highlighting, markdown formatting, wrapping, and
/// anything else presentation-level; the core only depends on the heights
/// being consistent with the text.
pub trait CellRenderer: Send {
    fn render_input(&self, kind: CellKind, source: &str, state: DisplayState) -> RenderedBlock;
    fn render_outputs(&self, outputs: &[OutputEntry]) -> RenderedBlock;
}

/// Formatting context owned by the notebook.
pub struct RenderContext {
    renderer: Box<dyn CellRenderer>,
}

impl RenderContext {
    pub fn new(renderer: Box<dyn CellRenderer>) -> Self {
        RenderContext { renderer }
    }

    /// Plain-text rendering, no highlighting.
    pub fn plain() -> Self {
        RenderContext::new(Box::new(PlainRenderer))
    }

    pub fn input_block(&self, kind: CellKind, source: &str, state: DisplayState) -> RenderedBlock {
        self.renderer.render_input(kind, source, state)
    }

    pub fn output_block(&self, outputs: &[OutputEntry]) -> RenderedBlock {
        self.renderer.render_outputs(outputs)
    }
}

/// Pass-through renderer: the text is shown as-is and heights are line
/// counts. An empty input still occupies one row.
pub struct PlainRenderer;

impl CellRenderer for PlainRenderer {
    fn render_input(&self, _kind: CellKind, source: &str, _state: DisplayState) -> RenderedBlock {
        let height = source.lines().count().max(1);
        RenderedBlock {
            text: source.to_string(),
            height,
        }
    }

    fn render_outputs(&self, outputs: &[OutputEntry]) -> RenderedBlock {
        if outputs.is_empty() {
            return RenderedBlock::empty();
        }
        let mut text = String::new();
        for entry in outputs {
            match entry {
                OutputEntry::Stream { text: t, .. } => {
                    text.push_str(t);
                    if !t.ends_with('\n') {
                        text.push('\n');
                    }
                }
                OutputEntry::Error {
                    ename,
                    evalue,
                    traceback,
                } => {
                    if traceback.is_empty() {
                        text.push_str(&format!("{}: {}\n", ename, evalue));
                    } else {
                        for line in traceback {
                            text.push_str(line);
                            text.push('\n');
                        }
                    }
                }
                OutputEntry::Value { text: t, label } => {
                    match label {
                        Some(n) => text.push_str(&format!("Out[{}]: {}", n, t)),
                        None => text.push_str(t),
                    }
                    if !t.ends_with('\n') {
                        text.push('\n');
                    }
                }
            }
        }
        let height = text.lines().count();
        RenderedBlock { text, height }
    }
}
