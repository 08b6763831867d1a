//! termbook - browse, edit, and execute Jupyter notebooks from the terminal.
//!
//! The core is four pieces: [`cell`] owns one cell's content and state,
//! [`execution`] correlates asynchronous kernel output back to the issuing
//! cell and serializes the kernel channel, [`viewport`] computes the visible
//! cell range for a limited number of terminal rows, and [`notebook`] ties
//! them together and carries the structural edit operations. Rendering is a
//! collaborator behind [`render::CellRenderer`]; the kernel wire protocol
//! lives in the `kernel-driver` crate.

pub mod cell;
pub mod execution;
pub mod format;
pub mod notebook;
pub mod render;
pub mod viewport;

pub use cell::{Cell, CellId, CellKind, DisplayState, ExecutionLabel, OutputEntry};
pub use execution::{ExecError, ExecutionRouter, KernelChannel};
pub use notebook::{Notebook, NotebookState, SharedState};
pub use render::{CellRenderer, PlainRenderer, RenderContext, RenderedBlock};
pub use viewport::{Viewport, ViewportManager};
