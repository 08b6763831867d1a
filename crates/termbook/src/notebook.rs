//! Notebook orchestration.
//!
//! `Notebook` owns the ordered cell list, the focused index, and the
//! dirty/quit-confirmation flags, and wires the execution router and the
//! viewport manager together. Structural edits always update the cell list
//! and the focus in the same step, then re-derive the visible window; the
//! router and viewport never mutate cell order themselves.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use kernel_driver::KernelDriver;
use log::{info, warn};
use tokio::sync::mpsc;

use crate::cell::{Cell, CellId, CellKind, ExecutionLabel};
use crate::execution::{DriverChannel, ExecError, ExecutionRouter, KernelChannel};
use crate::format;
use crate::render::RenderContext;
use crate::viewport::{Viewport, ViewportManager};

/// Rows assumed usable for cell content until the terminal layer reports a
/// real size.
pub const DEFAULT_AVAILABLE_ROWS: usize = 40;

/// The mutable notebook document: cells plus the flags that travel with
/// them. Shared between the notebook (edits) and the router (output
/// delivery); locked briefly, never across an await.
pub struct NotebookState {
    cells: Vec<Cell>,
    focused: usize,
    dirty: bool,
    quitting: bool,
    copied: Option<Cell>,
    path: Option<PathBuf>,
    metadata: nbformat::v4::Metadata,
}

pub type SharedState = Arc<StdMutex<NotebookState>>;

impl NotebookState {
    /// A notebook is never empty: start with one blank code cell.
    pub fn new_empty() -> Self {
        NotebookState {
            cells: vec![Cell::new(CellKind::Code)],
            focused: 0,
            dirty: false,
            quitting: false,
            copied: None,
            path: None,
            metadata: format::empty_metadata(),
        }
    }

    pub fn from_parts(
        cells: Vec<Cell>,
        metadata: nbformat::v4::Metadata,
        path: Option<PathBuf>,
    ) -> Self {
        let mut state = NotebookState::new_empty();
        if !cells.is_empty() {
            state.cells = cells;
        }
        state.metadata = metadata;
        state.path = path;
        state
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub(crate) fn cells_mut(&mut self) -> &mut Vec<Cell> {
        &mut self.cells
    }

    pub fn focused(&self) -> usize {
        self.focused
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn metadata(&self) -> &nbformat::v4::Metadata {
        &self.metadata
    }

    pub(crate) fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.id() == id)
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.quitting = false;
    }

    /// Restore the never-empty invariant after a removal.
    fn ensure_non_empty(&mut self) {
        if self.cells.is_empty() {
            self.cells.push(Cell::new(CellKind::Code));
        }
        self.focused = self.focused.min(self.cells.len() - 1);
    }
}

pub struct Notebook {
    state: SharedState,
    router: ExecutionRouter,
    viewport: ViewportManager,
    render: RenderContext,
    available_height: usize,
}

impl Notebook {
    pub fn new(render: RenderContext) -> Self {
        Notebook::from_state(NotebookState::new_empty(), render)
    }

    /// Open a notebook file, or start a fresh one at that path if it does
    /// not exist yet.
    pub fn open(path: &Path, render: RenderContext) -> Result<Self> {
        let state = if path.exists() {
            let loaded = format::load_notebook(path)?;
            NotebookState::from_parts(loaded.cells, loaded.metadata, Some(path.to_path_buf()))
        } else {
            let mut state = NotebookState::new_empty();
            state.path = Some(path.to_path_buf());
            state
        };
        Ok(Notebook::from_state(state, render))
    }

    fn from_state(state: NotebookState, render: RenderContext) -> Self {
        let shared = Arc::new(StdMutex::new(state));
        let router = ExecutionRouter::new(shared.clone());
        let mut notebook = Notebook {
            state: shared,
            router,
            viewport: ViewportManager::new(),
            render,
            available_height: DEFAULT_AVAILABLE_ROWS,
        };
        notebook.refresh_viewport();
        notebook
    }

    pub fn router(&self) -> ExecutionRouter {
        self.router.clone()
    }

    /// Cloned snapshot of the cell list, for inspection.
    pub fn cells(&self) -> Vec<Cell> {
        self.state.lock().unwrap().cells.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        // The cell list is never empty; this mirrors `len` for API shape.
        self.len() == 0
    }

    pub fn focused_index(&self) -> usize {
        self.state.lock().unwrap().focused
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().path.clone()
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport.window()
    }

    /// Report the rows usable for cell content (terminal height minus
    /// chrome), as measured by the terminal layer.
    pub fn set_available_height(&mut self, rows: usize) {
        self.available_height = rows;
        self.refresh_viewport();
    }

    // ------------------------------------------------------------------
    // Focus and editing
    // ------------------------------------------------------------------

    pub fn focus(&mut self, index: usize) {
        {
            let mut state = self.state.lock().unwrap();
            if state.cells.is_empty() {
                return;
            }
            let index = index.min(state.cells.len() - 1);
            if index != state.focused {
                // Editing is only legal for the focused cell.
                let old = state.focused;
                state.cells[old].end_edit();
            }
            state.focused = index;
            state.quitting = false;
        }
        self.refresh_viewport();
    }

    pub fn focus_up(&mut self) {
        let focused = self.focused_index();
        if focused > 0 {
            self.focus(focused - 1);
        }
    }

    pub fn focus_down(&mut self) {
        self.focus(self.focused_index() + 1);
    }

    pub fn begin_edit(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            let focused = state.focused;
            state.cells[focused].begin_edit();
            state.quitting = false;
        }
        self.refresh_viewport();
    }

    /// Leave edit mode, committing the editor's buffer back into the cell
    /// when it changed.
    pub fn end_edit(&mut self, committed: Option<&str>) {
        {
            let mut state = self.state.lock().unwrap();
            let focused = state.focused;
            if let Some(text) = committed {
                if text != state.cells[focused].source() {
                    state.cells[focused].set_source(text);
                    state.touch();
                }
            }
            state.cells[focused].end_edit();
        }
        self.refresh_viewport();
    }

    // ------------------------------------------------------------------
    // Structural edits
    // ------------------------------------------------------------------

    /// Insert a blank code cell at the focused position, or just below it.
    pub fn insert(&mut self, below: bool) {
        {
            let mut state = self.state.lock().unwrap();
            let index = state.focused + usize::from(below);
            state.cells.insert(index, Cell::new(CellKind::Code));
            state.focused = index;
            state.touch();
        }
        self.refresh_viewport();
    }

    pub fn delete(&mut self) {
        let focused = self.focused_index();
        self.delete_at(focused);
    }

    pub fn delete_at(&mut self, index: usize) {
        {
            let mut state = self.state.lock().unwrap();
            if index >= state.cells.len() {
                return;
            }
            state.cells.remove(index);
            state.focused = index;
            state.ensure_non_empty();
            state.touch();
        }
        self.refresh_viewport();
    }

    pub fn cut(&mut self) {
        let focused = self.focused_index();
        self.cut_at(focused);
    }

    /// Remove the cell and keep it in the paste buffer.
    pub fn cut_at(&mut self, index: usize) {
        {
            let mut state = self.state.lock().unwrap();
            if index >= state.cells.len() {
                return;
            }
            let removed = state.cells.remove(index);
            state.copied = Some(removed);
            state.focused = index;
            state.ensure_non_empty();
            state.touch();
        }
        self.refresh_viewport();
    }

    pub fn copy(&mut self) {
        let mut state = self.state.lock().unwrap();
        let focused = state.focused;
        state.copied = Some(state.cells[focused].clone());
        state.quitting = false;
    }

    /// Paste a copy of the buffered cell at the focused position, or just
    /// below it.
    pub fn paste(&mut self, below: bool) {
        let index = self.focused_index() + usize::from(below);
        self.paste_at(index);
    }

    pub fn paste_at(&mut self, index: usize) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(pasted) = state.copied.as_ref().map(Cell::duplicate) else {
                return;
            };
            let index = index.min(state.cells.len());
            state.cells.insert(index, pasted);
            state.focused = index;
            state.touch();
        }
        self.refresh_viewport();
    }

    pub fn move_up(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            let index = state.focused;
            if index == 0 {
                return;
            }
            state.cells.swap(index - 1, index);
            state.focused = index - 1;
            state.touch();
        }
        self.refresh_viewport();
    }

    pub fn move_down(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            let index = state.focused;
            if index + 1 >= state.cells.len() {
                return;
            }
            state.cells.swap(index, index + 1);
            state.focused = index + 1;
            state.touch();
        }
        self.refresh_viewport();
    }

    /// Change the focused cell's kind.
    pub fn set_focused_kind(&mut self, kind: CellKind) {
        {
            let mut state = self.state.lock().unwrap();
            let focused = state.focused;
            if state.cells[focused].set_kind(kind) {
                state.touch();
            }
        }
        self.refresh_viewport();
    }

    pub fn clear_output(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            let focused = state.focused;
            if state.cells[focused].clear_output() {
                state.touch();
            }
        }
        self.refresh_viewport();
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run one cell to completion.
    ///
    /// Markdown and blank code cells only clear stale output. A cell with a
    /// run already outstanding joins that run instead of resubmitting. With
    /// no kernel available the cell is left unexecuted, label `None`.
    pub async fn run_cell(&mut self, index: usize) -> Result<()> {
        let (cell_id, kind, source) = {
            let mut state = self.state.lock().unwrap();
            if state.cells.is_empty() {
                return Ok(());
            }
            let index = index.min(state.cells.len() - 1);
            state.focused = index;
            state.quitting = false;
            let cell = &state.cells[index];
            (cell.id(), cell.kind(), cell.source().to_string())
        };
        self.refresh_viewport();

        if kind == CellKind::Markdown || source.trim().is_empty() {
            // Rerun semantics without submitting work: drop stale output.
            {
                let mut state = self.state.lock().unwrap();
                let changed = state
                    .cell_mut(cell_id)
                    .map(|cell| cell.clear_output())
                    .unwrap_or(false);
                if changed {
                    state.dirty = true;
                }
            }
            self.refresh_viewport();
            return Ok(());
        }

        if self.router.is_pending(cell_id) {
            // Wait for the outstanding run rather than submit a second one.
            self.router.submit(cell_id, &source).await?;
            self.refresh_viewport();
            return Ok(());
        }

        if !self.router.kernel_running().await {
            warn!("no kernel running; cell left unexecuted");
            return Ok(());
        }

        {
            let mut state = self.state.lock().unwrap();
            if let Some(cell) = state.cell_mut(cell_id) {
                cell.clear_output();
                cell.set_label(ExecutionLabel::Pending);
            }
            state.dirty = true;
        }
        self.refresh_viewport();

        match self.router.submit(cell_id, &source).await {
            // The router stamps Completed(seq) when the kernel goes idle.
            Ok(_seq) => {}
            Err(ExecError::NoKernel) => {
                let mut state = self.state.lock().unwrap();
                if let Some(cell) = state.cell_mut(cell_id) {
                    cell.set_label(ExecutionLabel::None);
                }
                warn!("no kernel running; cell left unexecuted");
            }
            Err(e) => {
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(cell) = state.cell_mut(cell_id) {
                        cell.set_label(ExecutionLabel::None);
                    }
                }
                self.refresh_viewport();
                return Err(e.into());
            }
        }
        self.refresh_viewport();
        Ok(())
    }

    /// Run every cell in position order, each awaited to completion before
    /// the next starts.
    pub async fn run_all(&mut self) -> Result<()> {
        let mut index = 0;
        while index < self.len() {
            self.run_cell(index).await?;
            index += 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Kernel lifecycle
    // ------------------------------------------------------------------

    /// Start a kernel and wire its event stream into the router.
    ///
    /// The kernelspec is the explicit argument if given, else the one named
    /// in the notebook's metadata, else `python3`.
    pub async fn start_kernel(&mut self, kernelspec: Option<&str>) -> Result<()> {
        let name = kernelspec
            .map(str::to_string)
            .or_else(|| self.kernel_name_from_metadata())
            .unwrap_or_else(|| "python3".to_string());

        let (event_tx, event_rx) = mpsc::channel(256);
        let mut driver = KernelDriver::default();
        driver.start(&name, event_tx).await?;
        info!("kernel {} attached", name);

        self.attach_kernel(Box::new(DriverChannel::new(driver)), event_rx)
            .await;
        Ok(())
    }

    /// Install a kernel channel and spawn the pump that feeds its events to
    /// the router. Split out from `start_kernel` so tests can attach a
    /// scripted channel.
    pub async fn attach_kernel(
        &self,
        channel: Box<dyn KernelChannel>,
        mut events: mpsc::Receiver<kernel_driver::KernelEvent>,
    ) {
        self.router.install_channel(channel).await;
        let router = self.router.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                router.handle_event(event);
            }
        });
    }

    pub async fn stop_kernel(&mut self) -> Result<()> {
        self.router.shutdown_kernel().await
    }

    fn kernel_name_from_metadata(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        let value = serde_json::to_value(state.metadata()).ok()?;
        value
            .get("kernelspec")?
            .get("name")?
            .as_str()
            .map(str::to_string)
    }

    // ------------------------------------------------------------------
    // Persistence and exit
    // ------------------------------------------------------------------

    /// Save to `path`, or to the notebook's own path. Returns where it was
    /// written.
    pub fn save(&mut self, path: Option<PathBuf>) -> Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        let target = path
            .or_else(|| state.path.clone())
            .ok_or_else(|| anyhow!("no save path for untitled notebook"))?;
        format::save_notebook(&target, &state)?;
        state.path = Some(target.clone());
        state.dirty = false;
        Ok(target)
    }

    /// Ask to exit. Returns true when exiting is fine; the first request
    /// with unsaved changes instead arms the confirmation flag, and any
    /// other operation disarms it.
    pub fn request_quit(&mut self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.dirty && !state.quitting {
            state.quitting = true;
            return false;
        }
        true
    }

    pub fn is_quitting(&self) -> bool {
        self.state.lock().unwrap().quitting
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    /// Re-derive the visible window from current heights and focus.
    pub fn refresh_viewport(&mut self) -> Option<Viewport> {
        let (focused, heights) = {
            let mut state = self.state.lock().unwrap();
            let render = &self.render;
            let heights: Vec<usize> = state
                .cells
                .iter_mut()
                .map(|cell| cell.rendered_height(render))
                .collect();
            (state.focused, heights)
        };
        self.viewport
            .ensure_visible(focused, &heights, self.available_height)
    }

    /// Render the whole notebook as plain text, one block per cell.
    pub fn render_plain(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        for cell in state.cells.iter() {
            match cell.kind() {
                CellKind::Code => {
                    let label = match cell.label() {
                        ExecutionLabel::Completed(n) => n.to_string(),
                        ExecutionLabel::Pending => "*".to_string(),
                        ExecutionLabel::None => " ".to_string(),
                    };
                    let block =
                        self.render
                            .input_block(cell.kind(), cell.source(), cell.display_state());
                    let prefix = format!("In [{}]: ", label);
                    let indent = " ".repeat(prefix.len());
                    for (i, line) in block.text.lines().enumerate() {
                        if i == 0 {
                            out.push_str(&prefix);
                        } else {
                            out.push_str(&indent);
                        }
                        out.push_str(line);
                        out.push('\n');
                    }
                    if block.text.is_empty() {
                        out.push_str(&prefix);
                        out.push('\n');
                    }
                    let outputs = self.render.output_block(cell.outputs());
                    if outputs.height > 0 {
                        out.push_str(&outputs.text);
                    }
                }
                CellKind::Markdown => {
                    let block =
                        self.render
                            .input_block(cell.kind(), cell.source(), cell.display_state());
                    out.push_str(&block.text);
                    out.push('\n');
                }
            }
            out.push('\n');
        }
        out
    }
}
