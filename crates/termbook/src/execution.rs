//! Execution correlation engine.
//!
//! The router is the single point of contact with the kernel channel. It
//! allocates sequence numbers, keeps the `msg_id -> sequence -> cell` maps,
//! admits one request to the channel at a time, and demultiplexes kernel
//! events back onto the issuing cell's output buffer. Callers of [`submit`]
//! observe run-to-completion semantics: the call returns once the kernel has
//! gone idle for that request.
//!
//! [`submit`]: ExecutionRouter::submit

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use kernel_driver::{EventPayload, KernelDriver, KernelEvent};
use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::watch;

use crate::cell::{CellId, ExecutionLabel, OutputEntry};
use crate::notebook::SharedState;

/// Failure surfaced by a submission.
#[derive(Debug, Error)]
pub enum ExecError {
    /// No kernel connection is available.
    #[error("no kernel running")]
    NoKernel,
    /// The kernel connection dropped while the request was in flight.
    #[error("kernel connection lost")]
    Disconnected,
    /// The channel rejected the request at dispatch.
    #[error("kernel channel error: {0}")]
    Channel(#[from] anyhow::Error),
}

/// The kernel channel as the router sees it.
///
/// The production implementation wraps [`KernelDriver`]; tests substitute a
/// scripted one. `dispatch` returns the correlation token that subsequent
/// events for this request carry; implementations must invoke `register`
/// with that token before the request goes out, so routing is in place when
/// the first event arrives.
pub trait KernelChannel: Send {
    fn is_running(&self) -> bool;
    fn dispatch<'a>(
        &'a mut self,
        code: &'a str,
        register: Box<dyn FnOnce(String) + Send>,
    ) -> BoxFuture<'a, anyhow::Result<String>>;
    fn shutdown<'a>(&'a mut self) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// A live kernel process behind [`KernelDriver`].
pub struct DriverChannel(KernelDriver);

impl DriverChannel {
    pub fn new(driver: KernelDriver) -> Self {
        DriverChannel(driver)
    }
}

impl KernelChannel for DriverChannel {
    fn is_running(&self) -> bool {
        self.0.is_running()
    }

    fn dispatch<'a>(
        &'a mut self,
        code: &'a str,
        register: Box<dyn FnOnce(String) + Send>,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(self.0.execute(code, register))
    }

    fn shutdown<'a>(&'a mut self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.0.shutdown())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Finished,
    Aborted,
}

struct InFlight {
    cell_id: CellId,
    done: watch::Sender<Option<Completion>>,
}

#[derive(Default)]
struct RouterState {
    next_seq: u32,
    in_flight: HashMap<u32, InFlight>,
    /// Correlation token (kernel msg_id) -> sequence number.
    tokens: HashMap<String, u32>,
    /// Cell -> its outstanding sequence number, for re-entrant run detection.
    by_cell: HashMap<CellId, u32>,
}

#[derive(Clone)]
pub struct ExecutionRouter {
    cells: SharedState,
    kernel: Arc<tokio::sync::Mutex<Option<Box<dyn KernelChannel>>>>,
    /// Held for the lifetime of each dispatched request: the channel takes
    /// one request at a time, so later submitters suspend here.
    gate: Arc<tokio::sync::Mutex<()>>,
    state: Arc<StdMutex<RouterState>>,
}

impl ExecutionRouter {
    pub fn new(cells: SharedState) -> Self {
        ExecutionRouter {
            cells,
            kernel: Arc::new(tokio::sync::Mutex::new(None)),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            state: Arc::new(StdMutex::new(RouterState {
                next_seq: 1,
                ..RouterState::default()
            })),
        }
    }

    /// Install (or replace) the kernel channel.
    pub async fn install_channel(&self, channel: Box<dyn KernelChannel>) {
        *self.kernel.lock().await = Some(channel);
    }

    /// Shut the kernel channel down. Any in-flight request is resolved with
    /// an error first so no waiter hangs.
    pub async fn shutdown_kernel(&self) -> anyhow::Result<()> {
        self.fail_all();
        let mut guard = self.kernel.lock().await;
        if let Some(mut channel) = guard.take() {
            channel.shutdown().await?;
        }
        Ok(())
    }

    pub async fn kernel_running(&self) -> bool {
        self.kernel
            .lock()
            .await
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    /// True if the cell has an outstanding execution.
    pub fn is_pending(&self, cell_id: CellId) -> bool {
        self.state.lock().unwrap().by_cell.contains_key(&cell_id)
    }

    /// Submit the cell's code for execution and wait for the kernel to
    /// complete it. Returns the sequence number of the execution.
    ///
    /// If the cell already has an execution outstanding, this joins it:
    /// no second request is submitted, and the call resolves together with
    /// the first one, returning its sequence number.
    pub async fn submit(&self, cell_id: CellId, code: &str) -> Result<u32, ExecError> {
        if let Some((seq, rx)) = self.outstanding(cell_id) {
            debug!("joining in-flight execution #{} for cell {}", seq, cell_id);
            return await_completion(seq, rx).await;
        }

        if !self.kernel_running().await {
            return Err(ExecError::NoKernel);
        }

        let (seq, done_rx) = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            let (done_tx, done_rx) = watch::channel(None);
            state.in_flight.insert(
                seq,
                InFlight {
                    cell_id,
                    done: done_tx,
                },
            );
            state.by_cell.insert(cell_id, seq);
            (seq, done_rx)
        };

        // One request on the channel at a time.
        let _gate = self.gate.lock().await;

        // The routing entry is written by the channel just before the
        // request goes out, so the first event cannot outrun it.
        let state = self.state.clone();
        let register = Box::new(move |token: String| {
            state.lock().unwrap().tokens.insert(token, seq);
        });

        let dispatched = {
            let mut kernel = self.kernel.lock().await;
            match kernel.as_mut() {
                Some(channel) if channel.is_running() => channel.dispatch(code, register).await,
                _ => Err(anyhow::anyhow!("kernel went away before dispatch")),
            }
        };
        let token = match dispatched {
            Ok(token) => token,
            Err(e) => {
                self.abandon(seq);
                return Err(ExecError::Channel(e));
            }
        };
        debug!(
            "dispatched execution #{} (cell {}, token {})",
            seq, cell_id, token
        );

        await_completion(seq, done_rx).await
    }

    /// Route one kernel event. Called from the event pump task; only brief
    /// synchronous locks are taken, never across an await.
    pub fn handle_event(&self, event: KernelEvent) {
        if matches!(event.payload, EventPayload::Disconnected) {
            self.fail_all();
            return;
        }
        let Some(token) = event.token else {
            debug!("dropping kernel event without correlation token");
            return;
        };
        let routed = {
            let state = self.state.lock().unwrap();
            state.tokens.get(&token).copied().and_then(|seq| {
                state
                    .in_flight
                    .get(&seq)
                    .map(|request| (seq, request.cell_id))
            })
        };
        let Some((seq, cell_id)) = routed else {
            debug!("dropping unroutable kernel event (token {})", token);
            return;
        };

        match event.payload {
            EventPayload::Stream { name, text } => {
                self.append(cell_id, OutputEntry::Stream { name, text });
            }
            EventPayload::ExecuteResult { text } => {
                self.append(
                    cell_id,
                    OutputEntry::Value {
                        text,
                        label: Some(seq),
                    },
                );
            }
            EventPayload::DisplayData { text } => {
                self.append(cell_id, OutputEntry::Value { text, label: None });
            }
            EventPayload::Error {
                ename,
                evalue,
                traceback,
            } => {
                self.append(
                    cell_id,
                    OutputEntry::Error {
                        ename,
                        evalue,
                        traceback,
                    },
                );
            }
            EventPayload::Idle => self.finish(seq, cell_id),
            EventPayload::Busy | EventPayload::Disconnected => {}
        }
    }

    fn outstanding(
        &self,
        cell_id: CellId,
    ) -> Option<(u32, watch::Receiver<Option<Completion>>)> {
        let state = self.state.lock().unwrap();
        let seq = *state.by_cell.get(&cell_id)?;
        let rx = state.in_flight.get(&seq)?.done.subscribe();
        Some((seq, rx))
    }

    /// Forget a request that never made it onto the channel.
    fn abandon(&self, seq: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(request) = state.in_flight.remove(&seq) {
            state.by_cell.remove(&request.cell_id);
        }
        state.tokens.retain(|_, s| *s != seq);
    }

    fn append(&self, cell_id: CellId, entry: OutputEntry) {
        let mut cells = self.cells.lock().unwrap();
        match cells.cell_mut(cell_id) {
            Some(cell) => cell.push_output(entry),
            None => debug!("output for deleted cell {} dropped", cell_id),
        }
    }

    /// The kernel signalled end of execution for `seq`: drop the mappings,
    /// stamp the cell, and release the waiter (which in turn releases the
    /// channel gate).
    fn finish(&self, seq: u32, cell_id: CellId) {
        let done = {
            let mut state = self.state.lock().unwrap();
            state.tokens.retain(|_, s| *s != seq);
            state.by_cell.remove(&cell_id);
            state.in_flight.remove(&seq).map(|request| request.done)
        };
        {
            let mut cells = self.cells.lock().unwrap();
            if let Some(cell) = cells.cell_mut(cell_id) {
                cell.set_label(ExecutionLabel::Completed(seq));
            }
        }
        if let Some(done) = done {
            let _ = done.send(Some(Completion::Finished));
        }
        info!("execution #{} completed", seq);
    }

    /// The connection is gone: resolve every blocked waiter with an error
    /// and put pending cells back into a runnable state.
    fn fail_all(&self) {
        let drained: Vec<InFlight> = {
            let mut state = self.state.lock().unwrap();
            state.tokens.clear();
            state.by_cell.clear();
            state.in_flight.drain().map(|(_, request)| request).collect()
        };
        if drained.is_empty() {
            return;
        }
        error!(
            "kernel connection lost with {} execution(s) in flight",
            drained.len()
        );
        {
            let mut cells = self.cells.lock().unwrap();
            for request in &drained {
                if let Some(cell) = cells.cell_mut(request.cell_id) {
                    if cell.label() == ExecutionLabel::Pending {
                        cell.set_label(ExecutionLabel::None);
                    }
                }
            }
        }
        for request in drained {
            let _ = request.done.send(Some(Completion::Aborted));
        }
    }
}

async fn await_completion(
    seq: u32,
    mut rx: watch::Receiver<Option<Completion>>,
) -> Result<u32, ExecError> {
    let completion = rx
        .wait_for(|c| c.is_some())
        .await
        .map(|c| *c)
        .map_err(|_| ExecError::Disconnected)?;
    match completion {
        Some(Completion::Finished) => Ok(seq),
        _ => Err(ExecError::Disconnected),
    }
}
