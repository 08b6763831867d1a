//! Kernel process lifecycle and channel plumbing.
//!
//! `KernelDriver` owns one kernel: it spawns the process from a kernelspec,
//! writes the connection file, holds the shell writer for execute requests,
//! and forwards decoded iopub traffic to the consumer as [`KernelEvent`]s
//! over an mpsc channel. The wire protocol itself lives in `runtimelib` and
//! `jupyter-protocol`; this crate only adapts it.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, JupyterMessage, KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info};
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod events;

pub use events::{decode_iopub, EventPayload, KernelEvent, StreamName};

/// A kernelspec known to the local Jupyter installation.
#[derive(Debug, Clone)]
pub struct KernelspecSummary {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

/// List installed kernelspecs.
pub async fn list_kernelspecs() -> Vec<KernelspecSummary> {
    runtimelib::list_kernelspecs()
        .await
        .into_iter()
        .map(|s| KernelspecSummary {
            name: s.kernel_name,
            display_name: s.kernelspec.display_name,
            language: s.kernelspec.language,
        })
        .collect()
}

pub struct KernelDriver {
    connection_info: Option<ConnectionInfo>,
    connection_file: Option<PathBuf>,
    session_id: String,
    iopub_task: Option<tokio::task::JoinHandle<()>>,
    shell_reader_task: Option<tokio::task::JoinHandle<()>>,
    shell_writer: Option<runtimelib::DealerSendConnection>,
    _process: Option<tokio::process::Child>,
}

impl Default for KernelDriver {
    fn default() -> Self {
        KernelDriver {
            connection_info: None,
            connection_file: None,
            session_id: Uuid::new_v4().to_string(),
            iopub_task: None,
            shell_reader_task: None,
            shell_writer: None,
            _process: None,
        }
    }
}

impl KernelDriver {
    /// Start a kernel from the named kernelspec.
    ///
    /// Decoded iopub events are sent to `event_tx` until the connection
    /// drops; a final [`EventPayload::Disconnected`] event marks the end of
    /// the stream.
    pub async fn start(
        &mut self,
        kernelspec_name: &str,
        event_tx: mpsc::Sender<KernelEvent>,
    ) -> Result<()> {
        // Shutdown existing kernel if any
        self.shutdown().await.ok();

        let kernelspec = runtimelib::find_kernelspec(kernelspec_name).await?;

        // Reserve ports
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(kernelspec_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file_path = runtime_dir.join(format!("termbook-kernel-{}.json", kernel_id));

        tokio::fs::write(
            &connection_file_path,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        info!(
            "Starting kernel {} at {:?}",
            kernelspec_name, connection_file_path
        );

        let process = kernelspec
            .command(&connection_file_path, Some(Stdio::null()), Some(Stdio::null()))?
            .kill_on_drop(true)
            .spawn()?;

        // Small delay to let the kernel bind its sockets
        tokio::time::sleep(Duration::from_millis(500)).await;

        self.session_id = Uuid::new_v4().to_string();

        // Create iopub connection and spawn the listener that feeds events
        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &self.session_id)
                .await?;

        let iopub_tx = event_tx.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        debug!(
                            "iopub: type={} parent_msg_id={:?}",
                            message.header.msg_type,
                            message.parent_header.as_ref().map(|h| &h.msg_id)
                        );
                        if let Some(event) = decode_iopub(&message) {
                            if iopub_tx.send(event).await.is_err() {
                                // Consumer went away; stop reading.
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("iopub read error: {}", e);
                        let _ = iopub_tx.send(KernelEvent::disconnected()).await;
                        break;
                    }
                }
            }
        });

        // Create persistent shell connection
        let identity = runtimelib::peer_identity_for_session(&self.session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &self.session_id,
            identity,
        )
        .await?;

        // Verify the kernel is alive with a kernel_info handshake
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;

        let reply = tokio::time::timeout(Duration::from_secs(30), shell.read()).await;
        match reply {
            Ok(Ok(msg)) => {
                info!("Kernel alive: got {} reply", msg.header.msg_type);
            }
            Ok(Err(e)) => {
                error!("Error reading kernel_info_reply: {}", e);
                return Err(anyhow!("Kernel did not respond: {}", e));
            }
            Err(_) => {
                error!("Timeout waiting for kernel_info_reply");
                return Err(anyhow!("Kernel did not respond within 30s"));
            }
        }

        // Split shell into persistent writer + reader. Replies are drained
        // here; completion is signalled by the idle status on iopub, not by
        // execute_reply (kernels may reply before output finishes).
        let (shell_writer, mut shell_reader) = shell.split();

        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => {
                        debug!("shell reply: type={}", msg.header.msg_type);
                    }
                    Err(e) => {
                        error!("shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        self.connection_info = Some(connection_info);
        self.connection_file = Some(connection_file_path);
        self.iopub_task = Some(iopub_task);
        self.shell_reader_task = Some(shell_reader_task);
        self.shell_writer = Some(shell_writer);
        self._process = Some(process);

        info!("Kernel started: {}", kernel_id);
        Ok(())
    }

    /// Submit code on the shell channel and return the message id, which is
    /// the correlation token subsequent iopub events carry.
    ///
    /// `register` runs with the message id BEFORE the request is sent, so
    /// the consumer can record its routing entry without racing the first
    /// iopub event.
    pub async fn execute(
        &mut self,
        code: &str,
        register: impl FnOnce(String),
    ) -> Result<String> {
        let shell = self
            .shell_writer
            .as_mut()
            .ok_or_else(|| anyhow!("No kernel running"))?;

        let request = ExecuteRequest::new(code.to_string());
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();

        register(msg_id.clone());

        shell.send(message).await?;
        debug!("Sent execute_request: msg_id={}", msg_id);

        Ok(msg_id)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
        if let Some(task) = self.shell_reader_task.take() {
            task.abort();
        }
        self.shell_writer = None;

        if let Some(connection_info) = &self.connection_info {
            let mut control =
                runtimelib::create_client_control_connection(connection_info, &self.session_id)
                    .await?;
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            control.send(request).await.ok();
        }

        if let Some(ref path) = self.connection_file {
            tokio::fs::remove_file(path).await.ok();
        }

        self.connection_info = None;
        self.connection_file = None;
        self._process = None;

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shell_writer.is_some()
    }
}
