pub mod reader;
pub mod types;

pub use reader::Dispatcher;
pub use types::{DispatchMetrics, ReaderSettings, Result, ServerError, ServerState};

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::serial::{SerialError, SerialInterface};
use crate::simulation::SimulationHandle;

pub struct ServerBuilder {
    config: ServerConfig,
    simulation: SimulationHandle,
    interface: Option<SerialInterface>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig, simulation: SimulationHandle) -> Self {
        Self {
            config,
            simulation,
            interface: None,
        }
    }

    /// Use an already-open transport instead of opening `config.port`.
    pub fn with_interface(mut self, interface: SerialInterface) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn build(self) -> Result<VirtualSensorServer> {
        self.config
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;

        let interface = match self.interface {
            Some(interface) => interface,
            None => SerialInterface::open(&self.config.port, self.config.baud_rate)?,
        };
        let settings = ReaderSettings {
            poll_interval_ms: self.config.poll_interval_ms,
            read_chunk: self.config.read_chunk,
            max_partial_line: self.config.max_partial_line,
        };
        let dispatcher = Dispatcher::new(&self.config, self.simulation.clone());
        let (metrics_tx, metrics_rx) = watch::channel(DispatchMetrics::default());

        Ok(VirtualSensorServer {
            state: ServerState::Idle,
            parked: Some(Parked {
                interface,
                dispatcher,
                metrics_tx,
            }),
            settings,
            simulation: self.simulation,
            metrics_rx,
            shutdown_tx: None,
            task: None,
        })
    }
}

struct Parked {
    interface: SerialInterface,
    dispatcher: Dispatcher,
    metrics_tx: watch::Sender<DispatchMetrics>,
}

/// Answers a device's requests over one transport.
///
/// `start` hands the transport to a background reader; `stop` waits for it
/// to finish its current line and release the transport. A stopped server
/// cannot be restarted.
pub struct VirtualSensorServer {
    state: ServerState,
    parked: Option<Parked>,
    settings: ReaderSettings,
    simulation: SimulationHandle,
    metrics_rx: watch::Receiver<DispatchMetrics>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<std::result::Result<DispatchMetrics, SerialError>>>,
}

impl VirtualSensorServer {
    pub fn builder(config: ServerConfig, simulation: SimulationHandle) -> ServerBuilder {
        ServerBuilder::new(config, simulation)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn simulation(&self) -> &SimulationHandle {
        &self.simulation
    }

    pub fn metrics(&self) -> DispatchMetrics {
        self.metrics_rx.borrow().clone()
    }

    /// True once the reader has exited on its own, e.g. after the device hung up.
    pub fn reader_finished(&self) -> bool {
        self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(false)
    }

    /// Resolves once the reader has exited while the server was running,
    /// e.g. because the device hung up. Pending forever otherwise.
    pub async fn reader_exited(&self) {
        if self.task.is_none() {
            return std::future::pending().await;
        }
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        while !self.reader_finished() {
            tokio::time::sleep(interval).await;
        }
    }

    /// Spawn the reader. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            ServerState::Running => return Err(ServerError::AlreadyRunning),
            ServerState::Stopped => return Err(ServerError::TransportReleased),
            ServerState::Idle => {}
        }
        let parked = self.parked.take().ok_or(ServerError::TransportReleased)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        log::info!("Virtual sensor server listening on {}", parked.interface.port_name());
        self.task = Some(tokio::spawn(reader::reader_task(
            parked.interface,
            parked.dispatcher,
            self.settings,
            shutdown_rx,
            parked.metrics_tx,
        )));
        self.shutdown_tx = Some(shutdown_tx);
        self.state = ServerState::Running;
        Ok(())
    }

    /// Signal the reader, wait for it to close the transport and return its
    /// final counters.
    pub async fn stop(&mut self) -> Result<DispatchMetrics> {
        if self.state != ServerState::Running {
            return Err(ServerError::NotRunning);
        }
        self.state = ServerState::Stopped;
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            // The reader may already have exited on a transport error.
            let _ = shutdown_tx.send(true);
        }
        let task = self.task.take().ok_or(ServerError::NotRunning)?;

        match task.await {
            Ok(Ok(metrics)) => {
                log::info!(
                    "Virtual sensor server stopped: {} lines, {} commands, {} replies",
                    metrics.lines_read,
                    metrics.commands_handled(),
                    metrics.replies_sent
                );
                Ok(metrics)
            }
            Ok(Err(e)) => Err(ServerError::Serial(e)),
            Err(e) => Err(ServerError::ReaderPanicked(e.to_string())),
        }
    }
}

impl Drop for VirtualSensorServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
    }
}
