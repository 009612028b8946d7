//! Reader task: assembles lines from the transport, routes commands to the
//! simulation and writes replies back.
use tokio::sync::watch;

use super::types::{DispatchMetrics, ReaderSettings};
use crate::config::ServerConfig;
use crate::serial::protocol::{Command, Frame, ProtocolConfig, ProtocolError, Reply};
use crate::serial::{SerialError, SerialInterface};
use crate::simulation::SimulationHandle;

/// Routes decoded lines. Knows nothing about the transport, so it can be
/// driven directly in tests.
pub struct Dispatcher {
    protocol: ProtocolConfig,
    sensors_under_test: Vec<String>,
    debug: bool,
    serial_monitor: bool,
    simulation: SimulationHandle,
    metrics: DispatchMetrics,
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, simulation: SimulationHandle) -> Self {
        Self {
            protocol: config.protocol.clone(),
            sensors_under_test: config.sensors_under_test.clone(),
            debug: config.debug,
            serial_monitor: config.serial_monitor,
            simulation,
            metrics: DispatchMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn is_under_test(&self, sensor_name: &str) -> bool {
        self.sensors_under_test.iter().any(|s| s == sensor_name)
    }

    /// Handle one received line and return the reply to send, if any.
    ///
    /// Malformed and unknown commands are logged and dropped.
    pub async fn handle_line(&mut self, raw: &str) -> Option<Reply> {
        let frame = match self.protocol.decode_line(raw) {
            Ok(frame) => frame,
            Err(err) => {
                self.metrics.lines_read += 1;
                self.metrics.ignored_lines += 1;
                match err {
                    ProtocolError::UnknownCommand(_) => log::debug!("Ignoring {:?}: {}", raw.trim(), err),
                    _ => log::warn!("Ignoring malformed command {:?}: {}", raw.trim(), err),
                }
                return None;
            }
        };

        match frame {
            Frame::Blank => None,
            Frame::Passthrough(text) => {
                self.metrics.lines_read += 1;
                self.metrics.passthrough_lines += 1;
                if self.serial_monitor {
                    log::info!(target: "device", "{}", text);
                }
                None
            }
            Frame::Command(command) => {
                self.metrics.lines_read += 1;
                self.trace("<-", raw.trim());
                let reply = self.dispatch(command).await;
                if let Some(reply) = &reply {
                    self.trace("->", &reply.to_string());
                }
                reply
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Option<Reply> {
        match command {
            Command::IsTest { sensor_name } => {
                self.metrics.istest_commands += 1;
                Some(Reply::Flag(self.is_under_test(&sensor_name)))
            }
            Command::Request(request) => {
                self.metrics.value_requests += 1;
                let value = self.simulation.lock().await.get_value(&request);
                log::debug!("{} = {}", request, value);
                if value.is_finite() {
                    Some(Reply::Value(value))
                } else {
                    log::warn!("{} produced {}, replying 0", request, value);
                    Some(Reply::Value(0.0))
                }
            }
            Command::Event { name } => {
                self.metrics.events_reported += 1;
                let mut simulation = self.simulation.lock().await;
                let event = simulation.event_now(name);
                simulation.process_event(&event);
                None
            }
            Command::Log { text } => {
                self.metrics.device_logs += 1;
                log::info!(target: "device", "{}", text);
                None
            }
        }
    }

    fn trace(&self, direction: &str, line: &str) {
        if self.debug {
            log::info!("{} {}", direction, line);
        } else {
            log::debug!("{} {}", direction, line);
        }
    }

    fn decode_bytes(&mut self, bytes: &[u8]) -> String {
        match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                self.metrics.utf8_decode_errors += 1;
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
    }
}

/// Owns the transport until it returns; the transport is closed on every path.
pub(crate) async fn reader_task(
    mut interface: SerialInterface,
    mut dispatcher: Dispatcher,
    settings: ReaderSettings,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics_tx: watch::Sender<DispatchMetrics>,
) -> Result<DispatchMetrics, SerialError> {
    let result = read_loop(&mut interface, &mut dispatcher, settings, &mut shutdown_rx, &metrics_tx).await;
    interface.close();

    let mut metrics = dispatcher.metrics().clone();
    if let Err(e) = &result {
        metrics.last_error = Some(e.to_string());
    }
    metrics_tx.send_replace(metrics.clone());
    result.map(|_| metrics)
}

async fn read_loop(
    interface: &mut SerialInterface,
    dispatcher: &mut Dispatcher,
    settings: ReaderSettings,
    shutdown_rx: &mut watch::Receiver<bool>,
    metrics_tx: &watch::Sender<DispatchMetrics>,
) -> Result<(), SerialError> {
    let mut partial: Vec<u8> = Vec::with_capacity(settings.read_chunk);
    let mut buf = vec![0u8; settings.read_chunk];

    loop {
        if *shutdown_rx.borrow() {
            log::debug!("Reader on {} stopping", interface.port_name());
            return Ok(());
        }

        let read = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    log::debug!("Server handle dropped; reader on {} stopping", interface.port_name());
                    return Ok(());
                }
                continue;
            }
            read = interface.read_data(&mut buf, settings.poll_interval_ms) => read,
        };

        match read {
            Ok(n) => {
                partial.extend_from_slice(&buf[..n]);
                drain_lines(&mut partial, interface, dispatcher).await?;
                if partial.len() > settings.max_partial_line {
                    let excess = partial.len() - settings.max_partial_line / 2;
                    partial.drain(..excess);
                    dispatcher.metrics.partial_buffer_trims += 1;
                    log::warn!("Dropped {} bytes of unterminated input", excess);
                }
                metrics_tx.send_replace(dispatcher.metrics().clone());
            }
            Err(SerialError::Timeout) => {}
            Err(e) => {
                log::error!("Transport failure on {}: {}", interface.port_name(), e);
                return Err(e);
            }
        }
    }
}

async fn drain_lines(
    partial: &mut Vec<u8>,
    interface: &mut SerialInterface,
    dispatcher: &mut Dispatcher,
) -> Result<(), SerialError> {
    while let Some(pos) = partial.iter().position(|b| *b == b'\n' || *b == b'\r') {
        let line_bytes: Vec<u8> = partial.drain(..=pos).collect();
        let line = dispatcher.decode_bytes(&line_bytes[..pos]);
        if let Some(reply) = dispatcher.handle_line(&line).await {
            interface.send_data(reply.encode().as_bytes()).await?;
            dispatcher.metrics.replies_sent += 1;
        }
    }
    Ok(())
}
