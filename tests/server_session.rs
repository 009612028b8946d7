use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

use virtual_sensor_lib::config::ServerConfig;
use virtual_sensor_lib::serial::protocol::ProtocolConfig;
use virtual_sensor_lib::serial::{SerialInterface, ServerBuilder, ServerError, StreamIO, VirtualSensorServer};
use virtual_sensor_lib::simulation::{
    Goal, ManualTimeSource, SensorRequest, Simulation, SimulationEvent, SimulationHandle,
};

const REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// The firmware end of the link.
struct Device {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Device {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn reply(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(REPLY_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("no reply from server")
            .unwrap();
        assert!(n > 0, "server closed the link");
        line
    }

    async fn ask(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }
}

fn session_with(config: ServerConfig, simulation: Simulation) -> (VirtualSensorServer, SimulationHandle, Device) {
    let (host, device) = tokio::io::duplex(1024);
    let interface = SerialInterface::from_io("duplex", Box::new(StreamIO::new(host)));
    let handle = SimulationHandle::new(simulation);
    let mut server = ServerBuilder::new(config, handle.clone())
        .with_interface(interface)
        .build()
        .unwrap();
    server.start().unwrap();

    let (reader, writer) = tokio::io::split(device);
    let device = Device {
        reader: BufReader::new(reader),
        writer,
    };
    (server, handle, device)
}

fn session(simulation: Simulation) -> (VirtualSensorServer, SimulationHandle, Device) {
    session_with(ServerConfig::new("duplex", vec!["BME280".to_string()]), simulation)
}

fn elapsed_echo(scalar: f64) -> (Simulation, ManualTimeSource) {
    let time = ManualTimeSource::new(1000.0);
    let simulation = Simulation::new("session", |_: &SensorRequest, elapsed: f64| elapsed)
        .with_time_source(Arc::new(time.clone()))
        .with_time_scalar(scalar)
        .unwrap();
    (simulation, time)
}

#[tokio::test]
async fn istest_answers_from_allow_list() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, mut device) = session(sim);

    assert_eq!(device.ask("@VS:ISTEST:BME280\n").await, "true\n");
    assert_eq!(device.ask("@VS:ISTEST:MPU6050\n").await, "false\n");

    let metrics = server.stop().await.unwrap();
    assert_eq!(metrics.istest_commands, 2);
    assert_eq!(metrics.replies_sent, 2);
}

#[tokio::test]
async fn request_returns_simulated_value_and_records_it() {
    let (sim, time) = elapsed_echo(1.0);
    let (mut server, handle, mut device) = session(sim);
    handle.start().await.unwrap();
    time.advance(2.5);

    assert_eq!(device.ask("@VS:REQ:BME280:temperature\n").await, "2.5\n");

    let simulation = handle.lock().await;
    let samples = &simulation.history()["temperature"];
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 2.5);
    drop(simulation);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn request_before_start_is_answered_but_not_recorded() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, handle, mut device) = session(sim);

    assert_eq!(device.ask("@VS:REQ:BME280:pressure\n").await, "0\n");
    assert!(handle.lock().await.history().is_empty());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn event_inside_window_meets_goal() {
    let (mut sim, time) = elapsed_echo(10.0);
    sim.add_goal(Goal::new(SimulationEvent::new("APOGEE", 5.0), 0.5).unwrap());
    let (mut server, handle, mut device) = session(sim);
    handle.start().await.unwrap();
    time.advance(0.51);

    device.send("@VS:EVENT:APOGEE\n").await;
    // Commands are handled in order, so this reply means the event was processed.
    assert_eq!(device.ask("@VS:ISTEST:BME280\n").await, "true\n");

    let report = handle.report().await;
    assert!(report.goals[0].met);
    assert!((report.goals[0].met_at.unwrap() - 5.1).abs() < 1e-6);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn late_event_misses_goal() {
    let (mut sim, time) = elapsed_echo(10.0);
    sim.add_goal(Goal::new(SimulationEvent::new("APOGEE", 5.0), 0.5).unwrap());
    let (mut server, handle, mut device) = session(sim);
    handle.start().await.unwrap();
    time.advance(0.6);

    device.send("@VS:EVENT:APOGEE\n").await;
    device.ask("@VS:ISTEST:BME280\n").await;

    let report = handle.report().await;
    assert!(report.goals[0].missed);
    assert!(!report.goals[0].met);
    assert!(!report.all_goals_met());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_commands_and_device_output_get_no_reply() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, mut device) = session(sim);

    device.send("Booting flight computer\n@VS:FOO:bar\n@VS:LOG:setup done\n").await;
    assert_eq!(device.ask("@VS:ISTEST:BME280\n").await, "true\n");

    let metrics = server.stop().await.unwrap();
    assert_eq!(metrics.passthrough_lines, 1);
    assert_eq!(metrics.ignored_lines, 1);
    assert_eq!(metrics.device_logs, 1);
    assert_eq!(metrics.replies_sent, 1);
}

#[tokio::test]
async fn lines_split_across_reads_are_reassembled() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, mut device) = session(sim);

    device.send("@VS:IST").await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    device.send("EST:BME280\r\n").await;
    assert_eq!(device.reply().await, "true\n");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn custom_framing_is_honoured() {
    let mut config = ServerConfig::new("duplex", vec!["BME280".to_string()]);
    config.protocol = ProtocolConfig::new("#SIM#", ",");
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, mut device) = session_with(config, sim);

    assert_eq!(device.ask("#SIM#ISTEST,BME280\n").await, "true\n");
    device.send("@VS:ISTEST:BME280\n").await;
    assert_eq!(device.ask("#SIM#ISTEST,OTHER\n").await, "false\n");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_prompt_and_releases_transport() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, mut device) = session(sim);

    timeout(Duration::from_millis(500), server.stop())
        .await
        .expect("stop did not return in time")
        .unwrap();

    let mut rest = String::new();
    let n = timeout(REPLY_TIMEOUT, device.reader.read_line(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "transport should be closed after stop");
    assert!(matches!(server.start(), Err(ServerError::TransportReleased)));
}

#[tokio::test]
async fn reader_exited_stays_pending_while_link_is_up() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, _device) = session(sim);
    assert!(timeout(Duration::from_millis(100), server.reader_exited()).await.is_err());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn empty_istest_name_is_answered() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, mut device) = session(sim);
    assert_eq!(device.ask("@VS:ISTEST:\n").await, "false\n");
    assert_eq!(device.ask("@VS:ISTEST: BME280\n").await, "false\n");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn device_hangup_ends_the_reader() {
    let (sim, _) = elapsed_echo(1.0);
    let (mut server, _, device) = session(sim);
    drop(device);

    timeout(REPLY_TIMEOUT, server.reader_exited())
        .await
        .expect("reader kept running after hangup");
    assert!(server.reader_finished());

    assert!(server.metrics().last_error.is_some());
    assert!(matches!(server.stop().await, Err(ServerError::Serial(_))));
}
