use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use virtual_sensor_lib::config::{GoalConfig, RunConfig};
use virtual_sensor_lib::serial::{discover_ports, ServerBuilder};
use virtual_sensor_lib::simulation::{ReplaySource, Simulation, SimulationHandle, SimulationReport, ZeroSource};

#[derive(Debug, Parser)]
#[command(author, version, about = "Answer sensor requests from a device under test", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List serial ports the OS currently exposes
    ListPorts,
    /// Serve a simulation to the device on a serial port
    Run(RunArgs),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// JSON run configuration; command line flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial port the device is attached to
    #[arg(long, env = "VSENSOR_PORT")]
    port: Option<String>,

    #[arg(long)]
    baud_rate: Option<u32>,

    /// Sensor the device should treat as simulated (repeatable)
    #[arg(long = "sensor", value_name = "NAME")]
    sensors: Vec<String>,

    /// Goal as NAME=TIME, using --goal-margin (repeatable)
    #[arg(long = "goal", value_name = "NAME=TIME", value_parser = parse_goal)]
    goals: Vec<(String, f64)>,

    /// OpenRocket CSV export to replay
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Replay event that becomes a goal (repeatable)
    #[arg(long = "replay-goal", value_name = "EVENT")]
    replay_goals: Vec<String>,

    #[arg(long)]
    goal_margin: Option<f64>,

    /// Simulated seconds per wall-clock second
    #[arg(long)]
    time_scalar: Option<f64>,

    /// Simulated seconds to run for; runs until Ctrl-C when omitted
    #[arg(long)]
    run_for: Option<f64>,

    #[arg(long)]
    name: Option<String>,

    /// Echo protocol traffic at info level
    #[arg(long)]
    debug: bool,

    /// Hide device output that is not part of the protocol
    #[arg(long)]
    no_serial_monitor: bool,

    /// Wait for the device to reset after the port opens
    #[arg(long, default_value_t = 2000)]
    startup_delay_ms: u64,

    /// Write a JSON report of the run here
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

fn parse_goal(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, time) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=TIME, got '{}'", s))?;
    let time = time
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("invalid goal time '{}'", time))?;
    Ok((name.trim().to_string(), time))
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::ListPorts => list_ports(),
        Commands::Run(args) => run(args).await,
    }
}

fn list_ports() -> Result<()> {
    let ports = discover_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  {:04x}:{:04x}  {} {}",
                port.port_name,
                vid,
                pid,
                port.manufacturer.unwrap_or_default(),
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_path(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => RunConfig::default(),
    };

    let server = &mut config.server;
    if let Some(port) = &args.port {
        server.port = port.clone();
    }
    if let Some(baud_rate) = args.baud_rate {
        server.baud_rate = baud_rate;
    }
    server.sensors_under_test.extend(args.sensors.iter().cloned());
    server.debug |= args.debug;
    if args.no_serial_monitor {
        server.serial_monitor = false;
    }

    let simulation = &mut config.simulation;
    if let Some(name) = &args.name {
        simulation.name = name.clone();
    }
    if let Some(scalar) = args.time_scalar {
        simulation.time_scalar = scalar;
    }
    if let Some(margin) = args.goal_margin {
        simulation.goal_margin = margin;
    }
    if let Some(replay) = &args.replay {
        simulation.replay = Some(replay.clone());
    }
    simulation.replay_goals.extend(args.replay_goals.iter().cloned());
    simulation.goals.extend(args.goals.iter().map(|(name, time)| GoalConfig {
        name: name.clone(),
        time: *time,
        margin: None,
    }));
    if let Some(run_for) = args.run_for {
        simulation.run_for = Some(run_for);
    }

    if config.server.port.is_empty() {
        bail!("no serial port given; pass --port or set server.port in the configuration");
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build_simulation(config: &RunConfig) -> Result<Simulation> {
    let sim_config = &config.simulation;
    let mut simulation = match &sim_config.replay {
        Some(path) => ReplaySource::from_path(path)
            .with_context(|| format!("failed to load replay {}", path.display()))?
            .into_simulation(&sim_config.name, &sim_config.replay_goals, sim_config.goal_margin)?,
        None => Simulation::new(&sim_config.name, ZeroSource),
    }
    .with_time_scalar(sim_config.time_scalar)?;

    for goal in sim_config.goals()? {
        simulation.add_goal(goal);
    }
    Ok(simulation)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let handle = SimulationHandle::new(build_simulation(&config)?);

    let mut server = ServerBuilder::new(config.server.clone(), handle.clone())
        .build()
        .with_context(|| format!("failed to open {}", config.server.port))?;
    server.start()?;

    if args.startup_delay_ms > 0 {
        log::info!("Waiting {} ms for the device to reset", args.startup_delay_ms);
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    match config.simulation.run_duration() {
        Some(duration) => {
            tokio::select! {
                result = handle.run_for(duration) => result?,
                _ = server.reader_exited() => log::error!("Device link closed before the run completed"),
                _ = tokio::signal::ctrl_c() => log::warn!("Interrupted before the run completed"),
            }
        }
        None => {
            handle.start().await?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
                _ = server.reader_exited() => log::error!("Device link closed"),
            }
        }
    }
    {
        let mut simulation = handle.lock().await;
        if simulation.is_running() {
            simulation.finish()?;
        }
    }

    let stopped = server.stop().await;

    let report = handle.report().await;
    print_summary(&report);
    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }

    let metrics = stopped.with_context(|| format!("device link on {} failed", config.server.port))?;
    log::debug!("Dispatch metrics: {:?}", metrics);

    if !report.all_goals_met() {
        let unmet = report.goals.iter().filter(|g| !g.met).count();
        bail!("{} of {} goals not met", unmet, report.goals.len());
    }
    Ok(())
}

fn print_summary(report: &SimulationReport) {
    println!("{} ({:.3}s simulated)", report.name, report.elapsed);
    for goal in &report.goals {
        let state = match (goal.met, goal.missed, goal.met_at) {
            (true, _, Some(at)) => format!("met at {:.3}s", at),
            (_, true, _) => "missed".to_string(),
            _ => "never reported".to_string(),
        };
        println!(
            "  {:<20} {:>8.3}s ±{:<6.3} {}",
            goal.name, goal.target_time, goal.time_margin, state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_goal_arguments() {
        assert_eq!(parse_goal("APOGEE=5.1").unwrap(), ("APOGEE".to_string(), 5.1));
        assert!(parse_goal("APOGEE").is_err());
        assert!(parse_goal("APOGEE=soon").is_err());
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "virtual-sensor",
            "run",
            "--port",
            "/dev/ttyACM0",
            "--sensor",
            "BME280",
            "--goal",
            "APOGEE=5",
            "--time-scalar",
            "4",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.server.sensors_under_test, ["BME280"]);
        assert_eq!(config.simulation.time_scalar, 4.0);
        assert_eq!(config.simulation.goals[0].name, "APOGEE");
    }
}
