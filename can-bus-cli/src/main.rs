//! CAN Bus Simulator CLI Application
//!
//! Command-line front end for the can-bus-sim library. It adds:
//! - Argument parsing and the optional config.toml
//! - Logging initialisation
//! - Opening a SocketCAN or virtual bus
//! - Ctrl-C handling
//! - Console output (catalog listing, decoded and transmitted frames)

use anyhow::{Context, Result};
use can_bus_sim::{
    shutdown, BusSession, Catalog, CatalogBuilder, CyclicScheduler, DecodeLoop, DecodeStats,
    EventSink, JsonLinesSink, MissedDeadlinePolicy, SchedulerStats, SimulatorConfig, VirtualBus,
    VIRTUAL_INTERFACE,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod report;

use config::{AppConfig, OutputFormat};
use report::ConsoleSink;

/// CAN Bus Simulator - Decode and generate CAN traffic from DBC files
#[derive(Parser, Debug)]
#[command(name = "can-bus")]
#[command(about = "Decode and generate CAN traffic described by DBC files", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every message and signal of the DBC file(s)
    Show {
        /// DBC file(s); defaults to [catalog] dbc_files
        #[arg(value_name = "DBC")]
        dbc: Vec<PathBuf>,
    },

    /// Decode frames received on a CAN interface
    Decode(BusArgs),

    /// Send generated values for every periodic message
    Generate {
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        generator: GeneratorArgs,
    },

    /// Generate and decode at the same time on one interface
    Simulate {
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        generator: GeneratorArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct BusArgs {
    /// DBC file; defaults to [catalog] dbc_files
    #[arg(value_name = "DBC")]
    dbc: Option<PathBuf>,

    /// SocketCAN interface (e.g. can0, vcan0) or "virtual"
    #[arg(value_name = "INTERFACE")]
    interface: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct GeneratorArgs {
    /// Largest change of a generated value per cycle (physical units)
    #[arg(long, value_name = "VALUE")]
    max_step: Option<f64>,

    /// Seed for reproducible generated values
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Period for messages without a cycle time in the DBC
    #[arg(long, value_name = "MS")]
    default_cycle_time: Option<u64>,

    /// Send missed cycles back-to-back instead of realigning
    #[arg(long)]
    catch_up: bool,
}

impl GeneratorArgs {
    fn apply(&self, mut config: SimulatorConfig) -> SimulatorConfig {
        if let Some(max_step) = self.max_step {
            config = config.with_max_step(max_step);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if let Some(ms) = self.default_cycle_time {
            config = config.with_default_cycle_time(ms);
        }
        if self.catch_up {
            config = config.with_missed_deadline_policy(MissedDeadlinePolicy::CatchUp);
        }
        config
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Bus Simulator CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using simulator library v{}", can_bus_sim::VERSION);

    let app_config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Command::Show { dbc } = &args.command {
        let files = if dbc.is_empty() {
            app_config.catalog.dbc_files.clone()
        } else {
            dbc.clone()
        };
        let catalog = load_catalog(&files)?;
        report::write_catalog(&mut io::stdout().lock(), &catalog)?;
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(args.command, app_config))
}

async fn run(command: Command, app_config: AppConfig) -> Result<()> {
    let (stop, stop_rx) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Ctrl-C received, shutting down"),
            Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = stop.send(true);
    });

    match command {
        Command::Show { .. } => Ok(()),
        Command::Decode(bus_args) => {
            let (catalog, bus) = prepare(&bus_args, &app_config)?;
            if app_config.output.format == OutputFormat::Text {
                report::write_catalog(&mut io::stdout().lock(), &catalog)?;
            }

            let mut decoder = DecodeLoop::new(
                catalog,
                bus,
                make_sink(app_config.output.format),
                app_config.simulator.clone(),
            );
            let stats = decoder.run(stop_rx).await;
            print_summary(Some(&stats), None);
            Ok(())
        }
        Command::Generate { bus, generator } => {
            let (catalog, bus) = prepare(&bus, &app_config)?;
            let config = generator.apply(app_config.simulator.clone());

            let mut scheduler =
                CyclicScheduler::new(catalog, bus, make_sink(app_config.output.format), &config);
            if scheduler.scheduled_count() == 0 {
                log::warn!("No message has a cycle time; use --default-cycle-time to send all");
            }
            let stats = scheduler.run(stop_rx).await;
            print_summary(None, Some(&stats));
            Ok(())
        }
        Command::Simulate { bus, generator } => {
            let (catalog, bus) = prepare(&bus, &app_config)?;
            let config = generator.apply(app_config.simulator.clone());
            let format = app_config.output.format;

            let mut scheduler =
                CyclicScheduler::new(catalog.clone(), bus.clone(), make_sink(format), &config);
            let mut decoder = DecodeLoop::new(catalog, bus, make_sink(format), config);

            let (sent, received) =
                tokio::join!(scheduler.run(stop_rx.clone()), decoder.run(stop_rx));
            print_summary(Some(&received), Some(&sent));
            Ok(())
        }
    }
}

/// Load the catalog and open the bus selected by arguments or config
fn prepare(
    bus_args: &BusArgs,
    app_config: &AppConfig,
) -> Result<(Arc<Catalog>, Arc<dyn BusSession>)> {
    let files = match &bus_args.dbc {
        Some(path) => vec![path.clone()],
        None => app_config.catalog.dbc_files.clone(),
    };
    let catalog = Arc::new(load_catalog(&files)?);

    let interface = bus_args
        .interface
        .clone()
        .or_else(|| app_config.bus.interface.clone())
        .context("No CAN interface given (argument or [bus] interface)")?;
    let poll = Duration::from_millis(app_config.bus.rx_poll_interval_ms);
    let bus = open_bus(&interface, poll)?;

    Ok((catalog, bus))
}

fn load_catalog(files: &[PathBuf]) -> Result<Catalog> {
    if files.is_empty() {
        anyhow::bail!("No DBC file given (argument or [catalog] dbc_files)");
    }

    let mut builder = CatalogBuilder::new();
    for path in files {
        builder
            .add_dbc(path)
            .with_context(|| format!("Failed to load DBC file: {:?}", path))?;
    }
    let catalog = builder.build().context("Invalid message catalog")?;

    let stats = catalog.stats();
    log::info!(
        "Catalog: {} messages, {} signals, {} periodic",
        stats.num_messages,
        stats.num_signals,
        stats.num_periodic
    );
    Ok(catalog)
}

fn open_bus(interface: &str, rx_poll_interval: Duration) -> Result<Arc<dyn BusSession>> {
    if interface == VIRTUAL_INTERFACE {
        log::info!("Using in-process virtual bus");
        return Ok(Arc::new(VirtualBus::new()));
    }
    open_socketcan(interface, rx_poll_interval)
}

#[cfg(feature = "socketcan")]
fn open_socketcan(interface: &str, rx_poll_interval: Duration) -> Result<Arc<dyn BusSession>> {
    let session = can_bus_sim::SocketCanSession::open(interface, rx_poll_interval)
        .with_context(|| format!("Failed to open CAN interface {}", interface))?;
    Ok(Arc::new(session))
}

#[cfg(not(feature = "socketcan"))]
fn open_socketcan(interface: &str, _rx_poll_interval: Duration) -> Result<Arc<dyn BusSession>> {
    anyhow::bail!(
        "Interface {} requires the socketcan feature; use \"{}\"",
        interface,
        VIRTUAL_INTERFACE
    )
}

fn make_sink(format: OutputFormat) -> Box<dyn EventSink> {
    match format {
        OutputFormat::Text => Box::new(ConsoleSink::new(io::stdout())),
        OutputFormat::Json => Box::new(JsonLinesSink::new(io::stdout())),
    }
}

fn print_summary(decode: Option<&DecodeStats>, schedule: Option<&SchedulerStats>) {
    eprintln!("═══════════════════════════════════════════════");
    if let Some(stats) = decode {
        eprintln!("  Frames received:   {}", stats.frames_received);
        eprintln!("  Messages decoded:  {}", stats.messages_decoded);
        eprintln!("  Unknown frames:    {}", stats.unknown_frames);
        eprintln!("  Dropped frames:    {}", stats.dropped_frames);
        eprintln!("  Receive errors:    {}", stats.transport_errors);
    }
    if let Some(stats) = schedule {
        eprintln!("  Frames sent:       {}", stats.frames_sent);
        eprintln!("  Send failures:     {}", stats.send_failures);
        eprintln!("  Encode failures:   {}", stats.encode_failures);
        eprintln!("  Missed deadlines:  {}", stats.missed_deadlines);
    }
    eprintln!("═══════════════════════════════════════════════");
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_generate_arguments() {
        let args = Args::parse_from([
            "can-bus",
            "-v",
            "generate",
            "car.dbc",
            "vcan0",
            "--max-step",
            "2.5",
            "--seed",
            "7",
            "--catch-up",
        ]);
        assert_eq!(args.verbose, 1);

        match args.command {
            Command::Generate { bus, generator } => {
                assert_eq!(bus.dbc, Some(PathBuf::from("car.dbc")));
                assert_eq!(bus.interface.as_deref(), Some("vcan0"));

                let config = generator.apply(SimulatorConfig::default());
                assert_eq!(config.max_step, 2.5);
                assert_eq!(config.seed, Some(7));
                assert_eq!(config.default_cycle_time_ms, None);
                assert_eq!(config.missed_deadline_policy, MissedDeadlinePolicy::CatchUp);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_show_accepts_several_files() {
        let args = Args::parse_from(["can-bus", "show", "a.dbc", "b.dbc"]);
        match args.command {
            Command::Show { dbc } => assert_eq!(dbc.len(), 2),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_load_catalog_requires_files() {
        assert!(load_catalog(&[]).is_err());
    }

    #[test]
    fn test_virtual_bus_is_always_available() {
        let bus = open_bus(VIRTUAL_INTERFACE, Duration::from_millis(5)).unwrap();
        assert_eq!(bus.name(), VIRTUAL_INTERFACE);
    }
}
