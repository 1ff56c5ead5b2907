//! Binary entrypoint for the buslogger CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the logger daemon
//! - `init` - create a starter `config.toml`
//! - `status` - print persisted settings and the stored request list
//! - `probe --frame <hex> [--port <path>] [-b <baud>]` - send one frame and
//!   print the decoded reply
//!
//! See the library crate docs for module-level details: `buslogger::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use buslogger::bus::{decode_reply, BusPort, Frame, SerialBus};
use buslogger::config::Config;
use buslogger::logger::LoggerServer;
use buslogger::persist::Settings;

#[derive(Parser)]
#[command(name = "buslogger")]
#[command(about = "Remote RS-485 environmental data logger with an MQTT uplink")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the logger daemon
    Start {
        /// Serial port of the RS-485 transceiver (overrides the config file)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Initialize a new configuration file
    Init,
    /// Show persisted settings and the stored polling queue
    Status,
    /// Send a single frame on the bus and print the decoded reply
    Probe {
        /// Request frame as 16 hex digits, e.g. 01030000000305CB
        #[arg(short, long)]
        frame: String,
        /// Serial port (overrides the config file)
        #[arg(short, long)]
        port: Option<String>,
        /// Baud rate (overrides the persisted setting)
        #[arg(short = 'b', long)]
        baud: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early to configure logging (except for Init which writes it)
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    if !matches!(cli.command, Commands::Init) {
        init_logging(&pre_config, cli.verbose);
    }

    match cli.command {
        Commands::Start { port } => {
            info!("Starting buslogger v{}", env!("CARGO_PKG_VERSION"));
            let mut config = Config::load(&cli.config).await?;
            if let Some(port) = port {
                config.bus.port = port;
            }
            let server = LoggerServer::new(config).await?;
            server.run().await?;
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Created {}", cli.config);
            println!("Edit the broker credentials and bus port, then run: buslogger start");
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            let data_dir = std::path::Path::new(&config.storage.data_dir);
            let settings = Settings::open(data_dir.join("settings"))?;

            println!("zone:          {}", config.mqtt.zone);
            println!("bus port:      {}", config.bus.port);
            println!("baud rate:     {}", settings.baud_rate()?);
            println!(
                "poll period:   {} s",
                settings.poll_period_us()? as f64 / 1_000_000.0
            );
            println!("csv output:    {}", settings.csv_output()?);
            println!("reading log:   {}", settings.storage_enabled()?);
            println!(
                "timezone:      gmt {} s, dst {} s",
                settings.gmt_offset_secs()?,
                settings.dst_offset_secs()?
            );
            let requests = settings.load_requests()?;
            println!("repeated requests: {}", requests.len());
            for (i, frame) in requests.iter().enumerate() {
                println!("  msg{}: {}", i + 1, frame);
            }
        }
        Commands::Probe { frame, port, baud } => {
            let frame = Frame::from_hex(&frame)
                .ok_or_else(|| anyhow::anyhow!("frame must be 16 hex digits"))?;
            let config = Config::load(&cli.config).await?;
            let port_path = port.unwrap_or(config.bus.port);
            let baud = match baud {
                Some(b) => b,
                None => {
                    let data_dir = std::path::Path::new(&config.storage.data_dir);
                    Settings::open(data_dir.join("settings"))?.baud_rate()?
                }
            };

            let mut bus = SerialBus::open(&port_path, baud)?;
            info!("probing {} with {}", port_path, frame);
            bus.transmit(&frame)?;
            tokio::time::sleep(std::time::Duration::from_millis(config.bus.turnaround_ms)).await;
            let mut reply = Vec::new();
            bus.drain(&mut reply)?;
            match decode_reply(&reply) {
                Some(reading) => {
                    println!("addr {}: {}", reading.addr, reading.render());
                }
                None if reply.is_empty() => println!("no reply"),
                None => println!("undecodable reply: {} byte(s)", reply.len()),
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|c| c.logging.level.parse().unwrap_or(log::LevelFilter::Info))
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    if let Some(file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When stdout is a terminal, echo log lines to the console as well.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
