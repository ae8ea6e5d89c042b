//! Binary entrypoint for the meshlink CLI.
//!
//! Commands:
//! - `init` - create a starter `config.toml`
//! - `add <name> (--host | --path | --vid/--pid | --peripheral)` - save a connection
//! - `list` - print saved connections
//! - `status` - reconcile, probe idle connections and print the table
//! - `connect <id> [--prompt] [--seconds <n>]` - connect and hold the link until Ctrl-C
//! - `set-default <id>` / `rename <id> <name>` / `remove <id>`
//!
//! `<id>` accepts a full record id, a unique id prefix or a connection name.
use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use meshlink::config::Config;
use meshlink::manager::{ConnectionManager, ManagerSettings};
use meshlink::registry::{ConnectionRecord, Endpoint, JsonRecordStore};
use meshlink::transport::{system_transports, OpenOptions};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Connection manager for Meshtastic radios over network, Bluetooth and serial")]
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
    /// Write a default configuration file
    Init,
    /// Save a new connection
    Add {
        /// Display name
        name: String,
        /// Host name or address of a device with the HTTP API
        #[arg(long, conflicts_with_all = ["path", "vid", "peripheral"])]
        host: Option<String>,
        /// Use HTTPS for the HTTP API
        #[arg(long, requires = "host")]
        tls: bool,
        /// Serial device path (e.g. /dev/ttyUSB0)
        #[arg(long, conflicts_with = "peripheral")]
        path: Option<String>,
        /// USB vendor id in hex, used to find the serial port when no path is given
        #[arg(long, value_parser = parse_hex_u16, requires = "pid")]
        vid: Option<u16>,
        /// USB product id in hex
        #[arg(long, value_parser = parse_hex_u16, requires = "vid")]
        pid: Option<u16>,
        /// Serial baud rate override
        #[arg(short = 'b', long)]
        baud: Option<u32>,
        /// Bluetooth peripheral id of a paired device
        #[arg(long)]
        peripheral: Option<String>,
        /// Advertised Bluetooth name to show instead of the id
        #[arg(long, requires = "peripheral")]
        label: Option<String>,
    },
    /// List saved connections
    List,
    /// Reconcile and probe saved connections, then print their status
    Status,
    /// Connect and keep the link open until Ctrl-C
    Connect {
        /// Record id, id prefix or name
        id: String,
        /// Allow device pickers and pairing prompts
        #[arg(long)]
        prompt: bool,
        /// Disconnect after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Mark a connection as the default
    SetDefault { id: String },
    /// Rename a connection
    Rename { id: String, name: String },
    /// Disconnect and delete a connection
    Remove { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early to configure logging (except for Init which writes it)
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    if let Commands::Init = cli.command {
        if std::path::Path::new(&cli.config).exists() {
            bail!("{} already exists", cli.config);
        }
        Config::create_default(&cli.config).await?;
        let config = Config::default();
        JsonRecordStore::open(&config.storage.registry_file)?.save()?;
        println!("Wrote {} and {}", cli.config, config.storage.registry_file);
        return Ok(());
    }

    let config = match pre_config {
        Some(config) => config,
        None => {
            if std::path::Path::new(&cli.config).exists() {
                // Surface the parse error instead of silently running on defaults
                Config::load(&cli.config).await?
            } else {
                warn!("No config at {}, using defaults", cli.config);
                Config::default()
            }
        }
    };
    let manager = build_manager(&config)?;

    match cli.command {
        Commands::Init => {} // handled above
        Commands::Add {
            name,
            host,
            tls,
            path,
            vid,
            pid,
            baud,
            peripheral,
            label,
        } => {
            let endpoint = if let Some(host) = host {
                Endpoint::Network { host, tls }
            } else if let Some(peripheral_id) = peripheral {
                Endpoint::Wireless {
                    peripheral_id,
                    name: label,
                }
            } else if path.is_some() || vid.is_some() {
                Endpoint::Serial {
                    path: path.unwrap_or_default(),
                    vendor_id: vid,
                    product_id: pid,
                    baud_rate: baud,
                }
            } else {
                bail!("one of --host, --path, --vid/--pid or --peripheral is required");
            };
            let record = manager.add_record(name, endpoint)?;
            println!("{}  {}  {}", record.id, record.name, record.endpoint);
        }
        Commands::List => {
            print_records(&manager.records());
        }
        Commands::Status => {
            let records = manager.records();
            manager.sync_statuses(&records, None).await;
            manager.refresh_statuses(&records).await;
            print_records(&manager.records());
            let m = meshlink::metrics::snapshot();
            println!(
                "\nprobed {} connection(s); open transports: {}",
                records.len(),
                m.transports_open()
            );
        }
        Commands::Connect {
            id,
            prompt,
            seconds,
        } => {
            let record = resolve(&manager, &id)?;
            let watcher = manager.clone();
            let watched = record.id;
            let _sub = manager.subscribe(move || {
                if let Some(r) = watcher.record(watched) {
                    info!("{} is {}", r.name, r.status);
                }
            });
            info!("Connecting to {} ({})", record.name, record.endpoint);
            let connected = manager
                .connect(record.id, OpenOptions { allow_prompt: prompt })
                .await?;
            if !connected {
                let reason = manager
                    .record(record.id)
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "connection closed".to_string());
                manager.shutdown().await;
                eprintln!("Failed to connect to {}: {}", record.name, reason);
                std::process::exit(1);
            }
            println!("Connected to {}. Press Ctrl-C to disconnect.", record.name);
            match seconds {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    }
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Ctrl-C handler failed: {}", e);
                    }
                }
            }
            if let Some(r) = manager.record(record.id) {
                if let Some(node) = r.node_num {
                    println!("Node !{:08x} ended in status {}", node, r.status);
                }
            }
            manager.disconnect(record.id).await?;
        }
        Commands::SetDefault { id } => {
            let record = resolve(&manager, &id)?;
            manager.set_default(record.id).await?;
            println!("{} is now the default connection", record.name);
        }
        Commands::Rename { id, name } => {
            let record = resolve(&manager, &id)?;
            let renamed = manager.rename(record.id, name).await?;
            println!("Renamed {} to {}", record.name, renamed.name);
        }
        Commands::Remove { id } => {
            let record = resolve(&manager, &id)?;
            manager.remove(record.id).await?;
            println!("Removed {}", record.name);
        }
    }

    manager.shutdown().await;
    Ok(())
}

fn build_manager(config: &Config) -> Result<ConnectionManager> {
    let store = JsonRecordStore::open(&config.storage.registry_file)?;
    let transports = system_transports(config)?;
    Ok(ConnectionManager::new(
        Arc::new(store),
        transports,
        ManagerSettings::from_config(&config.manager),
    ))
}

/// Finds a record by full id, unique id prefix or exact name.
fn resolve(manager: &ConnectionManager, key: &str) -> Result<ConnectionRecord> {
    let records = manager.records();
    if let Some(r) = records.iter().find(|r| r.id.to_string() == key) {
        return Ok(r.clone());
    }
    let mut matches: Vec<&ConnectionRecord> = records
        .iter()
        .filter(|r| r.name == key || r.id.to_string().starts_with(key))
        .collect();
    match matches.len() {
        0 => Err(anyhow!("no connection matches '{}'", key)),
        1 => Ok(matches.remove(0).clone()),
        n => Err(anyhow!("'{}' matches {} connections; use the full id", key, n)),
    }
}

fn print_records(records: &[ConnectionRecord]) {
    if records.is_empty() {
        println!("No saved connections. Add one with `meshlink add`.");
        return;
    }
    println!(
        "{:<8}  {:<20}  {:<9}  {:<13}  {}",
        "ID", "NAME", "TRANSPORT", "STATUS", "ENDPOINT"
    );
    for r in records {
        let short: String = r.id.to_string().chars().take(8).collect();
        let name = if r.is_default {
            format!("{} *", r.name)
        } else {
            r.name.clone()
        };
        println!(
            "{:<8}  {:<20}  {:<9}  {:<13}  {}",
            short,
            name,
            r.transport_kind().to_string(),
            r.status.to_string(),
            r.endpoint
        );
        if let Some(err) = &r.error {
            println!("{:>10}last error: {}", "", err);
        }
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{}': {}", s, e))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Only echo to the console when someone is watching it
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_ids_accept_optional_prefix() {
        assert_eq!(parse_hex_u16("239a"), Ok(0x239a));
        assert_eq!(parse_hex_u16("0x10C4"), Ok(0x10c4));
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn cli_parses_serial_add() {
        let cli = Cli::try_parse_from([
            "meshlink", "add", "desk", "--path", "/dev/ttyACM0", "-b", "921600",
        ])
        .unwrap();
        match cli.command {
            Commands::Add { path, baud, host, .. } => {
                assert_eq!(path.as_deref(), Some("/dev/ttyACM0"));
                assert_eq!(baud, Some(921600));
                assert!(host.is_none());
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn host_and_path_conflict() {
        assert!(Cli::try_parse_from([
            "meshlink", "add", "x", "--host", "a.local", "--path", "/dev/ttyUSB0",
        ])
        .is_err());
    }
}
