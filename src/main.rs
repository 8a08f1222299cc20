//! # Printlink CLI
//!
//! Command-line interface for portable print heads.
//!
//! ## Usage
//!
//! ```bash
//! # List devices on every transport
//! printlink discover
//!
//! # List the opcode catalogue
//! printlink opcodes
//!
//! # Send one command and print the response
//! printlink --serial /dev/ttyUSB0 send READ_BATTERY
//! printlink --usb 1a86:7523 send 0x0010 08
//!
//! # Print an image, or store it as the logo
//! printlink --rfcomm 00:11:22:33:44:55 print label.png
//! printlink --rfcomm /dev/rfcomm0 logo logo.png
//!
//! # Watch status changes and device notifications
//! printlink --params device.json monitor --seconds 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use printlink::{
    ConnectionConfig, ConnectionParameters, ManagedConnection, SdkError,
    command::{DataObj, DataSendType},
    factory::{LogoDataFactory, MultiRowDataFactory, PrintHeadProfile},
    protocol::{OPCODE_TABLE, OpCode},
    transport::{bluetooth, discovery},
};

/// Printlink - portable printer utility
#[derive(Parser, Debug)]
#[command(name = "printlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Serial port of the device
    #[arg(long, global = true, value_name = "PORT")]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = printlink::transport::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// USB device as VID:PID (hex)
    #[arg(long, global = true, value_name = "VID:PID")]
    usb: Option<String>,

    /// Bluetooth device as a MAC address or a bound RFCOMM TTY
    #[arg(long, global = true, value_name = "PATH|MAC")]
    rfcomm: Option<String>,

    /// Connection parameters as JSON
    #[arg(long, global = true, value_name = "FILE")]
    params: Option<PathBuf>,

    /// Connection tuning as JSON
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print head profile as JSON
    #[arg(long, global = true, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices on every transport
    Discover {
        /// Only USB devices with this VID:PID
        #[arg(long, value_name = "VID:PID")]
        filter: Option<String>,
    },

    /// List known opcodes
    Opcodes,

    /// Send one command and print the response
    Send {
        /// Opcode name (READ_BATTERY) or number (0x0202)
        opcode: String,

        /// Parameters as hex bytes ("08", "01 ff", "01ff")
        params: Option<String>,

        /// Response deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Threshold a PNG and stream it to the head
    Print {
        png: PathBuf,

        /// Pixels darker than this print
        #[arg(long, default_value_t = 128)]
        threshold: u8,

        /// Wait for an acknowledgment after every chunk
        #[arg(long)]
        wait: bool,
    },

    /// Threshold a PNG and store it as the device logo
    Logo {
        png: PathBuf,

        #[arg(long, default_value_t = 128)]
        threshold: u8,
    },

    /// Report status changes and device notifications
    Monitor {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RUST_LOG")
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), SdkError> {
    match &cli.command {
        Commands::Discover { filter } => {
            let filter = filter.as_deref().map(parse_usb_ids).transpose()?;
            let devices = discovery::discover_all(filter);
            if devices.is_empty() {
                println!("No devices found.");
            }
            for device in devices {
                println!("{:<18} {:<28} {}", device.kind, device.address, device.name);
            }
            Ok(())
        }

        Commands::Opcodes => {
            for info in OPCODE_TABLE {
                println!("0x{:04X}  {:<28} {}", info.code.code(), info.name, info.description);
            }
            Ok(())
        }

        Commands::Send {
            opcode,
            params,
            timeout_ms,
        } => {
            let opcode = parse_opcode(opcode)?;
            let params = params.as_deref().map(parse_hex).transpose()?.unwrap_or_default();
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(ms) = timeout_ms {
                config.request_timeout_ms = *ms;
            }

            let conn = connect(&cli, config).await?;
            let reply = conn.request(opcode, params).await;
            conn.disconnect();

            let reply = reply?;
            println!("{}: {}", reply.opcode, to_hex(&reply.payload));
            Ok(())
        }

        Commands::Print {
            png,
            threshold,
            wait,
        } => {
            let profile = load_profile(cli.profile.as_deref())?;
            let mut factory = MultiRowDataFactory::new(profile);
            if *wait {
                factory = factory.with_send_type(DataSendType::CompleteOnceWaitNext);
            }
            let chunks = factory.build_image(&load_png(png)?, *threshold)?;
            transfer(&cli, chunks).await
        }

        Commands::Logo { png, threshold } => {
            let profile = load_profile(cli.profile.as_deref())?;
            let chunks = LogoDataFactory::new(profile).build_image(&load_png(png)?, *threshold)?;
            transfer(&cli, chunks).await
        }

        Commands::Monitor { seconds } => {
            let conn = connect(&cli, load_config(cli.config.as_deref())?).await?;
            let mut status = conn.subscribe_status();
            let mut notifications = conn.subscribe_notifications();
            let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));

            loop {
                let stop = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = stop => break,
                    _ = tokio::signal::ctrl_c() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        println!("status: {}", *status.borrow_and_update());
                    }
                    frame = notifications.recv() => match frame {
                        Ok(frame) => println!("{}: {}", frame.opcode, to_hex(&frame.payload)),
                        Err(e) => tracing::warn!(error = %e, "notification stream interrupted"),
                    },
                }
            }

            conn.disconnect();
            Ok(())
        }
    }
}

async fn connect(cli: &Cli, config: ConnectionConfig) -> Result<ManagedConnection, SdkError> {
    let params = connection_parameters(cli)?;
    let conn = ManagedConnection::new(params, config)?;
    let device = conn.connect().await?;
    println!("Connected to {} ({})", device.name, device.address);
    Ok(conn)
}

async fn transfer(cli: &Cli, chunks: Vec<DataObj>) -> Result<(), SdkError> {
    let conn = connect(cli, load_config(cli.config.as_deref())?).await?;
    println!("Sending {} chunks...", chunks.len());
    let report = conn.transfer(chunks).await;
    conn.disconnect();

    let report = report?;
    println!(
        "Sent {} chunks ({} bytes) successfully!",
        report.chunks_sent, report.bytes_sent
    );
    Ok(())
}

fn connection_parameters(cli: &Cli) -> Result<ConnectionParameters, SdkError> {
    if let Some(path) = &cli.params {
        let json = std::fs::read_to_string(path)
            .map_err(|e| SdkError::Config(format!("{}: {}", path.display(), e)))?;
        let params: ConnectionParameters = serde_json::from_str(&json)?;
        return Ok(params);
    }
    if let Some(port) = &cli.serial {
        return Ok(ConnectionParameters::serial(port.clone(), cli.baud));
    }
    if let Some(ids) = &cli.usb {
        let (vendor_id, product_id) = parse_usb_ids(ids)?;
        return Ok(ConnectionParameters::usb(vendor_id, product_id));
    }
    if let Some(target) = &cli.rfcomm {
        if bluetooth::is_valid_mac(target) {
            return Ok(ConnectionParameters::bluetooth(target.clone()));
        }
        let binding = bluetooth::rfcomm_bindings()?
            .into_iter()
            .find(|b| b.device_path() == *target)
            .ok_or_else(|| {
                SdkError::InvalidParameter(format!("{} is not bound to a Bluetooth device", target))
            })?;
        return Ok(ConnectionParameters::ClassicBluetooth {
            address: binding.address,
            device: Some(target.clone()),
            service_uuid: None,
            channel: binding.channel.unwrap_or(printlink::transport::DEFAULT_RFCOMM_CHANNEL),
        });
    }
    Err(SdkError::InvalidParameter(
        "no device given; use --serial, --usb, --rfcomm or --params".to_string(),
    ))
}

fn load_config(path: Option<&Path>) -> Result<ConnectionConfig, SdkError> {
    match path {
        Some(path) => ConnectionConfig::from_json_file(path),
        None => Ok(ConnectionConfig::default()),
    }
}

fn load_profile(path: Option<&Path>) -> Result<PrintHeadProfile, SdkError> {
    let Some(path) = path else {
        return Ok(PrintHeadProfile::standard());
    };
    let json = std::fs::read_to_string(path)
        .map_err(|e| SdkError::Config(format!("{}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&json)?)
}

fn load_png(path: &Path) -> Result<image::GrayImage, SdkError> {
    let img = image::open(path)
        .map_err(|e| SdkError::InvalidParameter(format!("{}: {}", path.display(), e)))?;
    Ok(img.to_luma8())
}

fn parse_usb_ids(s: &str) -> Result<(u16, u16), SdkError> {
    let invalid = || SdkError::InvalidParameter(format!("'{}' is not VID:PID", s));
    let (vid, pid) = s.split_once(':').ok_or_else(invalid)?;
    let vid = u16::from_str_radix(vid, 16).map_err(|_| invalid())?;
    let pid = u16::from_str_radix(pid, 16).map_err(|_| invalid())?;
    Ok((vid, pid))
}

fn parse_opcode(s: &str) -> Result<OpCode, SdkError> {
    if let Some(info) = OPCODE_TABLE.iter().find(|info| info.name.eq_ignore_ascii_case(s)) {
        return Ok(info.code);
    }
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16)
        .map(OpCode)
        .map_err(|_| SdkError::InvalidParameter(format!("unknown opcode '{}'", s)))
}

fn parse_hex(s: &str) -> Result<Vec<u8>, SdkError> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        return Err(SdkError::InvalidParameter(format!("'{}' is not hex", s)));
    }
    if digits.len() % 2 != 0 {
        return Err(SdkError::InvalidParameter(format!(
            "'{}' has an odd number of hex digits",
            s
        )));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| SdkError::InvalidParameter(format!("'{}' is not hex", s)))
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opcode_by_name_and_number() {
        assert_eq!(parse_opcode("read_battery").unwrap(), OpCode::READ_BATTERY);
        assert_eq!(parse_opcode("0x0220").unwrap(), OpCode::HEARTBEAT);
        assert_eq!(parse_opcode("10").unwrap(), OpCode::SET_DENSITY);
        assert!(parse_opcode("NOPE").is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("01 ff").unwrap(), vec![0x01, 0xFF]);
        assert_eq!(parse_hex("01ff").unwrap(), vec![0x01, 0xFF]);
        assert!(parse_hex("1ff").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_usb_ids() {
        assert_eq!(parse_usb_ids("1a86:7523").unwrap(), (0x1A86, 0x7523));
        assert!(parse_usb_ids("1a86").is_err());
    }

    #[test]
    fn test_cli_parses_global_target_after_subcommand() {
        let cli = Cli::try_parse_from(["printlink", "send", "HEARTBEAT", "--serial", "COM3"]).unwrap();
        assert_eq!(cli.serial.as_deref(), Some("COM3"));
        assert_eq!(
            connection_parameters(&cli).unwrap(),
            ConnectionParameters::serial("COM3", 115_200)
        );
    }
}
