// src/main.rs
//
// serial_cli: small terminal around a serial session.
// Lists ports and option values, or opens a port, prints every inbound packet
// and sends each stdin line.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serial_session::catalog::{self, BAUD_RATES, DATA_BITS, SUPPORTED_PARITIES, SUPPORTED_STOP_BITS};
use serial_session::logging::{init_file_logging, stop_file_logging};
use serial_session::{load_settings, InboundPacket, SerialSession, SessionSettings};

#[derive(Parser)]
#[command(name = "serial_cli", version, about = "Serial port session terminal")]
struct Cli {
    /// Mirror log output to a timestamped file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports present on this host
    Ports,
    /// Print the baud rates, parities, data bits and stop bits this driver can open with
    Options,
    /// Open a port, print inbound packets and send stdin lines
    Open(OpenArgs),
}

#[derive(clap::Args)]
struct OpenArgs {
    /// TOML settings file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    #[arg(long)]
    parity: Option<String>,
    #[arg(long)]
    data_bits: Option<u8>,
    #[arg(long)]
    stop_bits: Option<String>,
    /// Text encoding for sent lines: utf8 or ascii
    #[arg(long)]
    encoding: Option<String>,
    /// Print packets as JSON instead of hex
    #[arg(long)]
    json: bool,
    /// Treat each stdin line as hex bytes instead of text
    #[arg(long)]
    hex_input: bool,
    /// Do not append "\r\n" to text lines
    #[arg(long)]
    no_line_ending: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(dir) = &cli.log_dir {
        if let Err(e) = init_file_logging(dir) {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    let result = match cli.command {
        Command::Ports => print_ports(),
        Command::Options => {
            print_options();
            Ok(())
        }
        Command::Open(args) => run_terminal(args),
    };

    stop_file_logging();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_ports() -> Result<(), String> {
    let ports = catalog::list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  {} {:04x}:{:04x} {}",
                port.port_name,
                port.port_type,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}  {}", port.port_name, port.port_type),
        }
    }
    Ok(())
}

fn print_options() {
    let bauds: Vec<String> = BAUD_RATES.iter().map(|b| b.to_string()).collect();
    let data_bits: Vec<String> = DATA_BITS.iter().map(|b| b.to_string()).collect();
    println!("baud rates: {}", bauds.join(", "));
    println!("parity:     {}", SUPPORTED_PARITIES.join(", "));
    println!("data bits:  {}", data_bits.join(", "));
    println!("stop bits:  {}", SUPPORTED_STOP_BITS.join(", "));
}

fn resolve_settings(args: &OpenArgs) -> Result<SessionSettings, String> {
    let mut settings = match &args.config {
        Some(path) => load_settings(path)?,
        None => {
            let port = args
                .port
                .as_deref()
                .ok_or("Either --port or --config is required")?;
            SessionSettings::for_port(port)
        }
    };

    if let Some(port) = &args.port {
        settings.port = port.clone();
    }
    if let Some(baud) = args.baud {
        settings.baud_rate = baud;
    }
    if let Some(parity) = &args.parity {
        settings.parity = parity.clone();
    }
    if let Some(bits) = args.data_bits {
        settings.data_bits = bits;
    }
    if let Some(stop_bits) = &args.stop_bits {
        settings.stop_bits = stop_bits.clone();
    }
    if let Some(encoding) = &args.encoding {
        settings.text_encoding = encoding.clone();
    }
    Ok(settings)
}

fn print_packet(packet: &InboundPacket, json: bool) {
    if json {
        match serde_json::to_string(packet) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to serialize packet: {}", e),
        }
    } else {
        println!("<< {} ({} bytes)", packet.to_hex(), packet.len());
    }
}

fn run_terminal(args: OpenArgs) -> Result<(), String> {
    let settings = resolve_settings(&args)?;
    let session = SerialSession::from_settings(&settings);

    // Configuration problems surface at construction; report them before open
    let pending = session.current_error();
    if !pending.is_empty() {
        eprintln!("{}", pending);
    }

    if !session.open() {
        return Err(session.current_error());
    }

    let json = args.json;
    session.add_handler(move |packet| print_packet(&packet, json));

    eprintln!(
        "Connected to {} ({}). Ctrl-D to quit.",
        session.port_name(),
        session
            .settings()
            .map(|s| s.summary())
            .unwrap_or_default()
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| format!("Failed to read stdin: {}", e))?;

        let sent = if args.hex_input {
            let compact: String = line.split_whitespace().collect();
            match hex::decode(&compact) {
                Ok(bytes) => session.send_bytes(&bytes),
                Err(e) => {
                    eprintln!("Invalid hex input: {}", e);
                    continue;
                }
            }
        } else if args.no_line_ending {
            session.send_text(&line)
        } else {
            session.send_text(&format!("{}\r\n", line))
        };

        if !sent {
            eprintln!("Send failed: {}", session.current_error());
        }
        if !session.is_open() {
            break;
        }
    }

    session.dispose();
    let closing = session.current_error();
    if !closing.is_empty() {
        eprintln!("{}", closing);
    }
    Ok(())
}
