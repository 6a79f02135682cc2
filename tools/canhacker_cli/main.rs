// tools/canhacker_cli/main.rs
//
// Command-line diagnostic for CanHacker adapters: opens the bus, optionally
// sends one frame, then prints received frames until --count or a timeout.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use canhacker::io::serial::list_serial_ports;
use canhacker::{
    init_logging, CanBus, CanFilter, CanFrame, CanHackerBus, CanHackerConfig, ChannelMode, IoError,
    LogConfig,
};

#[derive(Parser, Debug)]
#[command(name = "canhacker_cli", version, about = "CanHacker serial CAN adapter diagnostic")]
struct Args {
    /// Serial port, optionally with @baud (e.g. /dev/ttyACM0@921600)
    #[arg(short, long)]
    port: Option<String>,

    /// CAN bitrate in bit/s
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// normal, listen or loopback
    #[arg(short, long)]
    mode: Option<ChannelMode>,

    /// Acceptance filter, repeatable. Hex ID:MASK, append :x for 29-bit.
    #[arg(short, long = "filter", value_name = "ID:MASK[:x]")]
    filters: Vec<String>,

    /// TOML configuration file; command-line options override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frame to send after opening, hex ID#DATA (e.g. 123#AABB, 18DAF110#R)
    #[arg(short, long, value_name = "ID#DATA")]
    send: Option<String>,

    /// Stop after this many received frames
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,

    /// Stop when no frame arrives for this long
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Log filter directives (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write a timestamped log file into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(short, long)]
    list: bool,
}

/// Parse `ID#DATA` or `ID#R`. IDs longer than three hex digits are extended.
fn parse_frame(text: &str) -> Result<CanFrame, IoError> {
    let (id_text, data_text) = text
        .split_once('#')
        .ok_or_else(|| IoError::configuration(format!("Invalid frame '{}'. Expected ID#DATA", text)))?;
    let frame_id = u32::from_str_radix(id_text, 16)
        .map_err(|_| IoError::configuration(format!("Invalid frame id '{}'", id_text)))?;
    let extended = id_text.len() > 3 || frame_id > 0x7FF;

    if data_text.eq_ignore_ascii_case("r") {
        return Ok(CanFrame::new_remote(frame_id, 0, extended));
    }
    let data = hex::decode(data_text)
        .map_err(|e| IoError::configuration(format!("Invalid frame data '{}': {}", data_text, e)))?;
    Ok(if extended {
        CanFrame::new_extended(frame_id, &data)
    } else {
        CanFrame::new(frame_id, &data)
    })
}

fn format_frame(frame: &CanFrame) -> String {
    let id = if frame.is_extended {
        format!("{:08X}", frame.frame_id)
    } else {
        format!("{:03X}", frame.frame_id)
    };
    let body = if frame.is_rtr {
        "remote request".to_string()
    } else {
        hex::encode_upper(&frame.data)
    };
    let marker = if frame.is_error { " !" } else { "" };
    format!(
        "{:>10}  ch{}  {:>8}  [{}]  {}{}",
        frame.timestamp, frame.channel, id, frame.dlc, body, marker
    )
}

fn build_config(args: &Args) -> Result<CanHackerConfig, IoError> {
    let mut config = match (&args.config, &args.port) {
        (Some(path), _) => CanHackerConfig::from_file(path)?,
        (None, Some(port)) => CanHackerConfig::new(port.clone()),
        (None, None) => return Err(IoError::configuration("either --port or --config is required")),
    };
    if let (Some(_), Some(port)) = (&args.config, &args.port) {
        config.channel = port.clone();
    }
    if let Some(bitrate) = args.bitrate {
        config.bitrate = Some(bitrate);
        config.btr = None;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    for filter in &args.filters {
        config.filters.push(CanFilter::parse(filter)?);
    }
    Ok(config)
}

fn run(args: &Args) -> Result<(), IoError> {
    if args.list {
        for port in list_serial_ports()? {
            println!(
                "{:<24} {:<10} {}",
                port.port_name,
                port.port_type,
                port.product.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let config = build_config(args)?;
    let frame = args.send.as_deref().map(parse_frame).transpose()?;

    let mut bus = CanHackerBus::open(&config)?;
    match bus.identify() {
        Ok(hw) => println!("Hardware: {} (0x{:02X})", hw.name, hw.id),
        Err(e) => tracing::warn!(error = %e, "hardware query failed"),
    }

    if let Some(frame) = &frame {
        bus.send(frame, None)?;
        println!("Sent      {}", format_frame(frame));
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut received = 0;
    while received < args.count {
        match bus.recv(Some(timeout))? {
            (Some(frame), _) => {
                received += 1;
                println!("{}", format_frame(&frame));
            }
            (None, _) => {
                println!("No frame within {} ms", args.timeout_ms);
                break;
            }
        }
    }

    let dropped = bus.dropped_frames();
    if dropped.control > 0 || dropped.message > 0 {
        println!("Dropped: {} control, {} message", dropped.control, dropped.message);
    }
    bus.shutdown()
}

fn main() -> ExitCode {
    let args = Args::parse();
    let log_config = LogConfig {
        level: args.log_level.clone(),
        file_dir: args.log_dir.clone(),
        ..LogConfig::default()
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame() {
        let frame = parse_frame("123#AABB").unwrap();
        assert_eq!(frame.frame_id, 0x123);
        assert_eq!(frame.data, vec![0xAA, 0xBB]);
        assert!(!frame.is_extended);

        let frame = parse_frame("18DAF110#R").unwrap();
        assert!(frame.is_extended && frame.is_rtr);

        assert!(parse_frame("123").is_err());
        assert!(parse_frame("XYZ#00").is_err());
        assert!(parse_frame("123#ABC").is_err());
    }

    #[test]
    fn test_build_config_overrides() {
        let args = Args::parse_from([
            "canhacker_cli",
            "--port",
            "COM4@9600",
            "--bitrate",
            "250000",
            "--mode",
            "listen",
            "--filter",
            "100:700",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.channel, "COM4@9600");
        assert_eq!(config.bitrate, Some(250_000));
        assert_eq!(config.mode, ChannelMode::Listen);
        assert_eq!(config.filters, vec![CanFilter::new(0x100, 0x700)]);

        let args = Args::parse_from(["canhacker_cli"]);
        assert!(build_config(&args).is_err());
    }
}
