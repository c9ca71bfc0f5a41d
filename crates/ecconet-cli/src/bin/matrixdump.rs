//! Decode a candump-style text log of ECCONet/Matrix traffic into the tokens
//! and FTP/pattern-sync messages the bus actually carried.
use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use ecconet_cli::candump::CandumpParser;
use ecconet_cli::stdio::{get_input_reader, get_output_writer};
use ecconet_core::frame::{CanId, RawFrame};
use ecconet_core::receiver::{DispatchKind, Inbound, Receiver};

/// Decode an ECCONet/Matrix candump into human-readable tokens
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Address to reassemble traffic for. Only frames addressed to this node
    /// or broadcast to all nodes can be reassembled; point-to-point traffic
    /// addressed elsewhere is invisible from any other vantage point.
    #[clap(short, long, default_value_t = 0)]
    address: u8,

    /// Emit one JSON object per decoded message instead of a text summary
    #[clap(long)]
    json: bool,

    /// Path to the input. stdin if '-' or if not passed
    input: Option<PathBuf>,

    /// Path to the output. stdout if '-' or if not passed
    output: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("MATRIX_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let input = get_input_reader(&args.input)?;
    let mut output = get_output_writer(&args.output)?;

    let mut receiver = Receiver::new(args.address);
    let records = CandumpParser::new(input);
    for record in records {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to parse line: {e}");
                continue;
            }
        };

        let Some(id) = CanId::decode(record.id) else {
            tracing::debug!(id = record.id, "not a SINGLE/BODY/LAST frame, skipping");
            continue;
        };
        let frame = match RawFrame::new(id, record.data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("{e}");
                continue;
            }
        };

        receiver.push_frame(frame, record.timestamp_ms);
        for inbound in receiver.tick(record.timestamp_ms) {
            write_inbound(&mut output, &inbound, args.json)?;
        }
    }

    Ok(())
}

fn write_inbound(output: &mut dyn std::io::Write, inbound: &Inbound, json: bool) -> eyre::Result<()> {
    if json {
        serde_json::to_writer(&mut *output, inbound)?;
        writeln!(output)?;
        return Ok(());
    }

    let beacon = if inbound.accelerate_beacon { "*" } else { " " };
    match &inbound.kind {
        DispatchKind::PatternSync { enumeration } => {
            writeln!(output, "{beacon} {:>3} pattern-sync enumeration={enumeration}", inbound.source)?;
        }
        DispatchKind::FtpRequest { key, body } => {
            writeln!(output, "{beacon} {:>3} ftp-request  key={key} body={}", inbound.source, hex::encode(body))?;
        }
        DispatchKind::FtpResponse { key, body } => {
            writeln!(output, "{beacon} {:>3} ftp-response key={key} body={}", inbound.source, hex::encode(body))?;
        }
        DispatchKind::Tokens(tokens) => {
            for token in tokens {
                writeln!(
                    output,
                    "{beacon} {:>3} token        address={} key={:#06x} value={}",
                    inbound.source, token.address, token.key, token.value
                )?;
            }
        }
    }
    Ok(())
}
