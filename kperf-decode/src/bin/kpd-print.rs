use anyhow::Result;
use clap::Parser;

use std::fs;
use std::io::{self, Read, Write};

use kpdecode::{CursorConfig, DecodeError, TraceBuffer};
use tracing_subscriber::filter::EnvFilter;

/// Prints one line per decoded record.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input RAW file or '-' to use stdin.
    #[arg(short, long, default_value_t = String::from("-"))]
    input: String,

    /// Output file or '-' to use stdout.
    #[arg(short, long, default_value_t = String::from("-"))]
    output: String,

    /// Print every kevent without correlating start and end events.
    #[arg(long)]
    raw: bool,

    /// Force records that are still open at the end of the buffer.
    #[arg(long)]
    flush: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("KPD_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let buffer = open_input(args.input.as_str())?;
    let mut output = open_output(args.output.as_str())?;

    let mut cursor = buffer.cursor(CursorConfig::default());
    cursor.set_option(args.raw);

    while let Some(record) = cursor.pull_next_record()? {
        writeln!(output, "{record}")?;
    }
    if args.flush && cursor.flush() > 0 {
        while let Some(record) = cursor.pull_next_record()? {
            writeln!(output, "{record}")?;
        }
    }

    match (cursor.header(), cursor.rejected_version()) {
        (Some(header), _) => tracing::info!(
            version = format_args!("{:#010x}", header.version()),
            kevents = cursor.kevent_count(),
            "done"
        ),
        (None, Some(version)) => return Err(DecodeError::UnrecognizedVersion(version).into()),
        (None, None) => anyhow::bail!("input is too short to hold a RAW header"),
    }

    output.flush()?;
    Ok(())
}

fn open_input(input: &str) -> io::Result<TraceBuffer<'static>> {
    if input == "-" {
        let mut bytes = Vec::new();
        io::stdin().lock().read_to_end(&mut bytes)?;
        return Ok(TraceBuffer::new(bytes.leak()));
    }
    // The file is opened read-only and is not expected to change while it is being decoded.
    unsafe { TraceBuffer::map(input) }
}

fn open_output(output: &str) -> io::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    Ok(Box::new(io::BufWriter::new(fs::File::create(output)?)))
}
