use anyhow::Result;
use clap::Parser;

use std::collections::BTreeMap;
use std::io::{self, Read};

use kpdecode::{CursorConfig, DecodeError, RecordFlags, StatKind, TraceBuffer};
use tracing_subscriber::filter::EnvFilter;

/// Counts the records of a RAW file by classification.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input RAW file or '-' to use stdin.
    #[arg(short, long, default_value_t = String::from("-"))]
    input: String,

    /// Count kevents without correlating start and end events.
    #[arg(long)]
    raw: bool,

    /// Bound of the record queue.
    #[arg(long, default_value_t = kpdecode::correlate::MAX_RECORDS)]
    max_records: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("KPD_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let buffer = open_input(args.input.as_str())?;
    let mut cursor = buffer.cursor(CursorConfig {
        max_records: args.max_records,
    });
    cursor.set_option(args.raw);

    let mut stats: BTreeMap<String, u64> = BTreeMap::new();
    let mut forced: u64 = 0;
    let mut max_queued: u64 = 0;

    while let Some(record) = cursor.pull_next_record()? {
        let flags = record.flags();
        if flags.contains(RecordFlags::FORCED) {
            forced += 1;
        }
        let kind = flags.difference(RecordFlags::FORCED | RecordFlags::COMPLETE);
        *stats.entry(format!("{kind:?}")).or_default() += 1;
        max_queued = max_queued.max(cursor.stats(StatKind::RecordCount).unwrap_or_default());
    }

    let consumed = match cursor.stats(StatKind::ByteEstimate) {
        Ok(bytes) => bytes,
        Err(DecodeError::NotReady) => match cursor.rejected_version() {
            Some(version) => return Err(DecodeError::UnrecognizedVersion(version).into()),
            None => anyhow::bail!("input is too short to hold a RAW header"),
        },
        Err(err) => return Err(err.into()),
    };

    for (kind, count) in stats {
        eprintln!("{kind} => {count}");
    }
    eprintln!("forced => {forced}");
    eprintln!("open at end => {}", cursor.stats(StatKind::RecordCount)?);
    eprintln!("max queued => {max_queued}");
    eprintln!("kevents => {}", cursor.kevent_count());
    eprintln!("bytes => {consumed}");

    Ok(())
}

fn open_input(input: &str) -> io::Result<TraceBuffer<'static>> {
    if input == "-" {
        let mut bytes = Vec::new();
        io::stdin().lock().read_to_end(&mut bytes)?;
        return Ok(TraceBuffer::new(bytes.leak()));
    }
    unsafe { TraceBuffer::map(input) }
}
