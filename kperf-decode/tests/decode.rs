mod common;

use common::RawBuilder;
use kpdecode::correlate::MAX_RECORDS;
use kpdecode::events::Phase;
use kpdecode::kdebug::{
    DebugId, FuncQualifier, LOST_EVENTS, PERF_AST_HANDLER, PERF_SAMPLE, PERF_TIMER_HANDLER,
    THREAD_NAME,
};
use kpdecode::layout::EventLayout;
use kpdecode::{Cursor, CursorConfig, DecodeError, Record, RecordFlags, StatKind, TraceBuffer};

static FIXTURE: &[u8] = include_bytes!("data/kperf-v2-64.raw");

fn start(id: DebugId) -> DebugId {
    id.with_func(FuncQualifier::Start)
}

fn end(id: DebugId) -> DebugId {
    id.with_func(FuncQualifier::End)
}

fn pull_all(cursor: &mut Cursor) -> Vec<Record> {
    let mut records = Vec::new();
    while let Some(record) = cursor.pull_next_record().unwrap() {
        records.push(record);
    }
    records
}

fn decode(buffer: &[u8]) -> Vec<Record> {
    let mut cursor = Cursor::new();
    cursor.attach(buffer).unwrap();
    pull_all(&mut cursor)
}

#[test]
fn single_thread_entry() {
    let buffer = RawBuilder::v2(true).thread(0x1234, 5, "proc").build();
    let records = decode(&buffer);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].thread_id(), 0x1234);
    assert_eq!(records[0].flags(), RecordFlags::THREAD_NAME);
    assert_eq!(&records[0].payload().bytes()[..8], b"proc\0\0\0\0");
}

#[test]
fn thread_entries_32bit() {
    let buffer = RawBuilder::v2(false)
        .thread(7, 1, "kernel_task")
        .thread(8, 0, "ignored")
        .thread(9, 300, "a_very_long_command_name")
        .event(0, 50, DebugId::new(1, 2, 3, 0), [0; 4], 9)
        .build();
    let mut cursor = Cursor::new();
    cursor.attach(&buffer).unwrap();
    let records = pull_all(&mut cursor);

    let names: Vec<_> = records
        .iter()
        .filter(|r| r.flags() == RecordFlags::THREAD_NAME)
        .map(|r| (r.thread_id(), r.task_name()))
        .collect();
    assert_eq!(
        names,
        [
            (7, "kernel_task".to_string()),
            (9, "a_very_long_command_".to_string())
        ]
    );
    assert_eq!(records.len(), 3);
    assert_eq!(cursor.phase(), Some(Phase::Decoding32));
    assert_eq!(cursor.thread_map().map(|map| map.len()), Some(2));
}

#[test]
fn timestamp_split_both_layouts() {
    for is64 in [false, true] {
        let mut builder = RawBuilder::v2(is64);
        let mut expected = Vec::new();
        for i in 0u64..40 {
            let cpu = (i * 37 % 256) as u8;
            let timestamp = 0x00ab_cdef_0000_0000 | i * 0x1_0001;
            builder = builder.event(cpu, timestamp, DebugId::new(3, 4, i as u16, 0), [i; 4], i);
            expected.push((cpu as u32, timestamp));
        }
        let buffer = builder.build();

        let mut cursor = Cursor::new();
        cursor.set_option(true);
        cursor.attach(&buffer).unwrap();
        let records = pull_all(&mut cursor);
        let got: Vec<_> = records.iter().map(|r| (r.cpu_id(), r.timestamp())).collect();
        assert_eq!(got, expected, "is64 = {is64}");
        assert!(records.iter().all(|r| r.flags() == RecordFlags::RAW));
        assert_eq!(records[3].payload().args(), [3; 4]);
        assert_eq!(records[3].thread_id(), 3);
    }
}

#[test]
fn version1_is_64bit() {
    let buffer = RawBuilder::v1()
        .thread(1, 1, "kernel_task")
        .event(2, 10, DebugId::new(1, 0, 0, 0), [u64::MAX; 4], 0x1_0000_0001)
        .build();
    let mut cursor = Cursor::new();
    cursor.attach(&buffer).unwrap();
    let records = pull_all(&mut cursor);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].payload().args(), [u64::MAX; 4]);
    assert_eq!(records[1].thread_id(), 0x1_0000_0001);
    let header = cursor.header().unwrap();
    assert_eq!(header.layout(), EventLayout::Bits64);
    assert_eq!(header.frequency(), None);
    assert_eq!(header.time_of_day(), (1_700_000_000, 250_000));
}

#[test]
fn termination() {
    let buffer = RawBuilder::v2(true)
        .event(0, 1, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .event(0, 2, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .trailing(&[0xaa; 63])
        .build();
    let mut cursor = Cursor::new();
    cursor.attach(&buffer).unwrap();
    assert_eq!(pull_all(&mut cursor).len(), 2);
    for _ in 0..4 {
        assert!(cursor.pull_next_record().unwrap().is_none());
    }
    assert_eq!(cursor.kevent_count(), 2);
}

#[test]
fn start_end_merged() {
    let buffer = RawBuilder::v2(true)
        .event(3, 100, start(PERF_SAMPLE), [0, 11, 22, 0], 5)
        .event(3, 200, end(PERF_SAMPLE), [1, 2, 3, 4], 5)
        .build();
    let records = decode(&buffer);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.flags(), RecordFlags::SAMPLE | RecordFlags::COMPLETE);
    assert_eq!(record.timestamp(), 100);
    assert_eq!(record.cpu_id(), 3);
    assert_eq!(record.payload().debug_id(), end(PERF_SAMPLE));
    assert_eq!(record.payload().action_id(), 11);
    assert_eq!(record.payload().userdata(), 22);
}

#[test]
fn unmatched_start_needs_flush() {
    let buffer = RawBuilder::v2(true)
        .event(0, 100, start(PERF_SAMPLE), [0; 4], 5)
        .event(1, 110, DebugId::new(1, 0, 0, 0), [0; 4], 5)
        .build();
    let mut cursor = Cursor::new();
    cursor.attach(&buffer).unwrap();
    assert!(pull_all(&mut cursor).is_empty());
    assert_eq!(cursor.stats(StatKind::RecordCount).unwrap(), 2);

    assert_eq!(cursor.flush(), 1);
    let records = pull_all(&mut cursor);
    assert_eq!(records.len(), 2);
    assert!(records[0].is_forced());
    assert_eq!(records[1].flags(), RecordFlags::KEVENT);
}

#[test]
fn lost_events_flush_one_cpu() {
    let buffer = RawBuilder::v2(true)
        .event(0, 10, start(PERF_SAMPLE), [0; 4], 1)
        .event(0, 11, start(PERF_AST_HANDLER), [0; 4], 1)
        .event(1, 12, start(PERF_TIMER_HANDLER), [0; 4], 2)
        .event(0, 13, LOST_EVENTS, [0; 4], 1)
        .event(1, 14, end(PERF_TIMER_HANDLER), [0; 4], 2)
        .build();
    let records = decode(&buffer);
    let summary: Vec<_> = records
        .iter()
        .map(|r| (r.cpu_id(), r.timestamp(), r.flags()))
        .collect();
    assert_eq!(
        summary,
        [
            (0, 10, RecordFlags::SAMPLE | RecordFlags::FORCED),
            (0, 11, RecordFlags::HANDLER | RecordFlags::FORCED),
            (1, 12, RecordFlags::HANDLER | RecordFlags::COMPLETE),
            (0, 11, RecordFlags::LOST_EVENTS),
        ]
    );
}

#[test]
fn backpressure_default_bound() {
    let mut builder = RawBuilder::v2(true).event(0, 1, start(PERF_SAMPLE), [0; 4], 1);
    for i in 0..MAX_RECORDS as u64 {
        builder = builder.event(1, 2 + i, DebugId::new(1, 0, 0, 0), [i; 4], 1);
    }
    let buffer = builder.build();

    let mut cursor = Cursor::new();
    cursor.attach(&buffer).unwrap();
    let head = cursor.pull_next_record().unwrap().unwrap();
    assert_eq!(head.timestamp(), 1);
    assert!(head.is_forced());
    assert!(head.flags().contains(RecordFlags::SAMPLE));

    let mut count = 1;
    while let Some(record) = cursor.pull_next_record().unwrap() {
        assert!(!record.is_forced());
        assert!(cursor.stats(StatKind::RecordCount).unwrap() <= MAX_RECORDS as u64);
        count += 1;
    }
    assert_eq!(count, MAX_RECORDS + 1);
}

#[test]
fn backpressure_configured_bound() {
    let mut builder = RawBuilder::v2(false);
    for cpu in 0..4 {
        builder = builder.event(cpu, cpu as u64, start(PERF_SAMPLE), [0; 4], 1);
    }
    let buffer = builder.build();

    let mut cursor = Cursor::with_config(CursorConfig { max_records: 2 });
    cursor.attach(&buffer).unwrap();
    let records = pull_all(&mut cursor);
    // Each start after the first pushes the one before it out. The last one never reaches the
    // bound.
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(Record::is_forced));
    assert_eq!(cursor.stats(StatKind::RecordCount).unwrap(), 1);
}

#[test]
fn unknown_version_stalls() {
    let buffer = RawBuilder::with_version(0x55aa_0300, true)
        .event(0, 1, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .build();
    let mut cursor = Cursor::new();
    cursor.attach(&buffer).unwrap();
    for _ in 0..3 {
        assert!(cursor.pull_next_record().unwrap().is_none());
    }
    assert_eq!(cursor.phase(), Some(Phase::HeaderPending));
    assert_eq!(cursor.rejected_version(), Some(0x55aa_0300));
    assert_eq!(cursor.kevent_count(), 0);
    assert!(matches!(
        cursor.stats(StatKind::RecordCount),
        Err(DecodeError::NotReady)
    ));
}

#[test]
fn negative_thread_count() {
    let buffer = RawBuilder::v2(true)
        .thread_count(-1)
        .event(0, 1, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .build();
    let records = decode(&buffer);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].flags(), RecordFlags::KEVENT);
}

#[test]
fn truncated_buffer() {
    let buffer = RawBuilder::v2(true)
        .thread(1, 1, "a")
        .thread(2, 1, "b")
        .build();
    // The thread map claims two entries but only one fits.
    let records = decode(&buffer[..0x120 + 0x30]);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].thread_id(), 1);
    assert!(decode(&[]).is_empty());
}

#[test]
fn detach_resets() {
    let first = RawBuilder::v2(true)
        .event(0, 10, start(PERF_SAMPLE), [0; 4], 1)
        .event(0, 11, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .build();
    let second = RawBuilder::v2(false)
        .event(0, 20, end(PERF_SAMPLE), [0; 4], 1)
        .build();

    let mut cursor = Cursor::new();
    cursor.attach(&first).unwrap();
    assert!(pull_all(&mut cursor).is_empty());
    assert!(matches!(
        cursor.attach(&second),
        Err(DecodeError::AlreadyAttached)
    ));

    let detached = cursor.detach().unwrap();
    assert_eq!(detached.as_ptr(), first.as_ptr());
    assert!(cursor.phase().is_none());
    assert_eq!(cursor.kevent_count(), 0);

    // The open start of the first buffer is gone.
    cursor.attach(&second).unwrap();
    let records = pull_all(&mut cursor);
    assert_eq!(records.len(), 1);
    assert!(records[0].flags().contains(RecordFlags::UNMATCHED_END));
    assert_eq!(cursor.phase(), Some(Phase::Decoding32));
}

#[test]
fn byte_estimate() {
    let buffer = RawBuilder::v2(false)
        .event(0, 1, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .event(0, 2, start(PERF_SAMPLE), [0; 4], 1)
        .event(0, 3, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .build();
    let mut cursor = Cursor::new();
    cursor.attach(&buffer).unwrap();

    let first = cursor.pull_next_record().unwrap().unwrap();
    assert_eq!(first.consumed_bytes(), 0x20);
    assert!(cursor.pull_next_record().unwrap().is_none());
    // The pending start is the head.
    assert_eq!(cursor.stats(StatKind::ByteEstimate).unwrap(), 0x40);

    cursor.flush();
    assert_eq!(pull_all(&mut cursor).len(), 2);
    assert_eq!(cursor.stats(StatKind::ByteEstimate).unwrap(), 0x60);
}

#[test]
fn iterate_records() {
    let buffer = RawBuilder::v2(true)
        .event(0, 1, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .event(1, 2, DebugId::new(1, 0, 0, 0), [0; 4], 1)
        .build();
    let cursor = TraceBuffer::new(&buffer).cursor(CursorConfig::default());
    let records: Result<Vec<_>, _> = cursor.collect();
    assert_eq!(records.unwrap().len(), 2);
}

#[test]
fn fixture() {
    let mut cursor = Cursor::new();
    cursor.attach(FIXTURE).unwrap();
    let records = pull_all(&mut cursor);

    let header = cursor.header().unwrap();
    assert_eq!(header.frequency(), Some(24_000_000));
    assert_eq!(header.thread_count(), 3);
    assert_eq!(
        cursor.thread_map().and_then(|map| map.get(0x303)).map(|e| e.name().into_owned()),
        Some("Safari".to_string())
    );

    let summary: Vec<_> = records
        .iter()
        .map(|r| (r.cpu_id(), r.timestamp(), r.thread_id(), r.flags()))
        .collect();
    assert_eq!(
        summary,
        [
            (0, 0, 0x101, RecordFlags::THREAD_NAME),
            (0, 0, 0x303, RecordFlags::THREAD_NAME),
            (0, 1000, 0x303, RecordFlags::SAMPLE | RecordFlags::COMPLETE),
            (1, 1005, 0x101, RecordFlags::KEVENT),
            (1, 1020, 0x101, RecordFlags::HANDLER | RecordFlags::FORCED),
            (1, 1020, 0x101, RecordFlags::LOST_EVENTS),
            (2, 1040, 0x303, RecordFlags::HANDLER | RecordFlags::UNMATCHED_END),
            (0, 1050, 0x303, RecordFlags::THREAD_NAME),
        ]
    );
    assert_eq!(records[0].task_name(), "kernel_task");
    assert_eq!(records[2].payload().action_id(), 3);
    assert_eq!(records[2].payload().userdata(), 0xdead);
    assert_eq!(records[2].payload().args(), [7, 8, 9, 10]);
    assert_eq!(records[7].task_name(), "Safari");
    assert_eq!(records[7].payload().debug_id(), THREAD_NAME);

    // A generic kperf interval is still open at the end of the buffer.
    assert_eq!(cursor.stats(StatKind::RecordCount).unwrap(), 1);
    assert_eq!(cursor.stats(StatKind::ByteEstimate).unwrap(), 10 * 0x40);
    assert_eq!(cursor.flush(), 1);
    let rest = pull_all(&mut cursor);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].flags(), RecordFlags::INTERVAL | RecordFlags::FORCED);
    assert_eq!(rest[0].timestamp(), 1060);
}
