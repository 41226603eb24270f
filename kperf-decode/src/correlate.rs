//! Groups kevents into records.
//!
//! Records are queued in creation order. A start event opens a pending record referenced from a
//! per-CPU slot, and the matching end event completes it. The queue only releases records from its
//! head, so one pending record holds back everything queued after it until it completes or is
//! forced.

use std::collections::VecDeque;

use crate::kdebug::{Classification, SlotKind};
use crate::layout::KEvent;
use crate::record::{Record, RecordFlags};
use crate::DecodeError;

/// Number of CPUs with correlation state.
pub const MAX_CPUS: usize = 64;
/// Default bound of the record queue.
pub const MAX_RECORDS: usize = 10_000;

/// Something unexpected in the event stream. The event still produces a flagged record.
///
/// Formatted through [`DecodeError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Anomaly {
    InvalidCpu(u32),
    Desynchronized { cpu: u32, slot: SlotKind },
}

impl From<Anomaly> for DecodeError {
    fn from(anomaly: Anomaly) -> Self {
        match anomaly {
            Anomaly::InvalidCpu(cpu) => Self::InvalidCpu(cpu),
            Anomaly::Desynchronized { cpu, slot } => Self::Desynchronized { cpu, slot },
        }
    }
}

/// What feeding one event did to the queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// A ready record was appended.
    Enqueued,
    /// A pending record was opened.
    Pending,
    /// A pending record was completed.
    Completed,
    /// A lost events marker forced this many pending records, and was appended itself.
    Flushed(usize),
    /// A flagged ready record was appended.
    Anomaly(Anomaly),
}

/// Result of feeding one event.
#[derive(Debug)]
pub struct Feed {
    pub outcome: Outcome,
    /// The oldest record, forced and pushed out because the queue was full.
    pub evicted: Option<Record>,
}

impl SlotKind {
    fn flag(self) -> RecordFlags {
        match self {
            Self::Sample => RecordFlags::SAMPLE,
            Self::Handler => RecordFlags::HANDLER,
            Self::Generic => RecordFlags::INTERVAL,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
struct CpuState {
    /// Sequence numbers of the open records.
    slots: [Option<u64>; SlotKind::COUNT],
    last_timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct Correlator {
    queue: VecDeque<Record>,
    /// Sequence number of the queue head.
    head_seq: u64,
    cpus: Vec<CpuState>,
    max_records: usize,
    raw_passthrough: bool,
    /// Head pushed out by the last push, handed back by `feed`.
    evicted: Option<Record>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(MAX_RECORDS)
    }
}

impl Correlator {
    /// A `max_records` of zero is treated as one.
    pub fn new(max_records: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            head_seq: 0,
            cpus: vec![CpuState::default(); MAX_CPUS],
            max_records: max_records.max(1),
            raw_passthrough: false,
            evicted: None,
        }
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    /// Queued records, pending or ready.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of open slots across all CPUs.
    pub fn pending(&self) -> usize {
        self.cpus
            .iter()
            .flat_map(|cpu| cpu.slots.iter())
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn front(&self) -> Option<&Record> {
        self.queue.front()
    }

    pub fn raw_passthrough(&self) -> bool {
        self.raw_passthrough
    }

    /// Copies every event into its own ready record. Returns the previous setting.
    pub fn set_raw_passthrough(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.raw_passthrough, enabled)
    }

    /// Drops every queued record and all slot state.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.head_seq = 0;
        self.cpus.fill(CpuState::default());
        self.evicted = None;
    }

    /// Correlates one event.
    ///
    /// The queue never holds more than `max_records` records. When a push would exceed the bound,
    /// the head is forced and returned in [`Feed::evicted`].
    pub fn feed(&mut self, event: &KEvent, consumed_bytes: u64) -> Result<Feed, DecodeError> {
        let outcome = self.correlate(event, consumed_bytes);
        let evicted = self.evicted.take();
        Ok(Feed {
            outcome: outcome?,
            evicted,
        })
    }

    fn correlate(&mut self, event: &KEvent, consumed_bytes: u64) -> Result<Outcome, DecodeError> {
        if self.raw_passthrough {
            self.push_ready(Record::from_event(event, RecordFlags::RAW, consumed_bytes)?);
            return Ok(Outcome::Enqueued);
        }

        let cpu = event.cpu_id as usize;
        if cpu >= MAX_CPUS {
            let anomaly = Anomaly::InvalidCpu(event.cpu_id);
            tracing::warn!(debug_id = %event.debug_id, "{}", DecodeError::from(anomaly));
            self.push_ready(Record::from_event(
                event,
                RecordFlags::INVALID_CPU,
                consumed_bytes,
            )?);
            return Ok(Outcome::Anomaly(anomaly));
        }

        let classification = event.debug_id.classify();
        if classification == Classification::LostEvents {
            let forced = SlotKind::ALL
                .into_iter()
                .filter(|&kind| self.force_slot(cpu, kind))
                .count();
            tracing::warn!(cpu, forced, "kernel lost events");
            let mut record = Record::from_event(event, RecordFlags::LOST_EVENTS, consumed_bytes)?;
            record.timestamp = self.cpus[cpu].last_timestamp;
            self.push_ready(record);
            return Ok(Outcome::Flushed(forced));
        }
        if classification != Classification::ThreadName {
            self.cpus[cpu].last_timestamp = event.timestamp;
        }

        match classification {
            Classification::Start(kind) => {
                if self.cpus[cpu].slots[kind as usize].is_some() {
                    let anomaly = Anomaly::Desynchronized {
                        cpu: event.cpu_id,
                        slot: kind,
                    };
                    tracing::warn!(debug_id = %event.debug_id, "{}", DecodeError::from(anomaly));
                    self.push_ready(Record::from_event(
                        event,
                        kind.flag() | RecordFlags::DESYNCHRONIZED,
                        consumed_bytes,
                    )?);
                    return Ok(Outcome::Anomaly(anomaly));
                }
                let mut record = Record::from_event(event, kind.flag(), consumed_bytes)?;
                if kind == SlotKind::Sample {
                    record
                        .payload
                        .set_sample_args(event.args[1] as u32, event.args[2] as u32);
                }
                let seq = self.push(record);
                self.cpus[cpu].slots[kind as usize] = Some(seq);
                Ok(Outcome::Pending)
            }
            Classification::End(kind) => {
                let open = self.cpus[cpu].slots[kind as usize].take();
                match open.and_then(|seq| self.get_mut(seq)) {
                    Some(record) => {
                        record.payload.set_event(event);
                        record.flags |= RecordFlags::COMPLETE;
                        record.complete();
                        Ok(Outcome::Completed)
                    }
                    None => {
                        tracing::debug!(cpu, debug_id = %event.debug_id, "end without start");
                        self.push_ready(Record::from_event(
                            event,
                            kind.flag() | RecordFlags::UNMATCHED_END,
                            consumed_bytes,
                        )?);
                        Ok(Outcome::Enqueued)
                    }
                }
            }
            Classification::ThreadName => {
                let mut record =
                    Record::from_event(event, RecordFlags::THREAD_NAME, consumed_bytes)?;
                record.payload.set_task_name(&event.args);
                self.push_ready(record);
                Ok(Outcome::Enqueued)
            }
            Classification::Standalone | Classification::LostEvents => {
                self.push_ready(Record::from_event(event, RecordFlags::KEVENT, consumed_bytes)?);
                Ok(Outcome::Enqueued)
            }
        }
    }

    /// Dequeues the head record if it is ready.
    ///
    /// A pending head is forced once the queue holds `max_records` records.
    pub fn next_ready(&mut self) -> Option<Record> {
        let head = self.queue.front()?;
        if !head.is_ready() {
            if self.queue.len() < self.max_records {
                return None;
            }
            self.force_head();
        }
        self.pop_head()
    }

    /// Forces every open record on every CPU. Returns how many were forced.
    pub fn flush(&mut self) -> usize {
        let mut forced = 0;
        for cpu in 0..MAX_CPUS {
            for kind in SlotKind::ALL {
                forced += usize::from(self.force_slot(cpu, kind));
            }
        }
        if forced > 0 {
            tracing::debug!(forced, "flushed open records");
        }
        forced
    }

    fn force_slot(&mut self, cpu: usize, kind: SlotKind) -> bool {
        let open = self.cpus[cpu].slots[kind as usize].take();
        match open.and_then(|seq| self.get_mut(seq)) {
            Some(record) => {
                record.force();
                true
            }
            None => false,
        }
    }

    /// Forces the head and releases the slot that refers to it.
    fn force_head(&mut self) {
        let seq = self.head_seq;
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        head.force();
        let cpu = head.cpu_id as usize;
        tracing::debug!(cpu, queued = self.queue.len(), "queue full, forcing head");
        if let Some(slot) = self
            .cpus
            .get_mut(cpu)
            .and_then(|state| state.slots.iter_mut().find(|slot| **slot == Some(seq)))
        {
            *slot = None;
        }
    }

    fn pop_head(&mut self) -> Option<Record> {
        let record = self.queue.pop_front()?;
        self.head_seq += 1;
        Some(record)
    }

    fn get_mut(&mut self, seq: u64) -> Option<&mut Record> {
        let index = usize::try_from(seq.checked_sub(self.head_seq)?).ok()?;
        self.queue.get_mut(index)
    }

    fn push(&mut self, record: Record) -> u64 {
        if self.queue.len() >= self.max_records {
            self.force_head();
            self.evicted = self.pop_head();
        }
        let seq = self.head_seq + self.queue.len() as u64;
        self.queue.push_back(record);
        seq
    }

    fn push_ready(&mut self, mut record: Record) {
        record.complete();
        self.push(record);
    }
}
