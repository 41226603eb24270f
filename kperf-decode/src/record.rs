//! Records handed to the caller.
//!
//! A [`Record`] carries the fields every consumer needs (timestamp, CPU, thread and a
//! classification in [`RecordFlags`]) plus a fixed-size [`Payload`] that mirrors the sample record
//! of kperf tooling. Only a handful of payload blocks are written by the decoder; the rest are
//! preserved as zeroed reserved bytes for consumers that interpret sub-payloads themselves.

use std::fmt;

use crate::kdebug::DebugId;
use crate::layout::{KEvent, COMMAND_LEN};
use crate::DecodeError;

bitflags::bitflags! {
    /// Classification and completion state of a record.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u64 {
        /// One event copied through without correlation.
        const RAW = 1 << 0;
        /// Thread name announcement.
        const THREAD_NAME = 1 << 1;
        /// kperf sampling action.
        const SAMPLE = 1 << 2;
        /// kperf handler interval.
        const HANDLER = 1 << 3;
        /// Any other correlated kperf interval.
        const INTERVAL = 1 << 4;
        /// An event without a start/end pairing.
        const KEVENT = 1 << 5;
        /// The kernel dropped events on this record's CPU.
        const LOST_EVENTS = 1 << 6;
        /// An interval whose end event was merged.
        const COMPLETE = 1 << 7;
        /// An end event without an open interval.
        const UNMATCHED_END = 1 << 8;

        /// A start event arrived while an interval of the same kind was still open.
        const DESYNCHRONIZED = 1 << 61;
        /// The CPU id is outside of the tracked range.
        const INVALID_CPU = 1 << 62;
        /// Completed without its end event, by backpressure, a lost events marker or a flush.
        const FORCED = 1 << 63;
    }
}

/// Offsets of the payload blocks, in bytes from the start of the source record layout.
///
/// [`Payload`] starts at [`offsets::BASE`]; accessors take these absolute offsets.
pub mod offsets {
    pub const BASE: usize = 0x1c;
    pub const END: usize = 0x1498;

    pub const TASK_NAME: usize = 0x1c;
    pub const KD_DEBUGID: usize = 0x30;
    pub const KD_ARGS: usize = 0x38;
    pub const THREAD_INFO: usize = 0x58;
    pub const USER_CALLSTACK: usize = 0x68;
    pub const KERNEL_CALLSTACK: usize = 0x870;
    pub const CALLSTACK_SIZE: usize = 0x808;
    pub const PMC_COUNTERS: usize = 0x1078;
    pub const PMC_COUNTERS_SIZE: usize = 0x108;
    pub const PMC_CONFIG: usize = 0x1180;
    pub const MEMINFO: usize = 0x1190;
    pub const THREAD_SCHEDULING: usize = 0x11b8;
    pub const TASK_SNAPSHOT: usize = 0x11d8;
    pub const THREAD_SNAPSHOT: usize = 0x11f8;
    pub const THREAD_DISPATCH: usize = 0x1210;
    pub const SAMPLE_ACTION_ID: usize = 0x1218;
    pub const SAMPLE_USERDATA: usize = 0x121c;
    pub const CSWITCH: usize = 0x1220;
    pub const EVENT_ID: usize = 0x1248;
    pub const FUNC_QUALIFIER: usize = 0x124c;
}

pub const PAYLOAD_SIZE: usize = offsets::END - offsets::BASE;

/// Fixed-size uninterpreted payload of a record.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Payload(Box<[u8]>);

impl Payload {
    /// Allocates a zeroed payload, reporting allocation failure instead of aborting.
    pub fn try_new() -> Result<Self, DecodeError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(PAYLOAD_SIZE)
            .map_err(|_| DecodeError::OutOfMemory)?;
        bytes.resize(PAYLOAD_SIZE, 0);
        Ok(Self(bytes.into_boxed_slice()))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Bytes of the block at absolute record `offset`.
    pub fn get(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let start = offset.checked_sub(offsets::BASE)?;
        self.0.get(start..start.checked_add(len)?)
    }

    fn get_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let start = offset.checked_sub(offsets::BASE)?;
        self.0.get_mut(start..start.checked_add(len)?)
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.get(offset, 4)?);
        Some(u32::from_le_bytes(word))
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.get(offset, 8)?);
        Some(u64::from_le_bytes(word))
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        if let Some(block) = self.get_mut(offset, bytes.len()) {
            block.copy_from_slice(bytes);
        }
    }

    /// Task name block. Not necessarily NUL terminated.
    pub fn task_name(&self) -> &[u8] {
        self.get(offsets::TASK_NAME, COMMAND_LEN).unwrap_or_default()
    }

    /// Debug id of the last event merged into the record.
    pub fn debug_id(&self) -> DebugId {
        DebugId::from_raw(self.read_u32(offsets::KD_DEBUGID).unwrap_or_default())
    }

    /// Arguments of the last event merged into the record.
    pub fn args(&self) -> [u64; 4] {
        let mut args = [0u64; 4];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = self.read_u64(offsets::KD_ARGS + 8 * i).unwrap_or_default();
        }
        args
    }

    pub fn action_id(&self) -> u32 {
        self.read_u32(offsets::SAMPLE_ACTION_ID).unwrap_or_default()
    }

    pub fn userdata(&self) -> u32 {
        self.read_u32(offsets::SAMPLE_USERDATA).unwrap_or_default()
    }

    pub(crate) fn set_event(&mut self, event: &KEvent) {
        self.write(offsets::KD_DEBUGID, &event.debug_id.raw().to_le_bytes());
        for (i, arg) in event.args.iter().enumerate() {
            self.write(offsets::KD_ARGS + 8 * i, &arg.to_le_bytes());
        }
        self.write(offsets::EVENT_ID, &event.debug_id.event_id().raw().to_le_bytes());
        self.write(
            offsets::FUNC_QUALIFIER,
            &(event.debug_id.func() as u32).to_le_bytes(),
        );
    }

    pub(crate) fn set_task_name(&mut self, args: &[u64; 4]) {
        let mut name = [0u8; 24];
        for (chunk, arg) in name.chunks_exact_mut(8).zip(args) {
            chunk.copy_from_slice(&arg.to_le_bytes());
        }
        self.write(offsets::TASK_NAME, &name[..COMMAND_LEN]);
    }

    pub(crate) fn set_sample_args(&mut self, action_id: u32, userdata: u32) {
        self.write(offsets::SAMPLE_ACTION_ID, &action_id.to_le_bytes());
        self.write(offsets::SAMPLE_USERDATA, &userdata.to_le_bytes());
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("debug_id", &self.debug_id())
            .field("args", &self.args())
            .field("len", &self.0.len())
            .finish()
    }
}

/// A decoded record.
///
/// A record is owned by the correlator until it is ready and dequeued; from then on it belongs to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    pub(crate) flags: RecordFlags,
    pub(crate) timestamp: u64,
    pub(crate) cpu_id: u32,
    pub(crate) thread_id: u64,
    pub(crate) payload: Payload,
    pub(crate) ready: bool,
    pub(crate) consumed_bytes: u64,
}

impl Record {
    /// Starts a record from `event`. The record is not ready.
    pub(crate) fn from_event(
        event: &KEvent,
        flags: RecordFlags,
        consumed_bytes: u64,
    ) -> Result<Self, DecodeError> {
        let mut payload = Payload::try_new()?;
        payload.set_event(event);
        Ok(Self {
            flags,
            timestamp: event.timestamp,
            cpu_id: event.cpu_id,
            thread_id: event.thread_id,
            payload,
            ready: false,
            consumed_bytes,
        })
    }

    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_forced(&self) -> bool {
        self.flags.contains(RecordFlags::FORCED)
    }

    /// `size_of_event * kevents_consumed` at the time the record was started.
    pub fn consumed_bytes(&self) -> u64 {
        self.consumed_bytes
    }

    /// Task name as text, up to the first NUL.
    pub fn task_name(&self) -> String {
        let name = self.payload.task_name();
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        String::from_utf8_lossy(&name[..len]).into_owned()
    }

    pub(crate) fn complete(&mut self) {
        self.ready = true;
    }

    pub(crate) fn force(&mut self) {
        self.flags |= RecordFlags::FORCED;
        self.ready = true;
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>16} cpu={:<3} tid={:#x} debugid={} args={:x?} flags={:?}",
            self.timestamp,
            self.cpu_id,
            self.thread_id,
            self.payload.debug_id(),
            self.payload.args(),
            self.flags,
        )?;
        if self.flags.contains(RecordFlags::THREAD_NAME) {
            write!(f, " name={:?}", self.task_name())?;
        }
        if self.flags.contains(RecordFlags::SAMPLE) {
            write!(f, " action={}", self.payload.action_id())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdebug::DebugId;

    fn event() -> KEvent {
        KEvent {
            timestamp: 99,
            cpu_id: 4,
            debug_id: DebugId::new(37, 0, 0, 1),
            args: [1, 2, 3, 4],
            thread_id: 0x55,
        }
    }

    #[test]
    fn test_payload_size() {
        assert_eq!(PAYLOAD_SIZE, 0x147c);
        let payload = Payload::try_new().unwrap();
        assert_eq!(payload.bytes().len(), PAYLOAD_SIZE);
        assert!(payload.bytes().iter().all(|&b| b == 0));
        assert_eq!(
            payload.get(offsets::KERNEL_CALLSTACK, offsets::CALLSTACK_SIZE).map(<[u8]>::len),
            Some(offsets::CALLSTACK_SIZE)
        );
        assert!(payload.get(offsets::END - 4, 8).is_none());
        assert!(payload.get(0, 4).is_none());
    }

    #[test]
    fn test_event_fields_land_in_kd_buf_block() {
        let record = Record::from_event(&event(), RecordFlags::SAMPLE, 128).unwrap();
        assert!(!record.is_ready());
        assert_eq!(record.timestamp(), 99);
        assert_eq!(record.cpu_id(), 4);
        assert_eq!(record.thread_id(), 0x55);
        assert_eq!(record.consumed_bytes(), 128);
        assert_eq!(record.payload().debug_id(), DebugId::new(37, 0, 0, 1));
        assert_eq!(record.payload().args(), [1, 2, 3, 4]);
        assert_eq!(record.payload().read_u32(offsets::EVENT_ID), Some(0x2500_0000));
        assert_eq!(record.payload().read_u32(offsets::FUNC_QUALIFIER), Some(1));
    }

    #[test]
    fn test_task_name_block() {
        let mut record = Record::from_event(&event(), RecordFlags::THREAD_NAME, 0).unwrap();
        let name = *b"proc\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
        let mut args = [0u64; 4];
        for (arg, chunk) in args.iter_mut().zip(name.chunks_exact(8)) {
            *arg = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        record.payload.set_task_name(&args);
        assert_eq!(&record.payload().bytes()[..8], b"proc\0\0\0\0");
        assert_eq!(record.task_name(), "proc");
    }

    #[test]
    fn test_force_sets_terminal_bit() {
        let mut record = Record::from_event(&event(), RecordFlags::SAMPLE, 0).unwrap();
        record.force();
        assert!(record.is_ready());
        assert!(record.is_forced());
        assert_eq!(record.flags().bits() >> 63, 1);
    }
}
