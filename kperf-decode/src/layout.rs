//! On-disk structures of a RAW kdebug file and their normalization.
//!
//! A RAW file is laid out as
//!
//! `| header | thread map | padding to 4096 | events |`
//!
//! The header comes in two versions. Version 1 always describes 64-bit data, version 2 carries a
//! flag selecting between the 32-bit and the 64-bit layout of the thread map and of the events.
//! [`EventLayout`] is resolved once from the header and is the only thing that knows how wide the
//! fields are; everything downstream works on [`KEvent`].

use crate::kdebug::DebugId;
use crate::threadmap::{Owner, ThreadMapEntry};

pub const RAW_VERSION1: u32 = 0x55aa_0101;
pub const RAW_VERSION2: u32 = 0x55aa_0200;

pub const HEADER_V1_SIZE: usize = 0x18;
pub const HEADER_V2_SIZE: usize = 0x120;

pub const THREAD_ENTRY_32_SIZE: usize = 0x1c;
pub const THREAD_ENTRY_64_SIZE: usize = 0x20;
pub const EVENT_32_SIZE: usize = 0x20;
pub const EVENT_64_SIZE: usize = 0x40;

pub const COMMAND_LEN: usize = 20;

pub const PAGE_SIZE: usize = 4096;

pub const TIMESTAMP_MASK: u64 = 0x00ff_ffff_ffff_ffff;
pub const CPU_MASK: u64 = 0xff00_0000_0000_0000;
pub const CPU_SHIFT: u32 = 56;

const V2_FLAG_64BIT: u32 = 0x1;

#[inline]
pub fn page_align(size: usize) -> usize {
    (size + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

/// Splits a raw timestamp word into `(timestamp, cpu_id)`.
#[inline]
pub fn split_timestamp(raw: u64) -> (u64, u32) {
    (raw & TIMESTAMP_MASK, ((raw & CPU_MASK) >> CPU_SHIFT) as u32)
}

/// Width of the thread map entries and events that follow a header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventLayout {
    Bits32,
    Bits64,
}

impl EventLayout {
    pub fn event_size(&self) -> usize {
        match self {
            Self::Bits32 => EVENT_32_SIZE,
            Self::Bits64 => EVENT_64_SIZE,
        }
    }

    pub fn thread_entry_size(&self) -> usize {
        match self {
            Self::Bits32 => THREAD_ENTRY_32_SIZE,
            Self::Bits64 => THREAD_ENTRY_64_SIZE,
        }
    }

    fn varfmt(&self) -> fn(&[u8]) -> Result<(u64, &[u8]), Error> {
        match self {
            Self::Bits32 => parse_le32,
            Self::Bits64 => parse_le64,
        }
    }

    /// Decodes one event.
    ///
    /// # Format
    ///
    /// 32-bit: `| timestamp: le64 | arg1..arg4: le32 | thread: le32 | debugid: le32 |`
    ///
    /// 64-bit: `| timestamp: le64 | arg1..arg4: le64 | thread: le64 | debugid: le32 |
    /// cpuid: le32 | unused: le64 |`
    ///
    /// The 64-bit `cpuid` word is not consulted: the CPU always comes from the top byte of the
    /// timestamp.
    pub fn decode_event(&self, bytes: &[u8]) -> Result<KEvent, Error> {
        let bytes = bytes.get(..self.event_size()).ok_or(Error::NotEnoughBytes {
            needed: self.event_size(),
            got: bytes.len(),
        })?;
        let varfmt = self.varfmt();
        let (raw_timestamp, rest) = parse_le64(bytes)?;
        let mut args = [0u64; 4];
        let mut rest = rest;
        for arg in args.iter_mut() {
            let (value, next) = varfmt(rest)?;
            *arg = value;
            rest = next;
        }
        let (thread_id, rest) = varfmt(rest)?;
        let (debug_id, _) = parse_le32(rest)?;
        let (timestamp, cpu_id) = split_timestamp(raw_timestamp);
        Ok(KEvent {
            timestamp,
            cpu_id,
            debug_id: DebugId::from_raw(debug_id as u32),
            args,
            thread_id,
        })
    }

    /// Decodes one thread map entry.
    ///
    /// # Format
    ///
    /// `| thread: le32 or le64 | valid: le32 | command: [u8; 20] |`
    pub fn decode_thread_entry(&self, bytes: &[u8]) -> Result<ThreadMapEntry, Error> {
        let bytes = bytes
            .get(..self.thread_entry_size())
            .ok_or(Error::NotEnoughBytes {
                needed: self.thread_entry_size(),
                got: bytes.len(),
            })?;
        let (thread_id, rest) = self.varfmt()(bytes)?;
        let (valid, rest) = parse_le32(rest)?;
        let mut command = [0u8; COMMAND_LEN];
        command.copy_from_slice(&rest[..COMMAND_LEN]);
        Ok(ThreadMapEntry {
            thread_id,
            owner: Owner::from(valid as u32 as i32),
            command,
        })
    }
}

/// Header of a version 1 RAW file.
///
/// # Format
///
/// `| version: le32 | thread_count: le32 | tod_secs: le64 | tod_usecs: le32 | pad: 4 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeaderV1 {
    pub thread_count: i32,
    pub seconds: u64,
    pub microseconds: u32,
}

/// Header of a version 2 RAW file.
///
/// # Format
///
/// `| version: le32 | thread_count: le32 | tod_secs: le64 | tod_usecs: le32 | flags: le32 |
/// frequency: le64 | reserved: [u8; 0x100] |`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeaderV2 {
    pub thread_count: i32,
    pub seconds: u64,
    pub microseconds: u32,
    pub flags: u32,
    pub frequency: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RawHeader {
    V1(HeaderV1),
    V2(HeaderV2),
}

impl RawHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let (version, rest) = parse_le32(bytes)?;
        let version = version as u32;
        let size = match version {
            RAW_VERSION1 => HEADER_V1_SIZE,
            RAW_VERSION2 => HEADER_V2_SIZE,
            n => return Err(Error::UnknownVersion(n)),
        };
        if bytes.len() < size {
            return Err(Error::NotEnoughBytes {
                needed: size,
                got: bytes.len(),
            });
        }
        let (thread_count, rest) = parse_le32(rest)?;
        let (seconds, rest) = parse_le64(rest)?;
        let (microseconds, rest) = parse_le32(rest)?;
        let thread_count = thread_count as u32 as i32;
        let microseconds = microseconds as u32;
        if version == RAW_VERSION1 {
            return Ok(Self::V1(HeaderV1 {
                thread_count,
                seconds,
                microseconds,
            }));
        }
        let (flags, rest) = parse_le32(rest)?;
        let (frequency, _) = parse_le64(rest)?;
        Ok(Self::V2(HeaderV2 {
            thread_count,
            seconds,
            microseconds,
            flags: flags as u32,
            frequency,
        }))
    }

    pub fn version(&self) -> u32 {
        match self {
            Self::V1(_) => RAW_VERSION1,
            Self::V2(_) => RAW_VERSION2,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::V1(_) => HEADER_V1_SIZE,
            Self::V2(_) => HEADER_V2_SIZE,
        }
    }

    pub fn layout(&self) -> EventLayout {
        match self {
            Self::V1(_) => EventLayout::Bits64,
            Self::V2(header) if header.flags & V2_FLAG_64BIT == V2_FLAG_64BIT => {
                EventLayout::Bits64
            }
            Self::V2(_) => EventLayout::Bits32,
        }
    }

    pub fn thread_count(&self) -> i32 {
        match self {
            Self::V1(header) => header.thread_count,
            Self::V2(header) => header.thread_count,
        }
    }

    /// Wall clock reference as `(seconds, microseconds)`.
    pub fn time_of_day(&self) -> (u64, u32) {
        match self {
            Self::V1(header) => (header.seconds, header.microseconds),
            Self::V2(header) => (header.seconds, header.microseconds),
        }
    }

    /// Timestamp counter frequency, only recorded by version 2.
    pub fn frequency(&self) -> Option<u64> {
        match self {
            Self::V1(_) => None,
            Self::V2(header) => Some(header.frequency),
        }
    }
}

/// A trace event normalized from either layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct KEvent {
    pub timestamp: u64,
    pub cpu_id: u32,
    pub debug_id: DebugId,
    pub args: [u64; 4],
    pub thread_id: u64,
}

impl KEvent {
    /// Builds the event announcing a thread map entry.
    ///
    /// The command is spread over the first three arguments, little-endian, with the last four
    /// bytes zero-padded into `arg3`.
    pub fn from_thread_entry(entry: &ThreadMapEntry) -> Self {
        let mut padded = [0u8; 24];
        padded[..COMMAND_LEN].copy_from_slice(&entry.command);
        let mut args = [0u64; 4];
        for (arg, chunk) in args.iter_mut().zip(padded.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *arg = u64::from_le_bytes(word);
        }
        Self {
            timestamp: 0,
            cpu_id: 0,
            debug_id: crate::kdebug::THREAD_NAME,
            args,
            thread_id: entry.thread_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("layout needs {needed} bytes but only {got} are available")]
    NotEnoughBytes { needed: usize, got: usize },

    #[error("unrecognized RAW version: {0:#010x}")]
    UnknownVersion(u32),
}

macro_rules! generate_parse_func {
    ($name:ident,$ty:ty,$impl:expr) => {
        pub fn $name(bytes: &[u8]) -> Result<(u64, &[u8]), Error> {
            let mut buffer = [0u8; ::std::mem::size_of::<$ty>()];
            if bytes.len() < ::std::mem::size_of::<$ty>() {
                return Err(Error::NotEnoughBytes {
                    needed: ::std::mem::size_of::<$ty>(),
                    got: bytes.len(),
                });
            }
            let (left, right) = bytes.split_at(::std::mem::size_of::<$ty>());
            buffer.as_mut_slice().copy_from_slice(left);
            Ok(($impl(buffer) as _, right))
        }
    };
}

generate_parse_func!(parse_le32, u32, u32::from_le_bytes);
generate_parse_func!(parse_le64, u64, u64::from_le_bytes);
