//! Debug id packing and the classification used by the correlator.
//!
//! A debug id is laid out as
//!
//! `| class: 8 | subclass: 8 | code: 14 | func: 2 |`
//!
//! where `func` is the function qualifier marking the start or end of an interval.

use std::fmt;

/// Kernel tracing class (`DBG_TRACE`).
pub const DBG_TRACE: u8 = 7;
/// kperf class (`DBG_PERF`).
pub const DBG_PERF: u8 = 37;

/// Thread name announcement. Also synthesized from every valid thread map entry.
pub const THREAD_NAME: DebugId = DebugId::new(DBG_TRACE, 1, 2, 0);
/// The kernel dropped events for the CPU this event was recorded on.
pub const LOST_EVENTS: DebugId = DebugId::new(DBG_TRACE, 2, 2, 0);

/// kperf sampling action bracket.
pub const PERF_SAMPLE: DebugId = DebugId::new(DBG_PERF, 0, 0, 0);
/// kperf timer handler bracket.
pub const PERF_TIMER_HANDLER: DebugId = DebugId::new(DBG_PERF, 3, 2, 0);
/// kperf AST handler bracket.
pub const PERF_AST_HANDLER: DebugId = DebugId::new(DBG_PERF, 5, 0, 0);
/// kperf PMC interrupt handler bracket.
pub const PERF_PMC_HANDLER: DebugId = DebugId::new(DBG_PERF, 6, 0, 0);

/// The two low bits of a debug id.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FuncQualifier {
    None = 0,
    Start = 1,
    End = 2,
    Reserved = 3,
}

impl From<u32> for FuncQualifier {
    #[inline]
    fn from(value: u32) -> Self {
        match value & 0b11 {
            0 => Self::None,
            1 => Self::Start,
            2 => Self::End,
            _ => Self::Reserved,
        }
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DebugId(u32);

impl DebugId {
    pub const fn new(class: u8, subclass: u8, code: u16, func: u8) -> Self {
        Self(
            (class as u32) << 24
                | (subclass as u32) << 16
                | ((code as u32) & 0x3fff) << 2
                | (func as u32 & 0b11),
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn class(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub const fn subclass(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn code(&self) -> u16 {
        ((self.0 >> 2) & 0x3fff) as u16
    }

    pub fn func(&self) -> FuncQualifier {
        FuncQualifier::from(self.0)
    }

    /// The debug id with the function qualifier masked off.
    pub const fn event_id(&self) -> Self {
        Self(self.0 & !0b11)
    }

    /// Returns the same event with `func` as its function qualifier.
    pub const fn with_func(&self, func: FuncQualifier) -> Self {
        Self((self.0 & !0b11) | func as u32)
    }

    pub fn classify(&self) -> Classification {
        let id = self.event_id();
        if id == THREAD_NAME {
            return Classification::ThreadName;
        }
        if id == LOST_EVENTS {
            return Classification::LostEvents;
        }
        if self.class() != DBG_PERF {
            return Classification::Standalone;
        }
        let slot = if id == PERF_SAMPLE {
            SlotKind::Sample
        } else if id == PERF_TIMER_HANDLER || id == PERF_AST_HANDLER || id == PERF_PMC_HANDLER {
            SlotKind::Handler
        } else {
            SlotKind::Generic
        };
        match self.func() {
            FuncQualifier::Start => Classification::Start(slot),
            FuncQualifier::End => Classification::End(slot),
            _ => Classification::Standalone,
        }
    }
}

impl From<u32> for DebugId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DebugId({:#010x} = {}/{}/{}/{:?})",
            self.0,
            self.class(),
            self.subclass(),
            self.code(),
            self.func()
        )
    }
}

impl fmt::Display for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Per-CPU pending slot a start event opens and its end event closes.
#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    /// A kperf sampling action.
    Sample = 0,
    /// A kperf timer, AST or PMC handler.
    Handler = 1,
    /// Any other kperf start/end pair.
    Generic = 2,
}

impl SlotKind {
    pub const COUNT: usize = 3;
    pub const ALL: [SlotKind; Self::COUNT] = [Self::Sample, Self::Handler, Self::Generic];
}

/// How the correlator treats an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Classification {
    ThreadName,
    LostEvents,
    Start(SlotKind),
    End(SlotKind),
    Standalone,
}
