//! Walks a RAW buffer from its header through the thread map to the events.

use crate::layout::{self, page_align, EventLayout, KEvent, RawHeader, HEADER_V2_SIZE};
use crate::threadmap::{ThreadMap, ThreadMapIter};

/// Decoding phase of an attached buffer. Only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    HeaderPending,
    Decoding32,
    Decoding64,
}

impl From<EventLayout> for Phase {
    fn from(layout: EventLayout) -> Self {
        match layout {
            EventLayout::Bits32 => Self::Decoding32,
            EventLayout::Bits64 => Self::Decoding64,
        }
    }
}

/// Produces one [`KEvent`] at a time from a borrowed buffer.
///
/// Thread map entries come out first as thread name events, then the events of the event region.
/// The cursor keeps no correlation state.
#[derive(Debug, Clone)]
pub struct EventCursor<'b> {
    buffer: &'b [u8],
    phase: Phase,
    header: Option<RawHeader>,
    threads: Option<ThreadMapIter<'b>>,
    thread_map: ThreadMap,
    /// Offset of the next event, `None` once the event region is exhausted.
    next_event: Option<usize>,
    rejected_version: Option<u32>,
}

impl<'b> EventCursor<'b> {
    pub fn new(buffer: &'b [u8]) -> Self {
        Self {
            buffer,
            phase: Phase::HeaderPending,
            header: None,
            threads: None,
            thread_map: ThreadMap::new(),
            next_event: None,
            rejected_version: None,
        }
    }

    pub fn buffer(&self) -> &'b [u8] {
        self.buffer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn header(&self) -> Option<&RawHeader> {
        self.header.as_ref()
    }

    pub fn layout(&self) -> Option<EventLayout> {
        self.header.as_ref().map(RawHeader::layout)
    }

    /// Valid thread map entries consumed so far.
    pub fn thread_map(&self) -> &ThreadMap {
        &self.thread_map
    }

    /// Offset of the next event to be read from the event region.
    pub fn position(&self) -> Option<usize> {
        self.next_event
    }

    /// Returns the next event, or `None` at the end of the buffer.
    ///
    /// A buffer whose header cannot be decoded keeps returning `None` without being read past its
    /// version tag.
    pub fn next_event(&mut self) -> Option<KEvent> {
        let layout = match self.phase {
            Phase::HeaderPending => self.decode_header()?,
            Phase::Decoding32 => EventLayout::Bits32,
            Phase::Decoding64 => EventLayout::Bits64,
        };

        if let Some(threads) = self.threads.as_mut() {
            for entry in threads.by_ref() {
                if entry.is_valid() {
                    self.thread_map.insert(entry);
                    return Some(KEvent::from_thread_entry(&entry));
                }
            }
            tracing::debug!(threads = self.thread_map.len(), "thread map decoded");
            self.threads = None;
        }

        let offset = self.next_event?;
        let size = layout.event_size();
        let event = match self
            .buffer
            .get(offset..)
            .ok_or(layout::Error::NotEnoughBytes {
                needed: size,
                got: 0,
            })
            .and_then(|bytes| layout.decode_event(bytes))
        {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(offset, "malformed event: {err}");
                self.next_event = None;
                return None;
            }
        };

        let next = offset + size;
        self.next_event = match self.buffer.len().checked_sub(size) {
            Some(last) if next <= last => Some(next),
            _ => None,
        };
        tracing::trace!(offset, debug_id = %event.debug_id, cpu = event.cpu_id, "kevent");
        Some(event)
    }

    fn decode_header(&mut self) -> Option<EventLayout> {
        if self.rejected_version.is_some() || self.buffer.len() < HEADER_V2_SIZE {
            return None;
        }
        let header = match RawHeader::parse(self.buffer) {
            Ok(header) => header,
            Err(layout::Error::UnknownVersion(version)) => {
                tracing::warn!("unrecognized RAW version {version:#010x}, buffer will not be decoded");
                self.rejected_version = Some(version);
                return None;
            }
            Err(err) => {
                tracing::warn!("malformed RAW header: {err}");
                return None;
            }
        };

        let layout = header.layout();
        let thread_count = match usize::try_from(header.thread_count()) {
            Ok(count) => count,
            Err(_) => {
                tracing::warn!(
                    thread_count = header.thread_count(),
                    "negative thread count, ignoring thread map"
                );
                0
            }
        };
        let thread_map_size = layout.thread_entry_size().saturating_mul(thread_count);
        let events_offset = page_align(header.size().saturating_add(thread_map_size));

        self.next_event = match events_offset.checked_add(layout.event_size()) {
            Some(end) if end <= self.buffer.len() => Some(events_offset),
            _ => None,
        };
        self.threads = Some(ThreadMapIter::new(
            self.buffer,
            header.size(),
            thread_count,
            layout,
        ));
        self.header = Some(header);
        self.phase = Phase::from(layout);

        tracing::debug!(
            version = format_args!("{:#010x}", header.version()),
            ?layout,
            thread_count,
            events_offset,
            "RAW header decoded"
        );
        Some(layout)
    }

    /// Whether an unrecognized version tag stalled this buffer.
    pub fn rejected_version(&self) -> Option<u32> {
        self.rejected_version
    }
}
