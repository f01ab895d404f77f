//! Per-stream bookkeeping for in-flight field sections.
//!
//! Every call to `Encoder::encode` opens a section on the target stream. The
//! section records which dynamic entries it referenced (by absolute index,
//! never by ownership) and whether it put the stream at risk of blocking.
//! Sections leave the queue strictly FIFO, through acknowledgement or stream
//! cancellation, releasing their references exactly once.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::dynamic_table::DynamicTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionState {
    Pending,
    Acknowledged,
    Cancelled,
}

/// One encoded field section awaiting peer acknowledgement.
#[derive(Debug)]
pub struct SectionInfo {
    required_insert_count: u64,
    referenced: SmallVec<[u64; 8]>,
    blocking: bool,
    state: SectionState,
}

impl SectionInfo {
    pub fn new() -> Self {
        Self {
            required_insert_count: 0,
            referenced: SmallVec::new(),
            blocking: false,
            state: SectionState::Pending,
        }
    }

    pub fn required_insert_count(&self) -> u64 {
        self.required_insert_count
    }

    pub(crate) fn set_required_insert_count(&mut self, count: u64) {
        self.required_insert_count = count;
    }

    /// Record a reference to the dynamic entry at `index`, bumping its
    /// table-side reference count.
    pub(crate) fn reference(&mut self, index: u64, table: &mut DynamicTable) {
        table.reference(index);
        self.referenced.push(index);
    }

    /// Mark this section as one the decoder may have to wait for.
    pub(crate) fn block(&mut self) {
        self.blocking = true;
    }

    pub(crate) fn unblock(&mut self) {
        self.blocking = false;
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Highest referenced absolute index, 0 when nothing dynamic was used.
    pub(crate) fn max_referenced(&self) -> u64 {
        self.referenced.iter().copied().max().unwrap_or(0)
    }

    /// Drop all entry references. Safe to call once per terminal state;
    /// later calls are no-ops.
    pub(crate) fn release(&mut self, terminal: Terminal, table: &mut DynamicTable) {
        if self.state != SectionState::Pending {
            return;
        }
        self.state = match terminal {
            Terminal::Acknowledged => SectionState::Acknowledged,
            Terminal::Cancelled => SectionState::Cancelled,
        };
        self.blocking = false;
        for index in self.referenced.drain(..) {
            table.release(index);
        }
    }
}

impl Default for SectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// How a section left the queue.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Terminal {
    Acknowledged,
    Cancelled,
}

/// All outstanding sections of one stream, oldest first.
#[derive(Debug)]
pub struct StreamInfo {
    stream_id: u64,
    sections: VecDeque<SectionInfo>,
}

impl StreamInfo {
    pub fn new(stream_id: u64) -> Self {
        Self {
            stream_id,
            sections: VecDeque::new(),
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub(crate) fn push_section(&mut self, section: SectionInfo) {
        self.sections.push_back(section);
    }

    /// The section currently being encoded (always the newest).
    pub(crate) fn current_section(&mut self) -> &mut SectionInfo {
        self.sections
            .back_mut()
            .expect("current_section called outside an encode")
    }

    /// Pop the oldest section; acknowledgements must arrive in FIFO order.
    pub(crate) fn acknowledge(&mut self) -> Option<SectionInfo> {
        self.sections.pop_front()
    }

    pub(crate) fn sections_mut(&mut self) -> impl Iterator<Item = &mut SectionInfo> {
        self.sections.iter_mut()
    }

    /// A stream is blocked while any of its sections is blocking.
    pub fn is_blocked(&self) -> bool {
        self.sections.iter().any(SectionInfo::is_blocking)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::HeaderField;

    #[test]
    fn sections_acknowledge_fifo() {
        let mut stream = StreamInfo::new(0);
        let mut first = SectionInfo::new();
        first.set_required_insert_count(1);
        let mut second = SectionInfo::new();
        second.set_required_insert_count(2);
        stream.push_section(first);
        stream.push_section(second);

        assert_eq!(stream.acknowledge().unwrap().required_insert_count(), 1);
        assert_eq!(stream.acknowledge().unwrap().required_insert_count(), 2);
        assert!(stream.acknowledge().is_none());
    }

    #[test]
    fn release_drops_references_once() {
        let mut table = DynamicTable::new();
        table.set_capacity(1024).unwrap();
        let index = table.add(HeaderField::new("a", "1")).unwrap();

        let mut section = SectionInfo::new();
        section.reference(index, &mut table);
        section.block();
        assert!(table.get(index).unwrap().is_referenced());

        section.release(Terminal::Acknowledged, &mut table);
        assert!(!table.get(index).unwrap().is_referenced());
        assert!(!section.is_blocking());

        // A second release must not underflow the table's count.
        section.release(Terminal::Cancelled, &mut table);
        assert!(!table.get(index).unwrap().is_referenced());
    }

    #[test]
    fn blocked_while_any_section_blocking() {
        let mut stream = StreamInfo::new(4);
        stream.push_section(SectionInfo::new());
        assert!(!stream.is_blocked());
        stream.current_section().block();
        assert!(stream.is_blocked());
    }
}
