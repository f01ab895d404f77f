//! QPACK encoder (RFC 9204 Section 4).
//!
//! Serializes field sections, maintains the shared dynamic table, emits
//! encoder-stream instructions through a handler, and consumes the peer's
//! decoder-stream acknowledgements. The encoder tracks which streams it has
//! put at risk of blocking and keeps that number within the peer's
//! `SETTINGS_QPACK_BLOCKED_STREAMS` budget, falling back to literal
//! encodings when the budget is spent.
//!
//! The encoder is not internally synchronized: `encode`, `insert`,
//! `set_capacity` and the decoder-stream callbacks take `&mut self` and the
//! owner serializes them, typically behind a mutex shared with the HTTP/3
//! connection.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::dynamic_table::{DynamicTable, TableEntry};
use crate::error::{
    QpackError, Result, H3_GENERAL_PROTOCOL_ERROR, QPACK_ENCODER_STREAM_ERROR,
};
use crate::field::{Header, HeaderField};
use crate::instructions::{encode_string, fatal_stream_error, DecoderInstruction, Instruction};
use crate::prefix_int;
use crate::stream_info::{SectionInfo, StreamInfo, Terminal};

/// Headers whose values are sensitive enough that the length hiding lost to
/// Huffman coding is not worth it.
pub const DO_NOT_HUFFMAN: &[Header] = &[
    Header::Authorization,
    Header::ContentMd5,
    Header::ProxyAuthenticate,
    Header::ProxyAuthorization,
];

/// Headers whose values are too volatile or sensitive to earn a dynamic
/// table slot.
pub const DO_NOT_INDEX: &[Header] = &[
    Header::Authorization,
    Header::ContentMd5,
    Header::ContentRange,
    Header::ETag,
    Header::IfModifiedSince,
    Header::IfUnmodifiedSince,
    Header::IfNoneMatch,
    Header::IfRange,
    Header::IfMatch,
    Header::Location,
    Header::Range,
    Header::RetryAfter,
    Header::LastModified,
    Header::SetCookie,
    Header::SetCookie2,
];

/// Headers marked with the never-index bit so intermediaries do not index
/// them either (RFC 9204 Section 7.1).
pub const NEVER_INDEX: &[Header] = &[
    Header::Authorization,
    Header::SetCookie,
    Header::SetCookie2,
];

/// Receives batches of encoder-stream instructions for serialization onto
/// the encoder stream, in emission order. Must not reenter the encoder.
pub trait InstructionHandler: Send {
    fn on_instructions(&mut self, instructions: &[Instruction]);
}

impl<F: FnMut(&[Instruction]) + Send> InstructionHandler for F {
    fn on_instructions(&mut self, instructions: &[Instruction]) {
        self(instructions)
    }
}

pub struct Encoder {
    handler: Box<dyn InstructionHandler>,
    table: DynamicTable,
    streams: HashMap<u64, StreamInfo>,
    pending: Vec<Instruction>,
    known_insert_count: u64,
    blocked_streams: usize,
    max_blocked_streams: usize,
}

impl Encoder {
    pub fn new(handler: Box<dyn InstructionHandler>, max_blocked_streams: usize) -> Self {
        Self {
            handler,
            table: DynamicTable::new(),
            streams: HashMap::new(),
            pending: Vec::new(),
            known_insert_count: 0,
            blocked_streams: 0,
            max_blocked_streams,
        }
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Highest insert count the peer has acknowledged.
    pub fn known_insert_count(&self) -> u64 {
        self.known_insert_count
    }

    /// Streams currently at risk of blocking the peer's decoder.
    pub fn blocked_streams(&self) -> usize {
        self.blocked_streams
    }

    /// Streams with unacknowledged sections outstanding.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, stream_id: u64) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Set the dynamic table capacity and tell the remote decoder.
    ///
    /// Fails without side effects when outstanding section references pin
    /// more table space than `capacity` allows.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.table.set_capacity(capacity)?;
        self.pending.push(Instruction::SetCapacity {
            capacity: capacity as u64,
        });
        self.notify_handler();
        Ok(())
    }

    /// Opportunistically insert `field` into the dynamic table, emitting the
    /// cheapest instruction that conveys it.
    ///
    /// Returns `false` without side effects when the field must not be
    /// indexed or the table cannot take it without evicting referenced
    /// entries.
    pub fn insert(&mut self, field: &HeaderField) -> Result<bool> {
        if !Self::should_index(field) || !self.table.can_insert(field) {
            return Ok(false);
        }

        let huffman = Self::should_huffman(field);
        match self.table.find_exact(field.name(), field.value()) {
            // An identical dynamic entry exists: copy it rather than resend
            // its bytes. Referencing on insertion is always safe, the
            // instruction arrives before any eviction of the source.
            Some(TableEntry::Dynamic(index)) => {
                let relative_index = self.table.insert_count() - index;
                self.table.add(field.clone())?;
                self.pending.push(Instruction::Duplicate { relative_index });
            }
            _ => match self.table.find_name(field.name()) {
                Some(entry) => {
                    let (is_static, name_index) = self.instruction_name_index(entry);
                    self.table.add(field.clone())?;
                    self.pending.push(Instruction::InsertWithNameRef {
                        is_static,
                        name_index,
                        value: field.value().to_owned(),
                        huffman,
                    });
                }
                None => {
                    self.table.add(field.clone())?;
                    self.pending.push(Instruction::InsertWithLiteralName {
                        name: field.name().to_owned(),
                        value: field.value().to_owned(),
                        huffman,
                    });
                }
            },
        }

        self.notify_handler();
        Ok(true)
    }

    /// Encode a complete field section for `stream_id` into `buf`: the
    /// insert-count / delta-base prefix followed by one field line per input
    /// field, in order.
    ///
    /// Opens a new section on the stream; the section stays outstanding
    /// until the peer acknowledges it or cancels the stream.
    pub fn encode(
        &mut self,
        buf: &mut BytesMut,
        stream_id: u64,
        fields: &[HeaderField],
    ) -> Result<()> {
        // Verify we can encode without errors before any state changes.
        for field in fields {
            let name = field.name().as_bytes();
            if name.first().map_or(true, |&b| b <= 0x20) {
                return Err(QpackError::stream(
                    H3_GENERAL_PROTOCOL_ERROR,
                    format!("invalid header name: {:?}", field.name()),
                ));
            }
        }

        debug!(stream_id, fields = fields.len(), "encoding field section");

        let mut stream = self
            .streams
            .remove(&stream_id)
            .unwrap_or_else(|| StreamInfo::new(stream_id));
        stream.push_section(SectionInfo::new());

        // Entries inserted while encoding this section land above the base
        // and are referenced post-base.
        let base = self.table.insert_count();

        let mut entries = Vec::with_capacity(fields.len());
        let mut required_insert_count = 0;
        for field in fields {
            let entry = self.encode_field(&mut stream, field)?;
            required_insert_count = required_insert_count.max(entry.required_insert_count());
            entries.push(entry);
        }
        stream
            .current_section()
            .set_required_insert_count(required_insert_count);

        let encoded_insert_count =
            encode_insert_count(required_insert_count, self.table.capacity());
        let sign = base < required_insert_count;
        let delta_base = if sign {
            required_insert_count - base - 1
        } else {
            base - required_insert_count
        };
        trace!(
            required_insert_count,
            base,
            delta_base,
            sign,
            "field section prefix"
        );
        prefix_int::encode(encoded_insert_count, 8, 0x00, buf);
        prefix_int::encode(delta_base, 7, if sign { 0x80 } else { 0x00 }, buf);
        for entry in &entries {
            entry.encode_into(base, buf);
        }

        self.streams.insert(stream_id, stream);
        self.notify_handler();
        Ok(())
    }

    /// Parse decoder-stream bytes, applying every complete instruction.
    ///
    /// Returns the number of bytes consumed; a trailing partial instruction
    /// is left for the caller to re-present with more data. Protocol
    /// violations are connection-fatal.
    pub fn parse_instructions(&mut self, data: &[u8]) -> Result<usize> {
        let mut offset = 0;
        while offset < data.len() {
            match DecoderInstruction::decode(&data[offset..]) {
                Ok((instruction, consumed)) => {
                    offset += consumed;
                    match instruction {
                        DecoderInstruction::SectionAcknowledgement { stream_id } => {
                            self.section_acknowledgement(stream_id)?
                        }
                        DecoderInstruction::StreamCancellation { stream_id } => {
                            self.stream_cancellation(stream_id)?
                        }
                        DecoderInstruction::InsertCountIncrement { increment } => {
                            self.insert_count_increment(increment)?
                        }
                    }
                }
                Err(QpackError::UnexpectedEof) => break,
                Err(err) => return Err(fatal_stream_error(err)),
            }
        }
        self.notify_handler();
        Ok(offset)
    }

    fn section_acknowledgement(&mut self, stream_id: u64) -> Result<()> {
        debug!(stream_id, "section acknowledgement");

        let stream = self.streams.get_mut(&stream_id).ok_or_else(|| {
            QpackError::session(
                QPACK_ENCODER_STREAM_ERROR,
                format!("section acknowledgement for unknown stream {stream_id}"),
            )
        })?;
        let mut section = stream.acknowledge().ok_or_else(|| {
            QpackError::session(
                QPACK_ENCODER_STREAM_ERROR,
                format!("section acknowledgement with no outstanding section on stream {stream_id}"),
            )
        })?;
        let still_blocked = stream.is_blocked();
        let emptied = stream.is_empty();
        let was_counted = section.is_blocking() || still_blocked;

        section.release(Terminal::Acknowledged, &mut self.table);
        // The acknowledged section implies the peer has at least its
        // required insert count.
        self.known_insert_count = self
            .known_insert_count
            .max(section.required_insert_count());

        if emptied {
            self.streams.remove(&stream_id);
        }
        if was_counted && !still_blocked {
            self.blocked_streams = self.blocked_streams.saturating_sub(1);
        }
        self.unblock_sections();
        Ok(())
    }

    fn stream_cancellation(&mut self, stream_id: u64) -> Result<()> {
        debug!(stream_id, "stream cancellation");

        let mut stream = self.streams.remove(&stream_id).ok_or_else(|| {
            QpackError::session(
                QPACK_ENCODER_STREAM_ERROR,
                format!("stream cancellation for unknown stream {stream_id}"),
            )
        })?;
        if stream.is_blocked() {
            self.blocked_streams = self.blocked_streams.saturating_sub(1);
        }
        for section in stream.sections_mut() {
            section.release(Terminal::Cancelled, &mut self.table);
        }
        Ok(())
    }

    fn insert_count_increment(&mut self, increment: u64) -> Result<()> {
        debug!(increment, "insert count increment");

        if self.known_insert_count + increment > self.table.insert_count() {
            return Err(QpackError::session(
                QPACK_ENCODER_STREAM_ERROR,
                "known insert count incremented over insert count",
            ));
        }
        self.known_insert_count += increment;
        self.unblock_sections();
        Ok(())
    }

    /// Clear the blocking mark from every section the peer can now decode,
    /// and release the stream budget of streams that no longer block.
    fn unblock_sections(&mut self) {
        let known = self.known_insert_count;
        for stream in self.streams.values_mut() {
            if !stream.is_blocked() {
                continue;
            }
            for section in stream.sections_mut() {
                if section.is_blocking() && section.max_referenced() <= known {
                    section.unblock();
                }
            }
            if !stream.is_blocked() {
                self.blocked_streams = self.blocked_streams.saturating_sub(1);
            }
        }
    }

    /// Pick the cheapest encoding for one field, in order: an existing
    /// entry, a duplicate of an unreferenceable one, a name reference
    /// (copying into the table when allowed), a fresh literal insertion,
    /// and finally an inline literal with no table interaction.
    fn encode_field(
        &mut self,
        stream: &mut StreamInfo,
        field: &HeaderField,
    ) -> Result<EncodableEntry> {
        if let Some(encoded) = field.encoded() {
            return Ok(EncodableEntry::PreEncoded(encoded.clone()));
        }

        let can_create = Self::should_index(field) && self.table.can_insert(field);
        let huffman = Self::should_huffman(field);
        let never_index = Self::is_never_index(field);

        if let Some(entry) = self.table.find_exact(field.name(), field.value()) {
            if self.reference_entry(entry, stream) {
                return Ok(EncodableEntry::Referenced(entry));
            }
            // The exact match is stuck in the draining zone: duplicate it
            // and try to reference the copy instead.
            if let TableEntry::Dynamic(index) = entry {
                if can_create && self.table.can_insert(field) {
                    let relative_index = self.table.insert_count() - index;
                    let new_index = self.table.add(field.clone())?;
                    self.pending.push(Instruction::Duplicate { relative_index });
                    if self.reference_entry(TableEntry::Dynamic(new_index), stream) {
                        return Ok(EncodableEntry::Referenced(TableEntry::Dynamic(new_index)));
                    }
                }
            }
        }

        if let Some(name_entry) = self.table.find_name(field.name()) {
            if self.reference_entry(name_entry, stream) {
                // The name is in the table; copy the full field in when
                // allowed so later sections can reference it outright.
                if can_create && self.table.can_insert(field) {
                    let (is_static, name_index) = self.instruction_name_index(name_entry);
                    let new_index = self.table.add(field.clone())?;
                    self.pending.push(Instruction::InsertWithNameRef {
                        is_static,
                        name_index,
                        value: field.value().to_owned(),
                        huffman,
                    });
                    if self.reference_entry(TableEntry::Dynamic(new_index), stream) {
                        return Ok(EncodableEntry::Referenced(TableEntry::Dynamic(new_index)));
                    }
                }
                return Ok(EncodableEntry::NameReferenced {
                    name: name_entry,
                    value: field.value().to_owned(),
                    huffman,
                    never_index,
                });
            }
        }

        if can_create && self.table.can_insert(field) {
            let new_index = self.table.add(field.clone())?;
            self.pending.push(Instruction::InsertWithLiteralName {
                name: field.name().to_owned(),
                value: field.value().to_owned(),
                huffman,
            });
            if self.reference_entry(TableEntry::Dynamic(new_index), stream) {
                return Ok(EncodableEntry::Referenced(TableEntry::Dynamic(new_index)));
            }
        }

        Ok(EncodableEntry::Literal {
            name: field.name().to_owned(),
            value: field.value().to_owned(),
            huffman,
            never_index,
        })
    }

    /// Decide whether the current section may reference `entry`, registering
    /// the reference and any blocking risk when it may.
    fn reference_entry(&mut self, entry: TableEntry, stream: &mut StreamInfo) -> bool {
        let index = match entry {
            // Static entries never block and need no tracking.
            TableEntry::Static(_) => return true,
            TableEntry::Dynamic(index) => index,
        };

        if !self.table.can_reference(index) {
            return false;
        }

        let already_blocked = stream.is_blocked();
        let section = stream.current_section();

        // Acknowledged entries are free to reference.
        if self.known_insert_count >= index {
            section.reference(index, &mut self.table);
            return true;
        }

        // This stream already risks blocking; one more section on it costs
        // nothing extra against the budget.
        if already_blocked {
            section.block();
            section.reference(index, &mut self.table);
            return true;
        }

        if self.blocked_streams < self.max_blocked_streams {
            self.blocked_streams += 1;
            section.block();
            section.reference(index, &mut self.table);
            return true;
        }

        trace!(
            index,
            blocked = self.blocked_streams,
            "blocked stream budget spent, refusing reference"
        );
        false
    }

    /// Name index as carried by an Insert With Name Reference instruction:
    /// absolute for the static table, relative to the current insert count
    /// for the dynamic table.
    fn instruction_name_index(&self, entry: TableEntry) -> (bool, u64) {
        match entry {
            TableEntry::Static(index) => (true, index),
            TableEntry::Dynamic(index) => (false, self.table.insert_count() - index),
        }
    }

    fn notify_handler(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        self.handler.on_instructions(&batch);
    }

    fn should_index(field: &HeaderField) -> bool {
        field.header().map_or(true, |h| !DO_NOT_INDEX.contains(&h))
    }

    fn should_huffman(field: &HeaderField) -> bool {
        field.header().map_or(true, |h| !DO_NOT_HUFFMAN.contains(&h))
    }

    fn is_never_index(field: &HeaderField) -> bool {
        field.header().is_some_and(|h| NEVER_INDEX.contains(&h))
    }
}

/// Wrap the required insert count for the section prefix
/// (RFC 9204 Section 4.5.1.1).
fn encode_insert_count(required_insert_count: u64, capacity: usize) -> u64 {
    if required_insert_count == 0 {
        return 0;
    }
    let max_entries = (capacity / 32) as u64;
    debug_assert!(max_entries > 0, "dynamic reference with tiny capacity");
    (required_insert_count % (2 * max_entries)) + 1
}

/// One field line, resolved against the tables and ready to serialize.
#[derive(Debug)]
enum EncodableEntry {
    /// Cached wire form, copied through untouched.
    PreEncoded(Bytes),
    /// Indexed Field Line, relative or post-base depending on the section
    /// base.
    Referenced(TableEntry),
    /// Literal Field Line with a (possibly post-base) name reference.
    NameReferenced {
        name: TableEntry,
        value: String,
        huffman: bool,
        never_index: bool,
    },
    /// Literal Field Line with literal name.
    Literal {
        name: String,
        value: String,
        huffman: bool,
        never_index: bool,
    },
}

impl EncodableEntry {
    /// Smallest insert count the decoder needs before it can interpret this
    /// line.
    fn required_insert_count(&self) -> u64 {
        match self {
            EncodableEntry::Referenced(TableEntry::Dynamic(index)) => *index,
            EncodableEntry::NameReferenced {
                name: TableEntry::Dynamic(index),
                ..
            } => *index,
            _ => 0,
        }
    }

    /// Serialize per RFC 9204 Section 4.5, resolving dynamic indices
    /// against `base`.
    fn encode_into(&self, base: u64, buf: &mut BytesMut) {
        match self {
            EncodableEntry::PreEncoded(bytes) => buf.put_slice(bytes),

            EncodableEntry::Referenced(TableEntry::Static(index)) => {
                // Indexed Field Line, static: 1 1 xxxxxx
                prefix_int::encode(*index, 6, 0xC0, buf);
            }
            EncodableEntry::Referenced(TableEntry::Dynamic(index)) => {
                if *index <= base {
                    // Indexed Field Line, dynamic: 1 0 xxxxxx
                    prefix_int::encode(base - index, 6, 0x80, buf);
                } else {
                    // Indexed Field Line with Post-Base Index: 0001 xxxx
                    prefix_int::encode(index - base - 1, 4, 0x10, buf);
                }
            }

            EncodableEntry::NameReferenced {
                name,
                value,
                huffman,
                never_index,
            } => {
                match name {
                    TableEntry::Static(index) => {
                        // Literal Field Line with Name Reference: 01 N 1 xxxx
                        let mask = 0x50 | if *never_index { 0x20 } else { 0x00 };
                        prefix_int::encode(*index, 4, mask, buf);
                    }
                    TableEntry::Dynamic(index) if *index <= base => {
                        // Literal Field Line with Name Reference: 01 N 0 xxxx
                        let mask = 0x40 | if *never_index { 0x20 } else { 0x00 };
                        prefix_int::encode(base - index, 4, mask, buf);
                    }
                    TableEntry::Dynamic(index) => {
                        // Literal Field Line with Post-Base Name Reference:
                        // 0000 N xxx
                        let mask = if *never_index { 0x08 } else { 0x00 };
                        prefix_int::encode(index - base - 1, 3, mask, buf);
                    }
                }
                encode_string(value.as_bytes(), *huffman, 7, 0x00, buf);
            }

            EncodableEntry::Literal {
                name,
                value,
                huffman,
                never_index,
            } => {
                // Literal Field Line with Literal Name: 001 N H xxx
                let mask = 0x20 | if *never_index { 0x10 } else { 0x00 };
                encode_string(name.as_bytes(), *huffman, 3, mask, buf);
                encode_string(value.as_bytes(), *huffman, 7, 0x00, buf);
            }
        }
    }
}
