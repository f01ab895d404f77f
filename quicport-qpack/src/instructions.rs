//! QPACK instruction wire formats (RFC 9204 Section 4.3).
//!
//! The encoder emits encoder-stream instructions and parses decoder-stream
//! instructions; both live on totally-ordered unidirectional QUIC streams.

use bytes::{BufMut, BytesMut};

use crate::error::{QpackError, Result, QPACK_ENCODER_STREAM_ERROR};
use crate::huffman;
use crate::prefix_int;

/// An encoder-stream instruction, queued by the encoder and drained to the
/// instruction handler in batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Set Dynamic Table Capacity: `001xxxxx`, 5-bit capacity.
    SetCapacity { capacity: u64 },

    /// Insert With Name Reference: `1Txxxxxx`, 6-bit name index (static
    /// absolute or dynamic relative), then an H-flagged value string.
    InsertWithNameRef {
        is_static: bool,
        name_index: u64,
        value: String,
        huffman: bool,
    },

    /// Insert With Literal Name: `01Hxxxxx`, 5-bit name length, then an
    /// H-flagged value string.
    InsertWithLiteralName {
        name: String,
        value: String,
        huffman: bool,
    },

    /// Duplicate: `000xxxxx`, 5-bit relative index of the entry to copy.
    Duplicate { relative_index: u64 },
}

impl Instruction {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Instruction::SetCapacity { capacity } => {
                prefix_int::encode(*capacity, 5, 0x20, buf);
            }
            Instruction::InsertWithNameRef {
                is_static,
                name_index,
                value,
                huffman,
            } => {
                let mask = if *is_static { 0xC0 } else { 0x80 };
                prefix_int::encode(*name_index, 6, mask, buf);
                encode_string(value.as_bytes(), *huffman, 7, 0x00, buf);
            }
            Instruction::InsertWithLiteralName {
                name,
                value,
                huffman,
            } => {
                encode_string(name.as_bytes(), *huffman, 5, 0x40, buf);
                encode_string(value.as_bytes(), *huffman, 7, 0x00, buf);
            }
            Instruction::Duplicate { relative_index } => {
                prefix_int::encode(*relative_index, 5, 0x00, buf);
            }
        }
    }
}

/// A decoder-stream instruction, parsed by the encoder
/// (RFC 9204 Section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderInstruction {
    /// Section Acknowledgement: `1xxxxxxx`, 7-bit stream id.
    SectionAcknowledgement { stream_id: u64 },

    /// Stream Cancellation: `01xxxxxx`, 6-bit stream id.
    StreamCancellation { stream_id: u64 },

    /// Insert Count Increment: `00xxxxxx`, 6-bit increment.
    InsertCountIncrement { increment: u64 },
}

impl DecoderInstruction {
    /// Decode one instruction, returning it and the bytes consumed.
    ///
    /// [`QpackError::UnexpectedEof`] means the buffer ends mid-instruction
    /// and the caller should retry with more data; malformed integers are
    /// promoted to a connection-fatal encoder stream error.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let first = *data.first().ok_or(QpackError::UnexpectedEof)?;

        if first & 0x80 != 0 {
            let (stream_id, consumed) = prefix_int::decode(data, 7)?;
            Ok((
                DecoderInstruction::SectionAcknowledgement { stream_id },
                consumed,
            ))
        } else if first & 0xC0 == 0x40 {
            let (stream_id, consumed) = prefix_int::decode(data, 6)?;
            Ok((DecoderInstruction::StreamCancellation { stream_id }, consumed))
        } else {
            let (increment, consumed) = prefix_int::decode(data, 6)?;
            Ok((DecoderInstruction::InsertCountIncrement { increment }, consumed))
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            DecoderInstruction::SectionAcknowledgement { stream_id } => {
                prefix_int::encode(*stream_id, 7, 0x80, buf);
            }
            DecoderInstruction::StreamCancellation { stream_id } => {
                prefix_int::encode(*stream_id, 6, 0x40, buf);
            }
            DecoderInstruction::InsertCountIncrement { increment } => {
                prefix_int::encode(*increment, 6, 0x00, buf);
            }
        }
    }
}

/// Promote a mid-buffer parse failure to the connection-fatal error the
/// decoder stream mandates.
pub(crate) fn fatal_stream_error(err: QpackError) -> QpackError {
    match err {
        QpackError::UnexpectedEof => QpackError::UnexpectedEof,
        QpackError::IntegerOverflow => QpackError::session(
            QPACK_ENCODER_STREAM_ERROR,
            "malformed integer on decoder stream",
        ),
        other => other,
    }
}

/// Encode a string with the `H`-flag convention: the bit above the length
/// prefix selects Huffman, applied only when it actually shrinks the data.
pub(crate) fn encode_string(
    data: &[u8],
    huffman_allowed: bool,
    prefix_bits: u8,
    prefix_mask: u8,
    buf: &mut BytesMut,
) {
    if huffman_allowed {
        let encoded_len = huffman::encoded_size(data);
        if encoded_len < data.len() {
            let h_bit = 1u8 << prefix_bits;
            prefix_int::encode(encoded_len as u64, prefix_bits, prefix_mask | h_bit, buf);
            let mut encoded = Vec::with_capacity(encoded_len);
            huffman::encode(data, &mut encoded);
            buf.put_slice(&encoded);
            return;
        }
    }
    prefix_int::encode(data.len() as u64, prefix_bits, prefix_mask, buf);
    buf.put_slice(data);
}
