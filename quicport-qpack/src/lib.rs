//! QPACK: field compression for HTTP/3 (RFC 9204), encoder side.
//!
//! The encoder serializes field sections against a shared static table and a
//! connection-scoped dynamic table, feeding table updates to the peer over
//! the encoder stream and consuming acknowledgements from the decoder
//! stream. Blocked-stream risk stays within the peer's advertised budget;
//! when the budget is spent the encoder degrades to literal encodings
//! instead of blocking more streams.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use quicport_qpack::{Encoder, HeaderField, Instruction};
//!
//! let handler = |batch: &[Instruction]| {
//!     // Serialize `batch` onto the encoder stream here.
//!     let _ = batch;
//! };
//! let mut encoder = Encoder::new(Box::new(handler), 16);
//! encoder.set_capacity(4096).unwrap();
//!
//! let mut section = BytesMut::new();
//! encoder
//!     .encode(
//!         &mut section,
//!         0,
//!         &[
//!             HeaderField::new(":method", "GET"),
//!             HeaderField::new(":path", "/"),
//!         ],
//!     )
//!     .unwrap();
//! ```

pub mod dynamic_table;
pub mod encoder;
pub mod error;
pub mod field;
pub mod huffman;
pub mod instructions;
pub mod prefix_int;
pub mod static_table;
pub mod stream_info;

pub use dynamic_table::{DynamicTable, TableEntry};
pub use encoder::{Encoder, InstructionHandler, DO_NOT_HUFFMAN, DO_NOT_INDEX, NEVER_INDEX};
pub use error::{QpackError, Result};
pub use field::{Header, HeaderField};
pub use instructions::{DecoderInstruction, Instruction};
pub use stream_info::{SectionInfo, StreamInfo};
