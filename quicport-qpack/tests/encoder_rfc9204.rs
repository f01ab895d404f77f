//! RFC 9204 encoder behavior, end to end.
//!
//! Field sections and encoder stream instructions are piped into the
//! test-support decoder so every scenario verifies the actual wire bytes.

mod common;

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use common::TestDecoder;
use quicport_qpack::{Encoder, HeaderField, Instruction, InstructionHandler, QpackError};

/// Handler that serializes instruction batches into a shared byte buffer,
/// the way a session writes them onto the encoder stream.
fn wire_handler() -> (Arc<Mutex<BytesMut>>, Box<dyn InstructionHandler>) {
    let wire = Arc::new(Mutex::new(BytesMut::new()));
    let sink = wire.clone();
    let handler = move |batch: &[Instruction]| {
        let mut buf = sink.lock().unwrap();
        for instruction in batch {
            instruction.encode_into(&mut buf);
        }
    };
    (wire, Box::new(handler))
}

fn ack(encoder: &mut Encoder, stream_id: u64) -> Result<(), QpackError> {
    let mut buf = BytesMut::new();
    quicport_qpack::DecoderInstruction::SectionAcknowledgement { stream_id }
        .encode_into(&mut buf);
    encoder.parse_instructions(&buf).map(|_| ())
}

#[test]
fn static_only_request() {
    let (wire, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 16);

    let mut section = BytesMut::new();
    encoder
        .encode(
            &mut section,
            0,
            &[
                HeaderField::new(":method", "GET"),
                HeaderField::new(":scheme", "https"),
                HeaderField::new(":path", "/"),
                HeaderField::new(":authority", "x"),
            ],
        )
        .unwrap();

    // With a zero-capacity table nothing reaches the encoder stream and the
    // prefix is all zeroes; the three exact matches become static indexed
    // lines and :authority a literal with a static name reference.
    assert!(wire.lock().unwrap().is_empty());
    assert_eq!(
        &section[..],
        &[0x00, 0x00, 0xC0 | 17, 0xC0 | 23, 0xC0 | 1, 0x50, 0x01, b'x']
    );

    let decoder = TestDecoder::new();
    assert_eq!(
        decoder.decode_section(&section),
        vec![
            (":method".to_owned(), "GET".to_owned()),
            (":scheme".to_owned(), "https".to_owned()),
            (":path".to_owned(), "/".to_owned()),
            (":authority".to_owned(), "x".to_owned()),
        ]
    );
}

#[test]
fn duplicate_reference_within_one_section() {
    let (wire, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 16);
    encoder.set_capacity(1024).unwrap();
    assert!(encoder.insert(&HeaderField::new("custom", "value")).unwrap());

    let mut section = BytesMut::new();
    encoder
        .encode(
            &mut section,
            0,
            &[
                HeaderField::new("custom", "value"),
                HeaderField::new("custom", "value"),
            ],
        )
        .unwrap();

    // Required insert count 1 wraps to 2 on the wire (max_entries = 32);
    // base equals the insert count so both lines are relative index 0.
    assert_eq!(&section[..], &[0x02, 0x00, 0x80, 0x80]);
    assert_eq!(encoder.blocked_streams(), 1);

    let mut decoder = TestDecoder::new();
    decoder.process_instructions(&wire.lock().unwrap());
    assert_eq!(decoder.insert_count(), 1);
    assert_eq!(
        decoder.decode_section(&section),
        vec![
            ("custom".to_owned(), "value".to_owned()),
            ("custom".to_owned(), "value".to_owned()),
        ]
    );
}

#[test]
fn blocked_stream_budget_forces_literal_fallback() {
    let (wire, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 1);
    encoder.set_capacity(1024).unwrap();

    // Stream 0 inserts a fresh entry and references it post-base, spending
    // the whole blocking budget.
    let mut first = BytesMut::new();
    encoder
        .encode(&mut first, 0, &[HeaderField::new("a", "1")])
        .unwrap();
    assert_eq!(&first[..], &[0x02, 0x80, 0x10]);
    assert_eq!(encoder.blocked_streams(), 1);

    // Stream 4 must not block: its section references nothing and the field
    // line degrades to a literal.
    let mut second = BytesMut::new();
    encoder
        .encode(&mut second, 4, &[HeaderField::new("a", "1")])
        .unwrap();
    assert_eq!(encoder.blocked_streams(), 1);
    assert_eq!(&second[..2], &[0x00, 0x00]);
    assert_eq!(second[2] & 0xE0, 0x20, "expected a literal field line");

    let mut decoder = TestDecoder::new();
    decoder.process_instructions(&wire.lock().unwrap());
    assert_eq!(decoder.decode_section(&first), vec![("a".into(), "1".into())]);
    assert_eq!(
        decoder.decode_section(&second),
        vec![("a".into(), "1".into())]
    );
}

#[test]
fn section_acknowledgement_unblocks_and_retires_stream() {
    let (_, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 1);
    encoder.set_capacity(1024).unwrap();

    let mut first = BytesMut::new();
    encoder
        .encode(&mut first, 0, &[HeaderField::new("a", "1")])
        .unwrap();
    let mut second = BytesMut::new();
    encoder
        .encode(&mut second, 4, &[HeaderField::new("a", "1")])
        .unwrap();
    assert_eq!(encoder.blocked_streams(), 1);

    ack(&mut encoder, 0).unwrap();

    assert_eq!(encoder.known_insert_count(), 1);
    assert_eq!(encoder.blocked_streams(), 0);
    assert!(!encoder.has_stream(0));
    // Stream 4 still owes an acknowledgement for its literal-only section.
    assert!(encoder.has_stream(4));
}

#[test]
fn insert_count_increment_unblocks_sections() {
    let (_, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 4);
    encoder.set_capacity(1024).unwrap();

    let mut section = BytesMut::new();
    encoder
        .encode(&mut section, 0, &[HeaderField::new("a", "1")])
        .unwrap();
    let mut other = BytesMut::new();
    encoder
        .encode(&mut other, 4, &[HeaderField::new("a", "1")])
        .unwrap();
    assert_eq!(encoder.blocked_streams(), 2);

    let mut buf = BytesMut::new();
    quicport_qpack::DecoderInstruction::InsertCountIncrement { increment: 1 }
        .encode_into(&mut buf);
    encoder.parse_instructions(&buf).unwrap();

    assert_eq!(encoder.known_insert_count(), 1);
    assert_eq!(encoder.blocked_streams(), 0);
    // Sections stay queued until acknowledged even once unblocked.
    assert!(encoder.has_stream(0));
    assert!(encoder.has_stream(4));
}

#[test]
fn stream_cancellation_releases_references() {
    let (_, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 1);
    encoder.set_capacity(64).unwrap();

    let mut section = BytesMut::new();
    encoder
        .encode(&mut section, 0, &[HeaderField::new("a", "1")])
        .unwrap();
    // The sole entry is pinned by stream 0's section: the table cannot make
    // room for another entry of the same size.
    assert!(!encoder
        .table()
        .can_insert(&HeaderField::new("b", "2")));

    let mut buf = BytesMut::new();
    quicport_qpack::DecoderInstruction::StreamCancellation { stream_id: 0 }
        .encode_into(&mut buf);
    encoder.parse_instructions(&buf).unwrap();

    assert_eq!(encoder.blocked_streams(), 0);
    assert!(!encoder.has_stream(0));
    assert!(encoder.table().can_insert(&HeaderField::new("b", "2")));
}

#[test]
fn acknowledgements_follow_section_fifo_order() {
    let (_, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 16);
    encoder.set_capacity(1024).unwrap();

    // Two sections on the same stream; the first references entry 1, the
    // second entry 2.
    let mut first = BytesMut::new();
    encoder
        .encode(&mut first, 0, &[HeaderField::new("a", "1")])
        .unwrap();
    let mut second = BytesMut::new();
    encoder
        .encode(&mut second, 0, &[HeaderField::new("b", "2")])
        .unwrap();

    ack(&mut encoder, 0).unwrap();
    assert_eq!(encoder.known_insert_count(), 1);
    ack(&mut encoder, 0).unwrap();
    assert_eq!(encoder.known_insert_count(), 2);
    assert!(!encoder.has_stream(0));

    // A third acknowledgement has nothing to match.
    assert!(matches!(
        ack(&mut encoder, 0),
        Err(QpackError::Session { .. })
    ));
}

#[test]
fn blocked_streams_never_exceed_budget() {
    let (_, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 2);
    encoder.set_capacity(4096).unwrap();

    for stream_id in (0..40).step_by(4) {
        let mut section = BytesMut::new();
        encoder
            .encode(
                &mut section,
                stream_id,
                &[HeaderField::new("x-request-id", format!("{stream_id}"))],
            )
            .unwrap();
        assert!(encoder.blocked_streams() <= 2);
    }
    assert_eq!(encoder.blocked_streams(), 2);
}

#[test]
fn table_size_stays_within_capacity_under_churn() {
    let (wire, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 0);
    encoder.set_capacity(256).unwrap();

    let mut decoder = TestDecoder::new();
    for i in 0..50 {
        let mut section = BytesMut::new();
        let fields = [
            HeaderField::new(format!("x-h-{i}"), "v".repeat(i % 17)),
            HeaderField::new(":method", "GET"),
        ];
        encoder.encode(&mut section, 0, &fields).unwrap();

        let table = encoder.table();
        assert!(table.size() <= table.capacity());
        assert!(encoder.known_insert_count() <= table.insert_count());

        decoder.process_instructions(&wire.lock().unwrap());
        wire.lock().unwrap().clear();
        let decoded = decoder.decode_section(&section);
        assert_eq!(decoded[0].0, format!("x-h-{i}"));
        assert_eq!(decoded[1], (":method".to_owned(), "GET".to_owned()));
    }
}

#[test]
fn mixed_section_roundtrip() {
    let (wire, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 16);
    encoder.set_capacity(4096).unwrap();

    let request = vec![
        HeaderField::new(":method", "POST"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":path", "/submit"),
        HeaderField::new(":authority", "example.com"),
        HeaderField::new("content-type", "application/json"),
        HeaderField::new("user-agent", "quicport/0.1"),
        HeaderField::new("x-trace-id", "0af7651916cd43dd8448eb211c80319c"),
        HeaderField::new("authorization", "Bearer secret-token"),
        HeaderField::new("set-cookie", "session=abc123"),
    ];

    let mut decoder = TestDecoder::new();
    for stream_id in [0, 4, 8] {
        let mut section = BytesMut::new();
        encoder.encode(&mut section, stream_id, &request).unwrap();
        decoder.process_instructions(&wire.lock().unwrap());
        wire.lock().unwrap().clear();

        let decoded = decoder.decode_section(&section);
        let expected: Vec<(String, String)> = request
            .iter()
            .map(|f| (f.name().to_owned(), f.value().to_owned()))
            .collect();
        assert_eq!(decoded, expected, "stream {stream_id}");
    }

    // Later sections reuse the table: indexed lines shrink them.
    let mut early = BytesMut::new();
    encoder.encode(&mut early, 12, &request).unwrap();
    decoder.process_instructions(&wire.lock().unwrap());
    assert!(early.len() < 120);
}

#[test]
fn required_insert_count_bounded_by_insert_count() {
    let (_, handler) = wire_handler();
    let mut encoder = Encoder::new(handler, 16);
    encoder.set_capacity(1024).unwrap();

    let mut section = BytesMut::new();
    encoder
        .encode(
            &mut section,
            0,
            &[
                HeaderField::new("x-a", "1"),
                HeaderField::new("x-b", "2"),
                HeaderField::new("x-a", "1"),
            ],
        )
        .unwrap();

    // Three fields, two distinct entries inserted; every section's
    // requirement is within what the table has actually seen.
    assert_eq!(encoder.table().insert_count(), 2);
}
