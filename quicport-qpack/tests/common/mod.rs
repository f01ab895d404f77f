//! Test-support QPACK decoder.
//!
//! Decodes exactly what the encoder under test can emit: the four encoder
//! stream instructions and the five field line encodings, against its own
//! copy of the dynamic table. Production deployments decode with the peer's
//! real decoder; this one exists so round-trip tests close the loop.

use quicport_qpack::huffman;
use quicport_qpack::prefix_int;
use quicport_qpack::static_table;

pub struct TestDecoder {
    /// Dynamic entries in insertion order; absolute index = position + 1.
    entries: Vec<(String, String)>,
    capacity: usize,
}

impl TestDecoder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            capacity: 0,
        }
    }

    pub fn insert_count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn entry(&self, absolute: u64) -> (String, String) {
        assert!(
            absolute >= 1 && absolute <= self.insert_count(),
            "reference to missing entry {absolute}"
        );
        self.entries[(absolute - 1) as usize].clone()
    }

    /// Apply a batch of encoder stream instructions.
    pub fn process_instructions(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            let first = data[offset];
            if first & 0x80 != 0 {
                // Insert With Name Reference.
                let is_static = first & 0x40 != 0;
                let (index, consumed) = prefix_int::decode(&data[offset..], 6).unwrap();
                offset += consumed;
                let name = if is_static {
                    static_table::get(index).expect("static index").0.to_owned()
                } else {
                    self.entry(self.insert_count() - index).0
                };
                let (value, consumed) = read_string(&data[offset..], 7);
                offset += consumed;
                self.entries.push((name, value));
            } else if first & 0xC0 == 0x40 {
                // Insert With Literal Name.
                let (name, consumed) = read_string(&data[offset..], 5);
                offset += consumed;
                let (value, consumed) = read_string(&data[offset..], 7);
                offset += consumed;
                self.entries.push((name, value));
            } else if first & 0xE0 == 0x20 {
                // Set Dynamic Table Capacity.
                let (capacity, consumed) = prefix_int::decode(&data[offset..], 5).unwrap();
                offset += consumed;
                self.capacity = capacity as usize;
            } else {
                // Duplicate.
                let (index, consumed) = prefix_int::decode(&data[offset..], 5).unwrap();
                offset += consumed;
                let entry = self.entry(self.insert_count() - index);
                self.entries.push(entry);
            }
        }
    }

    /// Decode a field section into name-value pairs.
    pub fn decode_section(&self, data: &[u8]) -> Vec<(String, String)> {
        let (encoded_insert_count, mut offset) = prefix_int::decode(data, 8).unwrap();
        let required_insert_count = self.decode_insert_count(encoded_insert_count);
        assert!(
            required_insert_count <= self.insert_count(),
            "section requires {required_insert_count} inserts, decoder has {}",
            self.insert_count()
        );

        let sign = data[offset] & 0x80 != 0;
        let (delta_base, consumed) = prefix_int::decode(&data[offset..], 7).unwrap();
        offset += consumed;
        let base = if sign {
            required_insert_count - delta_base - 1
        } else {
            required_insert_count + delta_base
        };

        let mut fields = Vec::new();
        while offset < data.len() {
            let first = data[offset];
            if first & 0x80 != 0 {
                // Indexed Field Line.
                let is_static = first & 0x40 != 0;
                let (index, consumed) = prefix_int::decode(&data[offset..], 6).unwrap();
                offset += consumed;
                if is_static {
                    let (name, value) = static_table::get(index).expect("static index");
                    fields.push((name.to_owned(), value.to_owned()));
                } else {
                    fields.push(self.entry(base - index));
                }
            } else if first & 0xF0 == 0x10 {
                // Indexed Field Line With Post-Base Index.
                let (index, consumed) = prefix_int::decode(&data[offset..], 4).unwrap();
                offset += consumed;
                fields.push(self.entry(base + index + 1));
            } else if first & 0xC0 == 0x40 {
                // Literal Field Line With Name Reference.
                let is_static = first & 0x10 != 0;
                let (index, consumed) = prefix_int::decode(&data[offset..], 4).unwrap();
                offset += consumed;
                let name = if is_static {
                    static_table::get(index).expect("static index").0.to_owned()
                } else {
                    self.entry(base - index).0
                };
                let (value, consumed) = read_string(&data[offset..], 7);
                offset += consumed;
                fields.push((name, value));
            } else if first & 0xE0 == 0x20 {
                // Literal Field Line With Literal Name.
                let (name, consumed) = read_string(&data[offset..], 3);
                offset += consumed;
                let (value, consumed) = read_string(&data[offset..], 7);
                offset += consumed;
                fields.push((name, value));
            } else {
                // Literal Field Line With Post-Base Name Reference.
                let (index, consumed) = prefix_int::decode(&data[offset..], 3).unwrap();
                offset += consumed;
                let name = self.entry(base + index + 1).0;
                let (value, consumed) = read_string(&data[offset..], 7);
                offset += consumed;
                fields.push((name, value));
            }
        }
        fields
    }

    /// Reconstruct the required insert count from its wrapped wire form
    /// (RFC 9204 Section 4.5.1.1).
    fn decode_insert_count(&self, encoded: u64) -> u64 {
        if encoded == 0 {
            return 0;
        }
        let max_entries = (self.capacity / 32) as u64;
        let full_range = 2 * max_entries;
        assert!(encoded <= full_range, "encoded insert count out of range");
        let max_value = self.insert_count() + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut required = max_wrapped + encoded - 1;
        if required > max_value {
            assert!(required >= full_range, "invalid wrapped insert count");
            required -= full_range;
        }
        required
    }
}

impl Default for TestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read an H-flagged string with the given length prefix width.
fn read_string(data: &[u8], prefix_bits: u8) -> (String, usize) {
    let is_huffman = data[0] & (1 << prefix_bits) != 0;
    let (len, mut offset) = prefix_int::decode(data, prefix_bits).unwrap();
    let raw = &data[offset..offset + len as usize];
    offset += len as usize;
    let bytes = if is_huffman {
        let mut decoded = Vec::new();
        huffman::decode(raw, &mut decoded).unwrap();
        decoded
    } else {
        raw.to_vec()
    };
    (String::from_utf8(bytes).unwrap(), offset)
}
