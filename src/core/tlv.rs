//! Minimal TLV stream used for onion hop payloads.
//!
//! Records are kept sorted by type and encoded as BigSize type, BigSize
//! length, value, which is the layout hop payloads use on the wire.

/// A single type-length-value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvRecord {
    pub typ: u64,
    pub value: Vec<u8>,
}

/// An ordered set of TLV records. Inserting an existing type replaces the
/// previous value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvStream {
    records: Vec<TlvRecord>,
}

impl TlvStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, typ: u64, value: Vec<u8>) {
        match self.records.binary_search_by_key(&typ, |r| r.typ) {
            Ok(at) => self.records[at].value = value,
            Err(at) => self.records.insert(at, TlvRecord { typ, value }),
        }
    }

    pub fn get(&self, typ: u64) -> Option<&[u8]> {
        self.records
            .binary_search_by_key(&typ, |r| r.typ)
            .ok()
            .map(|at| self.records[at].value.as_slice())
    }

    /// Copies every record of `other` into this stream, replacing clashes.
    pub fn merge(&mut self, other: &TlvStream) {
        for record in &other.records {
            self.insert(record.typ, record.value.clone());
        }
    }

    pub fn records(&self) -> &[TlvRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialized length in bytes, without encoding.
    pub fn serialized_len(&self) -> usize {
        self.records
            .iter()
            .map(|r| bigsize_len(r.typ) + bigsize_len(r.value.len() as u64) + r.value.len())
            .sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        for record in &self.records {
            write_bigsize(record.typ, &mut out);
            write_bigsize(record.value.len() as u64, &mut out);
            out.extend_from_slice(&record.value);
        }
        out
    }
}

/// Appends a BigSize-encoded integer.
pub fn write_bigsize(n: u64, out: &mut Vec<u8>) {
    match n {
        0..=0xFC => out.push(n as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(n as u32).to_be_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&n.to_be_bytes());
        }
    }
}

fn bigsize_len(n: u64) -> usize {
    match n {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Truncated big-endian encoding of a u64: leading zero bytes stripped.
pub fn tu64_bytes(n: u64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

/// Truncated big-endian encoding of a u32.
pub fn tu32_bytes(n: u32) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    bytes[skip..].to_vec()
}
