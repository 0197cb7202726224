// Values live in a flat blob section at the end of an automaton file. A final
// state's value reference is the offset of its record: a little-endian u32
// length, the key's own weight as a little-endian u32, then `length` bytes.
// The bytes are opaque here; how they are encoded is up to whoever wrote them.
//
// The key's own weight differs from the state's inner weight, which also
// covers every key below it.

pub const RECORD_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct ValueStore<'a> {
    data: &'a [u8],
}

impl<'a> ValueStore<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ValueStore { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn header(&self, value_ref: u64) -> Option<(usize, u32, u32)> {
        let start = usize::try_from(value_ref).ok()?;
        let header_end = start.checked_add(RECORD_HEADER_LEN)?;
        let header = self.data.get(start..header_end)?;
        let len = u32::from_le_bytes(header[..4].try_into().ok()?);
        let weight = u32::from_le_bytes(header[4..].try_into().ok()?);
        Some((header_end, len, weight))
    }

    pub fn get(&self, value_ref: u64) -> Option<&'a [u8]> {
        let (body, len, _) = self.header(value_ref)?;
        self.data.get(body..body.checked_add(len as usize)?)
    }

    // None unless the whole record is in bounds.
    pub fn weight(&self, value_ref: u64) -> Option<u32> {
        self.get(value_ref)?;
        self.header(value_ref).map(|(_, _, weight)| weight)
    }
}

#[derive(Debug, Default)]
pub struct ValueStoreWriter {
    buf: Vec<u8>,
}

impl ValueStoreWriter {
    pub fn new() -> Self {
        ValueStoreWriter { buf: Vec::new() }
    }

    pub fn push(&mut self, value: &[u8], weight: u32) -> u64 {
        let offset = self.buf.len() as u64;
        self.buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&weight.to_le_bytes());
        self.buf.extend_from_slice(value);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::{ValueStore, ValueStoreWriter};

    #[test]
    fn test_value_store() {
        let mut w = ValueStoreWriter::new();
        let a = w.push(b"hello", 7);
        let b = w.push(b"", 0);
        let c = w.push(b"{\"a\":1}", 3);
        let bytes = w.into_bytes();
        let store = ValueStore::new(&bytes);

        assert_eq!(store.get(a), Some(&b"hello"[..]));
        assert_eq!(store.get(b), Some(&b""[..]));
        assert_eq!(store.get(c), Some(&b"{\"a\":1}"[..]));
        assert_eq!(store.weight(a), Some(7));
        assert_eq!(store.weight(c), Some(3));
        // Points into the middle of a record, so the length is garbage.
        assert_eq!(store.get(a + 1), None);
        assert_eq!(store.get(bytes.len() as u64), None);
        assert_eq!(store.weight(bytes.len() as u64), None);
    }
}
