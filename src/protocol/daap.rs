//! DMAP listing encoding for `SET_PARAMETER` metadata
//!
//! Every field is `tag(4) || size(u32 BE) || value`. The whole listing is
//! wrapped in an `mlit` container whose length is fixed up when the
//! builder finishes, and which always carries the mandatory one-byte
//! `mikd` (item kind) entry valued 2.

/// Builder for a DAAP `mlit` listing.
#[derive(Debug)]
pub struct DaapListing {
    buf: Vec<u8>,
}

impl DaapListing {
    /// Start a listing with the mandatory `mikd` entry.
    #[must_use]
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(b"mlit");
        buf.extend_from_slice(&[0u8; 4]); // length, fixed up in finish()
        buf.extend_from_slice(b"mikd");
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(2);
        Self { buf }
    }

    /// Append a string entry (raw UTF-8 bytes).
    pub fn string(&mut self, tag: &[u8; 4], value: &str) -> &mut Self {
        self.buf.extend_from_slice(tag);
        self.buf
            .extend_from_slice(&u32::try_from(value.len()).unwrap_or(0).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append an integer entry, encoded as two big-endian bytes.
    pub fn int(&mut self, tag: &[u8; 4], value: u16) -> &mut Self {
        self.buf.extend_from_slice(tag);
        self.buf.extend_from_slice(&2u32.to_be_bytes());
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Fix up the container length and return the encoded bytes.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        let content_len = u32::try_from(self.buf.len() - 8).unwrap_or(u32::MAX);
        self.buf[4..8].copy_from_slice(&content_len.to_be_bytes());
        self.buf
    }
}

impl Default for DaapListing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at<'a>(data: &'a [u8], pos: usize) -> (&'a [u8], usize, &'a [u8]) {
        let tag = &data[pos..pos + 4];
        let len =
            u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                as usize;
        (tag, len, &data[pos + 8..pos + 8 + len])
    }

    #[test]
    fn test_empty_listing_has_mikd() {
        let data = DaapListing::new().finish();
        let (tag, len, value) = entry_at(&data, 0);
        assert_eq!(tag, b"mlit");
        assert_eq!(len, data.len() - 8);
        let (tag, len, value2) = entry_at(&data, 8);
        assert_eq!(tag, b"mikd");
        assert_eq!(len, 1);
        assert_eq!(value2, &[2]);
        let _ = value;
    }

    #[test]
    fn test_string_and_int_entries() {
        let mut listing = DaapListing::new();
        listing.string(b"minm", "Song Title").int(b"astn", 7);
        let data = listing.finish();

        // outer length covers everything after the mlit header
        let outer = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        assert_eq!(outer, data.len() - 8);

        // skip mlit header (8) + mikd entry (8 + 1)
        let (tag, len, value) = entry_at(&data, 17);
        assert_eq!(tag, b"minm");
        assert_eq!(len, 10);
        assert_eq!(value, b"Song Title");

        let (tag, len, value) = entry_at(&data, 17 + 8 + 10);
        assert_eq!(tag, b"astn");
        assert_eq!(len, 2);
        assert_eq!(value, &[0, 7]);
    }
}
