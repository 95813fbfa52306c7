//! Provides SymCache support.
//!
//! A SymCache is the compiled form of one module's symbol information. It is
//! built once from a parsed Breakpad symbol file via [`SymCacheConverter`],
//! persisted as an opaque versioned blob, and answers
//! [`lookup`](SymCache::lookup) queries by binary search without fully
//! deserializing the buffer.

#![warn(missing_docs)]

mod demangle;
mod error;
mod lookup;
pub(crate) mod raw;
mod writer;

pub use error::Error;
pub use lookup::*;
pub use writer::SymCacheConverter;

/// The current version of the SymCache binary format.
///
/// This is part of the disk cache key: bumping it invalidates all previously
/// persisted symcaches.
pub const SYMCACHE_VERSION: u32 = raw::SYMCACHE_VERSION;

type Result<T, E = Error> = std::result::Result<T, E>;

/// The deserialized SymCache binary format.
///
/// This can be parsed from a binary buffer via [`SymCache::parse`] and
/// lookups on it can be performed via the [`SymCache::lookup`] method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymCache<'data> {
    num_functions: u32,
    num_source_locations: u32,
    num_ranges: u32,
    functions: &'data [u8],
    source_locations: &'data [u8],
    ranges: &'data [u8],
    string_bytes: &'data [u8],
}

impl<'data> SymCache<'data> {
    /// Parses the SymCache binary format into a type that allows safe access
    /// and fast lookups.
    ///
    /// All section bounds are validated here, so the accessors below can
    /// never read out of bounds. The buffer does not need any particular
    /// alignment; all multi-byte fields are decoded on access.
    pub fn parse(buf: &'data [u8]) -> Result<Self> {
        if buf.len() < raw::Header::SIZE {
            return Err(Error::HeaderTooSmall);
        }

        let header = raw::Header {
            magic: read_u32(buf, 0),
            version: read_u32(buf, 4),
            num_functions: read_u32(buf, 8),
            num_source_locations: read_u32(buf, 12),
            num_ranges: read_u32(buf, 16),
            string_bytes: read_u32(buf, 20),
        };

        if header.magic != raw::SYMCACHE_MAGIC {
            return Err(Error::WrongFormat);
        }
        if header.version != raw::SYMCACHE_VERSION {
            return Err(Error::WrongVersion);
        }

        let mut functions_size = raw::Function::SIZE * header.num_functions as usize;
        functions_size += raw::align_to_eight(functions_size);

        let mut source_locations_size =
            raw::SourceLocation::SIZE * header.num_source_locations as usize;
        source_locations_size += raw::align_to_eight(source_locations_size);

        let mut ranges_size = 4 * header.num_ranges as usize;
        ranges_size += raw::align_to_eight(ranges_size);

        let expected_len = raw::Header::SIZE
            + functions_size
            + source_locations_size
            + ranges_size
            + header.string_bytes as usize;

        if buf.len() != expected_len || header.num_ranges > header.num_source_locations {
            return Err(Error::BadFormatLength);
        }

        let functions_start = raw::Header::SIZE;
        let source_locations_start = functions_start + functions_size;
        let ranges_start = source_locations_start + source_locations_size;
        let string_bytes_start = ranges_start + ranges_size;

        Ok(SymCache {
            num_functions: header.num_functions,
            num_source_locations: header.num_source_locations,
            num_ranges: header.num_ranges,
            functions: &buf[functions_start..source_locations_start],
            source_locations: &buf[source_locations_start..ranges_start],
            ranges: &buf[ranges_start..string_bytes_start],
            string_bytes: &buf[string_bytes_start..],
        })
    }

    fn raw_function(&self, function_idx: u32) -> Option<raw::Function> {
        if function_idx >= self.num_functions {
            return None;
        }
        let offset = function_idx as usize * raw::Function::SIZE;
        Some(raw::Function {
            name_offset: read_u32(self.functions, offset),
            entry_addr: read_u32(self.functions, offset + 4),
        })
    }

    fn raw_source_location(&self, source_location_idx: u32) -> Option<raw::SourceLocation> {
        if source_location_idx >= self.num_source_locations {
            return None;
        }
        let offset = source_location_idx as usize * raw::SourceLocation::SIZE;
        Some(raw::SourceLocation {
            file_offset: read_u32(self.source_locations, offset),
            line: read_u32(self.source_locations, offset + 4),
            function_idx: read_u32(self.source_locations, offset + 8),
            inlined_into_idx: read_u32(self.source_locations, offset + 12),
        })
    }

    fn range(&self, range_idx: u32) -> u32 {
        read_u32(self.ranges, range_idx as usize * 4)
    }

    /// Resolves a string reference to the pointed-to `&str` data.
    fn get_string(&self, offset: u32) -> Option<&'data str> {
        if offset == raw::NO_INDEX {
            return None;
        }
        let len_offset = offset as usize;
        let len = read_u32(self.string_bytes.get(len_offset..len_offset + 4)?, 0) as usize;

        let start_offset = len_offset + 4;
        let bytes = self.string_bytes.get(start_offset..start_offset + len)?;

        std::str::from_utf8(bytes).ok()
    }

    /// The number of address ranges covered by this SymCache.
    pub fn num_ranges(&self) -> u32 {
        self.num_ranges
    }

    /// The number of functions in this SymCache.
    pub fn num_functions(&self) -> u32 {
        self.num_functions
    }
}

/// Reads a little-endian `u32` at `offset`.
///
/// The caller must have validated bounds; parse-time section checks
/// guarantee this for all internal accessors.
fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_short_buffers() {
        assert_eq!(SymCache::parse(b"SYM"), Err(Error::HeaderTooSmall));
    }

    #[test]
    fn parse_rejects_wrong_magic() {
        let mut buf = vec![0u8; raw::Header::SIZE];
        buf[..4].copy_from_slice(&u32::from_be_bytes(*b"NOPE").to_le_bytes());
        assert_eq!(SymCache::parse(&buf), Err(Error::WrongFormat));
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut buf = vec![0u8; raw::Header::SIZE];
        buf[..4].copy_from_slice(&raw::SYMCACHE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&(raw::SYMCACHE_VERSION + 1).to_le_bytes());
        assert_eq!(SymCache::parse(&buf), Err(Error::WrongVersion));
    }

    #[test]
    fn parse_rejects_truncated_sections() {
        let mut buf = vec![0u8; raw::Header::SIZE];
        buf[..4].copy_from_slice(&raw::SYMCACHE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&raw::SYMCACHE_VERSION.to_le_bytes());
        // one function claimed, no section present
        buf[8..12].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(SymCache::parse(&buf), Err(Error::BadFormatLength));
    }

    #[test]
    fn parse_accepts_empty_cache() {
        let mut buf = vec![0u8; raw::Header::SIZE];
        buf[..4].copy_from_slice(&raw::SYMCACHE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&raw::SYMCACHE_VERSION.to_le_bytes());
        let cache = SymCache::parse(&buf).unwrap();
        assert_eq!(cache.num_ranges(), 0);
        assert!(cache.lookup(0x1000).next().is_none());
    }
}
