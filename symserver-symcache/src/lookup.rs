use crate::{raw, SymCache};

impl<'data> SymCache<'data> {
    /// Looks up an instruction address in the SymCache, yielding an iterator
    /// of [`SourceLocation`]s.
    ///
    /// The first yielded location is the innermost frame at the address;
    /// subsequent locations are the enclosing inline callers, ending with
    /// the containing function itself. The iterator is empty when the
    /// address is not covered by any function or public symbol.
    pub fn lookup(&self, addr: u64) -> SourceLocationIter<'data, '_> {
        let addr = match u32::try_from(addr) {
            Ok(addr) => addr,
            Err(_) => {
                return SourceLocationIter {
                    cache: self,
                    source_location_idx: raw::NO_INDEX,
                }
            }
        };

        // Ranges only store their start address; the end is implicitly the
        // next range's start. The source locations of ranges are serialized
        // after all interned caller locations, in range order.
        let source_location_start = self.num_source_locations - self.num_ranges;
        let range_idx = match self.binary_search_ranges(addr) {
            Some(idx) => idx,
            None => {
                return SourceLocationIter {
                    cache: self,
                    source_location_idx: raw::NO_INDEX,
                }
            }
        };

        let source_location_idx = source_location_start + range_idx;
        let empty = self
            .raw_source_location(source_location_idx)
            .map_or(true, |sl| sl.is_empty());

        SourceLocationIter {
            cache: self,
            source_location_idx: if empty {
                raw::NO_INDEX
            } else {
                source_location_idx
            },
        }
    }

    /// Finds the index of the last range starting at or before `addr`.
    fn binary_search_ranges(&self, addr: u32) -> Option<u32> {
        let mut low = 0u32;
        let mut high = self.num_ranges;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.range(mid) <= addr {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        low.checked_sub(1)
    }
}

/// A source location as included in the SymCache.
///
/// The location represents a `(function, file, line)` triple corresponding
/// to an instruction, plus the link to the caller location it was inlined
/// into, if any.
#[derive(Clone, Debug)]
pub struct SourceLocation<'data, 'cache> {
    cache: &'cache SymCache<'data>,
    source_location: raw::SourceLocation,
}

impl<'data, 'cache> SourceLocation<'data, 'cache> {
    /// The source line corresponding to the instruction.
    ///
    /// This returns `None` when no line information is known.
    pub fn line(&self) -> Option<u32> {
        match self.source_location.line {
            0 => None,
            line => Some(line),
        }
    }

    /// The source file path corresponding to the instruction.
    pub fn file(&self) -> Option<&'data str> {
        self.cache.get_string(self.source_location.file_offset)
    }

    /// The name of the function at this location.
    pub fn function_name(&self) -> Option<&'data str> {
        let function = self.cache.raw_function(self.source_location.function_idx)?;
        self.cache.get_string(function.name_offset)
    }

    /// The entry address of the function at this location.
    ///
    /// Inlined functions have no entry address of their own.
    pub fn function_entry(&self) -> Option<u32> {
        let function = self.cache.raw_function(self.source_location.function_idx)?;
        (function.entry_addr != raw::NO_INDEX).then_some(function.entry_addr)
    }
}

/// An iterator yielding [`SourceLocation`]s, representing an inlining
/// hierarchy from the innermost frame outwards.
#[derive(Clone, Debug)]
pub struct SourceLocationIter<'data, 'cache> {
    pub(crate) cache: &'cache SymCache<'data>,
    pub(crate) source_location_idx: u32,
}

impl<'data, 'cache> Iterator for SourceLocationIter<'data, 'cache> {
    type Item = SourceLocation<'data, 'cache>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.source_location_idx == raw::NO_INDEX {
            return None;
        }
        self.cache
            .raw_source_location(self.source_location_idx)
            .map(|source_location| {
                self.source_location_idx = source_location.inlined_into_idx;
                SourceLocation {
                    cache: self.cache,
                    source_location,
                }
            })
    }
}
