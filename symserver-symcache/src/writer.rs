//! Defines the [SymCache Converter](`SymCacheConverter`).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;

use indexmap::IndexSet;
use symserver_symfile::{Function as SymFunction, LineInfo, PublicSymbol, SymFile};

use crate::demangle::demangle;
use crate::raw;

/// The SymCache Converter.
///
/// This compiles a parsed Breakpad symbol file into the binary SymCache
/// representation, which can then be serialized via
/// [`serialize`](SymCacheConverter::serialize).
#[derive(Debug, Default)]
pub struct SymCacheConverter {
    /// The concatenation of all strings that have been added to this converter.
    string_bytes: Vec<u8>,
    /// A map from strings to their offsets in the `string_bytes` field.
    strings: HashMap<String, u32>,
    /// The set of all [`raw::Function`]s that have been added.
    functions: IndexSet<raw::Function>,
    /// The set of all [`raw::SourceLocation`]s that are only reachable as
    /// inline callers of a range.
    source_locations: IndexSet<raw::SourceLocation>,
    /// A map from range start addresses to the [`raw::SourceLocation`]s they
    /// correspond to.
    ///
    /// Only the starting address of a range is saved; the end address is
    /// given implicitly by the start address of the next range.
    ranges: BTreeMap<u32, raw::SourceLocation>,
    /// The `[start, end)` intervals of all processed functions, used to
    /// decide which public symbols are shadowed.
    function_intervals: Vec<(u32, u32)>,
    /// The highest address that is known to be outside of a valid function.
    ///
    /// Functions have an explicit end, while public symbols implicitly
    /// extend to infinity. If the highest address belongs to a public
    /// symbol this is `None` and the SymCache also extends to infinity.
    last_addr: Option<u32>,
}

/// One inline record range at a given depth, with its call site.
#[derive(Clone, Copy, Debug)]
struct InlineSpan {
    end: u32,
    call_line: u64,
    call_file_id: u64,
    origin_id: u64,
}

impl SymCacheConverter {
    /// Creates a new converter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a string into this converter.
    ///
    /// If the string was already present, it is not added again. A newly
    /// added string is prefixed by its length as a little-endian `u32`. The
    /// returned `u32` is the offset into the string data where the string
    /// is saved.
    fn insert_string(
        string_bytes: &mut Vec<u8>,
        strings: &mut HashMap<String, u32>,
        s: &str,
    ) -> u32 {
        if s.is_empty() {
            return raw::NO_INDEX;
        }
        if let Some(&offset) = strings.get(s) {
            return offset;
        }
        let string_offset = string_bytes.len() as u32;
        let string_len = s.len() as u32;
        string_bytes.extend(string_len.to_le_bytes());
        string_bytes.extend(s.bytes());
        strings.insert(s.to_owned(), string_offset);
        string_offset
    }

    /// Processes a parsed symbol file, adding all of its functions, inline
    /// hierarchies and public symbols to the converter.
    pub fn process_symfile(&mut self, sym: &SymFile) {
        for function in &sym.functions {
            self.process_function(sym, function);
        }

        // Sorted intervals with a running maximum of end addresses, so that
        // nested intervals cannot hide an enclosing function.
        let mut intervals = std::mem::take(&mut self.function_intervals);
        intervals.sort_unstable();
        let mut max_end = 0;
        for interval in &mut intervals {
            max_end = max_end.max(interval.1);
            interval.1 = max_end;
        }
        for public in &sym.publics {
            self.process_public(&intervals, public);
        }
    }

    /// Processes an individual function record.
    ///
    /// Functions are processed in file order; a function whose range
    /// overlaps previously emitted ranges wins within its own span.
    fn process_function(&mut self, sym: &SymFile, function: &SymFunction) {
        // skip empty functions and functions whose address cannot be
        // represented in the 32-bit range table
        if function.size == 0 || function.address > u32::MAX as u64 {
            return;
        }

        let start = function.address as u32;
        let end = function.end_address().min(u32::MAX as u64) as u32;

        let function_idx = {
            let name = demangle(&function.name);
            let name_offset =
                Self::insert_string(&mut self.string_bytes, &mut self.strings, &name);
            let (idx, _) = self.functions.insert_full(raw::Function {
                name_offset,
                entry_addr: start,
            });
            idx as u32
        };

        let stale: Vec<u32> = self.ranges.range(start..end).map(|(addr, _)| *addr).collect();
        let overlapping = self
            .ranges
            .range(start..end)
            .filter(|(_, location)| !location.is_empty())
            .count();
        if overlapping > 0 {
            // An end sentinel at `start` is the normal adjacent-function
            // case; real ranges in the span mean overlapping FUNC records.
            tracing::warn!(start, end, overlapping, "function overlaps previously emitted ranges");
        }
        for addr in stale {
            self.ranges.remove(&addr);
        }

        // Line records covering this function, resolved last-wins per start
        // address.
        let mut lines: BTreeMap<u32, &LineInfo> = BTreeMap::new();
        for line in &function.lines {
            if line.address < start as u64 || line.address >= end as u64 {
                continue;
            }
            lines.insert(line.address as u32, line);
        }

        // Inline ranges grouped by depth, resolved last-wins per start
        // address within a depth.
        let mut inline_spans: BTreeMap<u64, BTreeMap<u32, InlineSpan>> = BTreeMap::new();
        for inline in &function.inlines {
            for &(addr, size) in &inline.ranges {
                if size == 0 || addr < start as u64 || addr >= end as u64 {
                    continue;
                }
                let span_start = addr as u32;
                let span_end = addr.saturating_add(size).min(end as u64) as u32;
                inline_spans.entry(inline.depth).or_default().insert(
                    span_start,
                    InlineSpan {
                        end: span_end,
                        call_line: inline.call_line,
                        call_file_id: inline.call_file_id,
                        origin_id: inline.origin_id,
                    },
                );
            }
        }

        // The emitted chain can only change at one of these addresses.
        let mut boundaries = BTreeSet::new();
        boundaries.insert(start);
        for (&addr, line) in &lines {
            boundaries.insert(addr);
            let line_end = (line.address.saturating_add(line.size)).min(end as u64) as u32;
            boundaries.insert(line_end);
        }
        for spans in inline_spans.values() {
            for (&addr, span) in spans {
                boundaries.insert(addr);
                boundaries.insert(span.end);
            }
        }

        let addrs: Vec<u32> = boundaries.range(start..end).copied().collect();
        for addr in addrs {
            let line = lines
                .range(..=addr)
                .next_back()
                .map(|(_, line)| *line)
                .filter(|line| line.address.saturating_add(line.size) > addr as u64);

            // The stack of inline calls covering this address, one per
            // depth, starting at depth 0. A missing depth breaks the chain.
            let mut chain: Vec<InlineSpan> = Vec::new();
            for (&depth, spans) in &inline_spans {
                if depth != chain.len() as u64 {
                    break;
                }
                match spans.range(..=addr).next_back() {
                    Some((_, span)) if span.end > addr => chain.push(*span),
                    _ => break,
                }
            }

            // Build the caller chain outermost-first. The call site of the
            // inline at depth k lies in the frame of depth k - 1, or in the
            // function itself for k = 0.
            let mut caller_idx = raw::NO_INDEX;
            for (k, span) in chain.iter().enumerate() {
                let caller_function_idx = match k.checked_sub(1) {
                    None => function_idx,
                    Some(prev) => self.intern_inline_origin(sym, chain[prev].origin_id),
                };
                let source_location = raw::SourceLocation {
                    file_offset: self.intern_file(sym, span.call_file_id),
                    line: span.call_line.min(u32::MAX as u64) as u32,
                    function_idx: caller_function_idx,
                    inlined_into_idx: caller_idx,
                };
                let (idx, _) = self.source_locations.insert_full(source_location);
                caller_idx = idx as u32;
            }

            let innermost_function_idx = match chain.last() {
                Some(span) => self.intern_inline_origin(sym, span.origin_id),
                None => function_idx,
            };
            let innermost = raw::SourceLocation {
                file_offset: line.map_or(raw::NO_INDEX, |l| self.intern_file(sym, l.file_id)),
                line: line.map_or(0, |l| l.line.min(u32::MAX as u64) as u32),
                function_idx: innermost_function_idx,
                inlined_into_idx: caller_idx,
            };
            self.ranges.insert(addr, innermost);
        }

        self.ranges.entry(end).or_insert(raw::NO_SOURCE_LOCATION);
        self.function_intervals.push((start, end));

        let last_addr = self.last_addr.get_or_insert(0);
        if end > *last_addr {
            *last_addr = end;
        }
    }

    /// Processes an individual public symbol.
    ///
    /// Public symbols only cover regions that no function covers; a public
    /// symbol extends from its address to the next known range.
    fn process_public(&mut self, function_intervals: &[(u32, u32)], public: &PublicSymbol) {
        if public.address > u32::MAX as u64 {
            return;
        }
        let addr = public.address as u32;

        let shadowed = match function_intervals.partition_point(|&(start, _)| start <= addr) {
            0 => false,
            n => function_intervals[n - 1].1 > addr,
        };
        if shadowed {
            return;
        }

        let name = demangle(&public.name);
        let name_offset = Self::insert_string(&mut self.string_bytes, &mut self.strings, &name);
        let (function_idx, _) = self.functions.insert_full(raw::Function {
            name_offset,
            entry_addr: addr,
        });

        self.ranges.insert(
            addr,
            raw::SourceLocation {
                file_offset: raw::NO_INDEX,
                line: 0,
                function_idx: function_idx as u32,
                inlined_into_idx: raw::NO_INDEX,
            },
        );

        if let Some(last_addr) = self.last_addr {
            if addr >= last_addr {
                self.last_addr = None;
            }
        }
    }

    fn intern_file(&mut self, sym: &SymFile, file_id: u64) -> u32 {
        match sym.files.get(&file_id) {
            Some(path) => Self::insert_string(&mut self.string_bytes, &mut self.strings, path),
            None => raw::NO_INDEX,
        }
    }

    fn intern_inline_origin(&mut self, sym: &SymFile, origin_id: u64) -> u32 {
        let name = match sym.inline_origins.get(&origin_id) {
            Some(name) => demangle(name),
            None => std::borrow::Cow::Borrowed("<unknown>"),
        };
        let name_offset = Self::insert_string(&mut self.string_bytes, &mut self.strings, &name);
        let (idx, _) = self.functions.insert_full(raw::Function {
            name_offset,
            // inlined functions have no own entry address
            entry_addr: raw::NO_INDEX,
        });
        idx as u32
    }

    /// Serializes the converted data into the SymCache binary format.
    pub fn serialize<W: Write>(mut self, writer: &mut W) -> std::io::Result<()> {
        if let Some(last_addr) = self.last_addr {
            self.ranges.entry(last_addr).or_insert(raw::NO_SOURCE_LOCATION);
        }

        let num_functions = self.functions.len() as u32;
        let num_source_locations = (self.source_locations.len() + self.ranges.len()) as u32;
        let num_ranges = self.ranges.len() as u32;
        let string_bytes = self.string_bytes.len() as u32;

        let mut writer = WriteWrapper::new(writer);

        writer.write_u32(raw::SYMCACHE_MAGIC)?;
        writer.write_u32(raw::SYMCACHE_VERSION)?;
        writer.write_u32(num_functions)?;
        writer.write_u32(num_source_locations)?;
        writer.write_u32(num_ranges)?;
        writer.write_u32(string_bytes)?;
        writer.align()?;

        for function in &self.functions {
            writer.write_u32(function.name_offset)?;
            writer.write_u32(function.entry_addr)?;
        }
        writer.align()?;

        for source_location in self
            .source_locations
            .iter()
            .chain(self.ranges.values())
        {
            writer.write_u32(source_location.file_offset)?;
            writer.write_u32(source_location.line)?;
            writer.write_u32(source_location.function_idx)?;
            writer.write_u32(source_location.inlined_into_idx)?;
        }
        writer.align()?;

        for addr in self.ranges.keys() {
            writer.write_u32(*addr)?;
        }
        writer.align()?;

        writer.write(&self.string_bytes)?;

        Ok(())
    }
}

struct WriteWrapper<W> {
    writer: W,
    position: usize,
}

impl<W: Write> WriteWrapper<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            position: 0,
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write_all(buf)?;
        self.position += buf.len();
        Ok(buf.len())
    }

    fn write_u32(&mut self, value: u32) -> std::io::Result<usize> {
        self.write(&value.to_le_bytes())
    }

    fn align(&mut self) -> std::io::Result<usize> {
        let buf = [0u8; 7];
        let len = raw::align_to_eight(self.position);
        self.write(&buf[0..len])
    }
}
