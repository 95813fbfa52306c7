//! Support for Breakpad ASCII symbol files.
//!
//! The entry point is [`SymFile::parse`], which streams over the line-based
//! text format and accumulates the transient module model: source files,
//! inline origins, functions with their line and inline records, and public
//! symbols. The model is the input to the symcache converter and is dropped
//! once the symcache has been built.

#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::str;

use thiserror::Error;

use symserver_common::DebugId;

pub mod parsing;

use parsing::ParseRecordError;

/// An iterator over lines of a byte buffer.
///
/// Handles both `\n` and `\r\n` line endings and yields slices without the
/// terminator. This never copies the underlying data.
#[derive(Clone, Debug)]
pub struct Lines<'data> {
    data: &'data [u8],
    finished: bool,
}

impl<'data> Lines<'data> {
    /// Creates a new line iterator over the given buffer.
    pub fn new(data: &'data [u8]) -> Self {
        Self {
            data,
            finished: data.is_empty(),
        }
    }
}

impl<'data> Iterator for Lines<'data> {
    type Item = &'data [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.data.iter().position(|b| *b == b'\n') {
            None => {
                self.finished = true;
                Some(self.data)
            }
            Some(index) => {
                let mut line = &self.data[..index];
                if index > 0 && line[index - 1] == b'\r' {
                    line = &line[..index - 1];
                }

                self.data = &self.data[index + 1..];
                if self.data.is_empty() {
                    self.finished = true;
                }
                Some(line)
            }
        }
    }
}

impl std::iter::FusedIterator for Lines<'_> {}

/// The error kind for [`SymError`].
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymErrorKind {
    /// The `MODULE` header record is missing.
    MissingModule,

    /// A part of the file is not encoded in valid UTF-8.
    BadEncoding,

    /// The module id in the header does not match the requested debug id.
    BadDebugId,

    /// A recognized record violates the Breakpad symbol syntax.
    Malformed,
}

impl SymErrorKind {
    /// A stable short name for this kind, used as a metrics tag.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingModule => "missing_module",
            Self::BadEncoding => "bad_encoding",
            Self::BadDebugId => "bad_debug_id",
            Self::Malformed => "malformed",
        }
    }

    /// Whether the same bytes will always fail with this error.
    ///
    /// Permanent failures may be recorded as negative cache entries; others
    /// must not be cached.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::BadDebugId)
    }
}

impl fmt::Display for SymErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingModule => write!(f, "missing breakpad module header"),
            Self::BadEncoding => write!(f, "bad utf-8 sequence"),
            Self::BadDebugId => write!(f, "module id does not match the requested debug id"),
            Self::Malformed => write!(f, "malformed record"),
        }
    }
}

/// An error when parsing a Breakpad symbol file.
#[derive(Debug, Error)]
#[error("{kind} (line {line})")]
pub struct SymError {
    kind: SymErrorKind,
    line: u64,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl SymError {
    fn new<E>(kind: SymErrorKind, line: u64, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        SymError {
            kind,
            line,
            source: Some(source.into()),
        }
    }

    fn bare(kind: SymErrorKind, line: u64) -> Self {
        SymError {
            kind,
            line,
            source: None,
        }
    }

    /// Returns the corresponding [`SymErrorKind`] for this error.
    pub fn kind(&self) -> SymErrorKind {
        self.kind
    }

    /// The 1-based line number the error was encountered on.
    pub fn line(&self) -> u64 {
        self.line
    }
}

/// A line mapping inside a [`Function`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineInfo {
    /// The start address relative to the image base.
    pub address: u64,
    /// The size of the covered code in bytes.
    pub size: u64,
    /// The source line number.
    pub line: u64,
    /// The id of the source file in [`SymFile::files`].
    pub file_id: u64,
}

/// An inlined call inside a [`Function`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineInfo {
    /// The nesting depth; 0 means inlined directly into the function.
    pub depth: u64,
    /// The source line of the call site in the next outer frame.
    pub call_line: u64,
    /// The file id of the call site in the next outer frame.
    pub call_file_id: u64,
    /// The id of the callee name in [`SymFile::inline_origins`].
    pub origin_id: u64,
    /// The `(address, size)` code ranges covered by this inlined call.
    pub ranges: Vec<(u64, u64)>,
}

/// A function with its line and inline records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Function {
    /// The start address relative to the image base.
    pub address: u64,
    /// The size of the function's code in bytes.
    pub size: u64,
    /// The function name, as written by the symbol dumper.
    pub name: String,
    /// Line records in file order.
    pub lines: Vec<LineInfo>,
    /// Inline records in file order.
    pub inlines: Vec<InlineInfo>,
}

impl Function {
    /// The first address after this function.
    pub fn end_address(&self) -> u64 {
        self.address.saturating_add(self.size)
    }
}

/// A public symbol, covering the region from its address up to the next
/// known symbol.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublicSymbol {
    /// The address relative to the image base.
    pub address: u64,
    /// The symbol name.
    pub name: String,
}

/// The parsed model of one Breakpad symbol file.
#[derive(Clone, Debug, Default)]
pub struct SymFile {
    /// Operating system named in the `MODULE` header.
    pub os: String,
    /// Architecture named in the `MODULE` header.
    pub arch: String,
    /// Debug file name named in the `MODULE` header.
    pub module_name: String,
    /// Source paths by file id.
    pub files: BTreeMap<u64, String>,
    /// Inlined callee names by origin id.
    pub inline_origins: BTreeMap<u64, String>,
    /// Functions in file order.
    pub functions: Vec<Function>,
    /// Public symbols in file order.
    pub publics: Vec<PublicSymbol>,
}

impl SymFile {
    /// Parses a Breakpad symbol file.
    ///
    /// The `MODULE` header must be the first non-empty line and its id must
    /// match `expected_id`, otherwise parsing fails with
    /// [`SymErrorKind::BadDebugId`]. Unknown directives (including all
    /// `STACK` and `INFO` records) are skipped. Line and `INLINE` records
    /// outside of a `FUNC` are ignored.
    pub fn parse(expected_id: &DebugId, data: &[u8]) -> Result<Self, SymError> {
        let mut sym = SymFile::default();
        let mut current_func: Option<Function> = None;
        let mut line_no: u64 = 0;
        let mut seen_module = false;

        for raw_line in Lines::new(data) {
            line_no += 1;
            if raw_line.is_empty() {
                continue;
            }

            let line = str::from_utf8(raw_line)
                .map_err(|e| SymError::new(SymErrorKind::BadEncoding, line_no, e))?;

            if !seen_module {
                let record = parsing::module_record(line)
                    .map_err(|e| SymError::new(SymErrorKind::MissingModule, line_no, e))?;

                let id: DebugId = record
                    .id
                    .parse()
                    .map_err(|_| SymError::bare(SymErrorKind::BadDebugId, line_no))?;
                if &id != expected_id {
                    return Err(SymError::bare(SymErrorKind::BadDebugId, line_no));
                }

                sym.os = record.os.to_owned();
                sym.arch = record.arch.to_owned();
                sym.module_name = record.name.to_owned();
                seen_module = true;
                continue;
            }

            if line.starts_with("FUNC ") {
                let record =
                    parsing::func_record(line).map_err(|e| malformed(e, line_no))?;
                if let Some(func) = current_func.take() {
                    sym.functions.push(func);
                }
                current_func = Some(Function {
                    address: record.address,
                    size: record.size,
                    name: record.name.to_owned(),
                    lines: Vec::new(),
                    inlines: Vec::new(),
                });
            } else if line.starts_with("INLINE_ORIGIN ") {
                let record =
                    parsing::inline_origin_record(line).map_err(|e| malformed(e, line_no))?;
                sym.inline_origins.insert(record.id, record.name.to_owned());
            } else if line.starts_with("INLINE ") {
                let record =
                    parsing::inline_record(line).map_err(|e| malformed(e, line_no))?;
                match current_func {
                    Some(ref mut func) => func.inlines.push(InlineInfo {
                        depth: record.depth,
                        call_line: record.call_line,
                        call_file_id: record.call_file_id,
                        origin_id: record.origin_id,
                        ranges: record.ranges,
                    }),
                    None => {
                        tracing::debug!(line_no, "INLINE record outside of FUNC, skipping")
                    }
                }
            } else if line.starts_with("FILE ") {
                let record =
                    parsing::file_record(line).map_err(|e| malformed(e, line_no))?;
                sym.files.insert(record.id, record.name.to_owned());
            } else if line.starts_with("PUBLIC ") {
                let record =
                    parsing::public_record(line).map_err(|e| malformed(e, line_no))?;
                sym.publics.push(PublicSymbol {
                    address: record.address,
                    name: record.name.to_owned(),
                });
            } else if line.starts_with("MODULE ")
                || line.starts_with("STACK ")
                || line.starts_with("INFO ")
            {
                // Duplicate headers and unwind records are not part of the
                // model.
            } else if starts_with_hex_token(line) {
                if let Some(ref mut func) = current_func {
                    let record =
                        parsing::line_record(line).map_err(|e| malformed(e, line_no))?;
                    func.lines.push(LineInfo {
                        address: record.address,
                        size: record.size,
                        line: record.line,
                        file_id: record.file_id,
                    });
                }
            } else {
                // Unknown directives are skipped silently.
            }
        }

        if let Some(func) = current_func.take() {
            sym.functions.push(func);
        }

        if !seen_module {
            return Err(SymError::bare(SymErrorKind::MissingModule, line_no));
        }

        Ok(sym)
    }
}

fn malformed(source: ParseRecordError, line: u64) -> SymError {
    SymError::new(SymErrorKind::Malformed, line, source)
}

/// Whether the line begins with a complete hex token, i.e. looks like a
/// line record rather than an unknown directive that merely starts with a
/// hex letter.
fn starts_with_hex_token(line: &str) -> bool {
    match line.split_whitespace().next() {
        Some(token) => token.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn id(s: &str) -> DebugId {
        s.parse().unwrap()
    }

    const SIMPLE: &str = "\
MODULE Linux x86_64 492E2DD23CC306CA9C494EEF1533A3810 crash
FILE 7 src/foo.cpp
FUNC 1200 100 0 foo
1234 8 42 7
PUBLIC 2000 0 bar
";

    #[test]
    fn parse_simple_file() {
        let sym = SymFile::parse(&id("492E2DD23CC306CA9C494EEF1533A3810"), SIMPLE.as_bytes())
            .unwrap();

        assert_eq!(sym.module_name, "crash");
        assert_eq!(sym.files[&7], "src/foo.cpp");
        assert_eq!(sym.functions.len(), 1);

        let func = &sym.functions[0];
        assert_eq!(func.address, 0x1200);
        assert_eq!(func.size, 0x100);
        assert_eq!(func.name, "foo");
        assert_eq!(
            func.lines,
            vec![LineInfo {
                address: 0x1234,
                size: 8,
                line: 42,
                file_id: 7
            }]
        );

        assert_eq!(sym.publics.len(), 1);
        assert_eq!(sym.publics[0].address, 0x2000);
    }

    #[test]
    fn parse_case_insensitive_debug_id() {
        let sym = SymFile::parse(&id("492e2dd23cc306ca9c494eef1533a3810"), SIMPLE.as_bytes());
        assert!(sym.is_ok());
    }

    #[test]
    fn parse_mismatched_debug_id() {
        let err = SymFile::parse(&id("DEADBEEF"), SIMPLE.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), SymErrorKind::BadDebugId);
        assert_eq!(err.line(), 1);
        assert!(err.kind().is_permanent());
    }

    #[test]
    fn parse_missing_module_header() {
        let err =
            SymFile::parse(&id("DEADBEEF"), b"FUNC 1200 100 0 foo\n").unwrap_err();
        assert_eq!(err.kind(), SymErrorKind::MissingModule);
    }

    #[test]
    fn parse_empty_input() {
        let err = SymFile::parse(&id("DEADBEEF"), b"").unwrap_err();
        assert_eq!(err.kind(), SymErrorKind::MissingModule);
    }

    #[test]
    fn parse_malformed_line_record() {
        let data = "\
MODULE Linux x86_64 DEADBEEF crash
FUNC 1200 100 0 foo
1234 8 fortytwo 7
";
        let err = SymFile::parse(&id("DEADBEEF"), data.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), SymErrorKind::Malformed);
        assert_eq!(err.line(), 3);
        assert!(!err.kind().is_permanent());
    }

    #[test]
    fn parse_inline_records() {
        let data = "\
MODULE Linux x86_64 DEADBEEF crash
FILE 0 a.cpp
FILE 1 b.cpp
INLINE_ORIGIN 0 inlined_callee()
FUNC 1000 100 0 outer()
INLINE 0 10 1 0 1010 20
1000 10 5 0
1010 20 99 1
";
        let sym = SymFile::parse(&id("DEADBEEF"), data.as_bytes()).unwrap();
        let func = &sym.functions[0];
        assert_eq!(func.inlines.len(), 1);
        assert_eq!(func.inlines[0].origin_id, 0);
        assert_eq!(func.inlines[0].ranges, vec![(0x1010, 0x20)]);
        assert_eq!(sym.inline_origins[&0], "inlined_callee()");
        assert_eq!(func.lines.len(), 2);
    }

    #[test]
    fn parse_skips_foreign_records() {
        let data = "\
MODULE windows x86_64 DEADBEEF xul.pdb
INFO CODE_ID 5F0A8AEE9000 xul.dll
FILE 0 a.cpp
STACK CFI INIT 1880 2d .cfa: $rsp 8 + .ra: .cfa -8 + ^
STACK CFI 1888 .cfa: $rsp 16 +
FRILL unknown directive
FUNC 1000 10 0 f
1000 10 1 0
EXTRA_DIRECTIVE 1 2 3 4
STACK WIN 4 371a c 0 0 0 0 0 0 1 $T0 .raSearch =
";
        let sym = SymFile::parse(&id("DEADBEEF"), data.as_bytes()).unwrap();
        assert_eq!(sym.functions.len(), 1);
        assert_eq!(sym.functions[0].lines.len(), 1);
    }

    #[test]
    fn parse_line_record_outside_func_is_skipped() {
        let data = "\
MODULE Linux x86_64 DEADBEEF crash
1234 8 42 7
FUNC 1200 100 0 foo
";
        let sym = SymFile::parse(&id("DEADBEEF"), data.as_bytes()).unwrap();
        assert_eq!(sym.functions.len(), 1);
        assert!(sym.functions[0].lines.is_empty());
    }

    #[test]
    fn parse_crlf_line_endings() {
        let data = "MODULE Linux x86_64 DEADBEEF crash\r\nFUNC 1200 100 0 foo\r\n";
        let sym = SymFile::parse(&id("DEADBEEF"), data.as_bytes()).unwrap();
        assert_eq!(sym.functions[0].name, "foo");
    }

    #[test]
    fn lines_iterator_yields_all_lines() {
        let lines: Vec<_> = Lines::new(b"a\nbb\r\n\nccc").collect();
        assert_eq!(lines, vec![&b"a"[..], &b"bb"[..], &b""[..], &b"ccc"[..]]);
    }
}
