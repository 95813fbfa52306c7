//! Line-level parsers for the individual Breakpad record kinds.
//!
//! Each parser consumes exactly one record line (without the trailing
//! newline) and borrows all string fields from the input.

use std::fmt;

/// Placeholder used for missing function or symbol names.
const UNKNOWN_NAME: &str = "<unknown>";

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseRecordErrorKind {
    FileRecord,
    FuncRecord,
    Id,
    InlineOriginRecord,
    InlineRecord,
    LineRecord,
    ModuleRecord,
    NumDec,
    NumHex,
    PublicRecord,
}

impl fmt::Display for ParseRecordErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileRecord => write!(f, "Invalid file record"),
            Self::FuncRecord => write!(f, "Invalid func record"),
            Self::Id => write!(f, "Invalid id"),
            Self::InlineOriginRecord => write!(f, "Invalid inline origin record"),
            Self::InlineRecord => write!(f, "Invalid inline record"),
            Self::LineRecord => write!(f, "Invalid line record"),
            Self::ModuleRecord => write!(f, "Invalid module record"),
            Self::NumDec => write!(f, "Expected decimal number"),
            Self::NumHex => write!(f, "Expected hex number"),
            Self::PublicRecord => write!(f, "Invalid public record"),
        }
    }
}

/// An error parsing a single Breakpad record line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseRecordError {
    kind: ParseRecordErrorKind,
}

impl ParseRecordError {
    pub fn kind(&self) -> ParseRecordErrorKind {
        self.kind
    }
}

impl fmt::Display for ParseRecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for ParseRecordError {}

impl From<ParseRecordErrorKind> for ParseRecordError {
    fn from(kind: ParseRecordErrorKind) -> Self {
        ParseRecordError { kind }
    }
}

type Result<T, E = ParseRecordError> = std::result::Result<T, E>;

fn num_hex_64(input: &str) -> Result<u64> {
    u64::from_str_radix(input, 16).map_err(|_| ParseRecordErrorKind::NumHex.into())
}

fn num_dec_64(input: &str) -> Result<u64> {
    input
        .parse::<u64>()
        .map_err(|_| ParseRecordErrorKind::NumDec.into())
}

fn module_id(input: &str) -> Result<&str> {
    if !input.is_empty() && input.len() <= 40 && input.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(input)
    } else {
        Err(ParseRecordErrorKind::Id.into())
    }
}

/// A module record, constituting the header of a Breakpad file.
///
/// Example: `MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 firefox-bin`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModuleRecord<'d> {
    /// Name of the operating system.
    pub os: &'d str,
    /// Name of the CPU architecture.
    pub arch: &'d str,
    /// Breakpad identifier.
    pub id: &'d str,
    /// Name of the original debug file.
    pub name: &'d str,
}

pub fn module_record(input: &str) -> Result<ModuleRecord> {
    let mut current = input
        .strip_prefix("MODULE")
        .ok_or(ParseRecordErrorKind::ModuleRecord)?
        .trim_start();
    let mut parts = current.splitn(4, char::is_whitespace);

    let os = parts.next().ok_or(ParseRecordErrorKind::ModuleRecord)?;

    let arch = parts.next().ok_or(ParseRecordErrorKind::ModuleRecord)?;

    current = parts.next().ok_or(ParseRecordErrorKind::ModuleRecord)?;
    let id = module_id(current)?;

    let name = parts.next().unwrap_or(UNKNOWN_NAME);

    Ok(ModuleRecord { os, arch, id, name })
}

/// A file record, mapping a file id to a source path.
///
/// Example: `FILE 2 /home/jimb/mc/in/browser/app/nsBrowserApp.cpp`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileRecord<'d> {
    /// Breakpad-internal identifier of the file.
    pub id: u64,
    /// The path to the source file.
    pub name: &'d str,
}

pub fn file_record(input: &str) -> Result<FileRecord> {
    debug_assert!(!input.contains('\n'), "Illegal input: {input}");
    let mut current = input
        .strip_prefix("FILE")
        .ok_or(ParseRecordErrorKind::FileRecord)?
        .trim_start();
    let mut parts = current.splitn(2, char::is_whitespace);

    current = parts.next().ok_or(ParseRecordErrorKind::FileRecord)?;
    let id = num_dec_64(current)?;

    let name = parts.next().unwrap_or(UNKNOWN_NAME);

    Ok(FileRecord { id, name })
}

/// An inline origin record, registering the name of an inlined callee.
///
/// Example: `INLINE_ORIGIN 1305 SharedLibraryInfo::Initialize()`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InlineOriginRecord<'d> {
    /// Breakpad-internal identifier of the function.
    pub id: u64,
    /// The function name.
    pub name: &'d str,
}

pub fn inline_origin_record(input: &str) -> Result<InlineOriginRecord> {
    debug_assert!(!input.contains('\n'), "Illegal input: {input}");
    let mut current = input
        .strip_prefix("INLINE_ORIGIN")
        .ok_or(ParseRecordErrorKind::InlineOriginRecord)?
        .trim_start();
    let mut parts = current.splitn(2, char::is_whitespace);

    current = parts.next().ok_or(ParseRecordErrorKind::InlineOriginRecord)?;
    let id = num_dec_64(current)?;

    let name = parts.next().unwrap_or(UNKNOWN_NAME);

    Ok(InlineOriginRecord { id, name })
}

/// A function record, covering the address range `[address, address + size)`.
///
/// Example: `FUNC m c184 30 0 nsQueryInterfaceWithError::operator()(nsID const&, void**) const`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FuncRecord<'d> {
    /// Whether this function was referenced multiple times.
    pub multiple: bool,
    /// The start address relative to the image base.
    pub address: u64,
    /// The size of the function's code in bytes.
    pub size: u64,
    /// The size of the parameters on the runtime stack.
    pub parameter_size: u64,
    /// The function name.
    pub name: &'d str,
}

pub fn func_record(input: &str) -> Result<FuncRecord> {
    debug_assert!(!input.contains('\n'), "Illegal input: {input}");
    let mut current = input
        .strip_prefix("FUNC")
        .ok_or(ParseRecordErrorKind::FuncRecord)?
        .trim_start();

    let multiple = if let Some(rest) = current.strip_prefix('m') {
        current = rest.trim_start();
        true
    } else {
        false
    };

    let mut parts = current.splitn(4, char::is_whitespace);

    current = parts.next().ok_or(ParseRecordErrorKind::FuncRecord)?;
    let address = num_hex_64(current)?;

    current = parts.next().ok_or(ParseRecordErrorKind::FuncRecord)?;
    let size = num_hex_64(current)?;

    current = parts.next().ok_or(ParseRecordErrorKind::FuncRecord)?;
    let parameter_size = num_hex_64(current)?;

    let name = parts.next().unwrap_or(UNKNOWN_NAME);

    Ok(FuncRecord {
        multiple,
        address,
        size,
        parameter_size,
        name,
    })
}

/// A line record, always nested inside a func record.
///
/// Example: `c184 7 59 4`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineRecord {
    /// The start address relative to the image base.
    pub address: u64,
    /// The size of the covered code in bytes.
    pub size: u64,
    /// The source line number (decimal).
    pub line: u64,
    /// The id of the file record this line refers to.
    pub file_id: u64,
}

pub fn line_record(input: &str) -> Result<LineRecord> {
    debug_assert!(!input.contains('\n'), "Illegal input: {input}");
    let mut current = input;
    let mut parts = current.splitn(4, char::is_whitespace);

    current = parts.next().ok_or(ParseRecordErrorKind::LineRecord)?;
    let address = num_hex_64(current)?;

    current = parts.next().ok_or(ParseRecordErrorKind::LineRecord)?;
    let size = num_hex_64(current)?;

    current = parts.next().ok_or(ParseRecordErrorKind::LineRecord)?;
    let line = num_dec_64(current)?;

    current = parts.next().ok_or(ParseRecordErrorKind::LineRecord)?;
    let file_id = num_dec_64(current)?;

    Ok(LineRecord {
        address,
        size,
        line,
        file_id,
    })
}

/// An inline record, always nested inside a func record.
///
/// The record names an inlined call at a nesting depth: the callee is given
/// by an inline origin id, the call site by a line and file id in the next
/// outer frame, and the covered code by one or more address ranges.
///
/// Example: `INLINE 0 3082 52 1410 49200 10`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InlineRecord {
    /// The nesting depth; 0 means inlined directly into the function.
    pub depth: u64,
    /// The source line of the call site, in the next outer frame.
    pub call_line: u64,
    /// The file id of the call site, in the next outer frame.
    pub call_file_id: u64,
    /// The inline origin id naming the inlined callee.
    pub origin_id: u64,
    /// The `(address, size)` ranges covered by this inlined call.
    pub ranges: Vec<(u64, u64)>,
}

pub fn inline_record(input: &str) -> Result<InlineRecord> {
    debug_assert!(!input.contains('\n'), "Illegal input: {input}");
    let current = input
        .strip_prefix("INLINE")
        .ok_or(ParseRecordErrorKind::InlineRecord)?
        .trim_start();
    let mut parts = current.split_whitespace();

    let depth = num_dec_64(parts.next().ok_or(ParseRecordErrorKind::InlineRecord)?)?;
    let call_line = num_dec_64(parts.next().ok_or(ParseRecordErrorKind::InlineRecord)?)?;
    let call_file_id = num_dec_64(parts.next().ok_or(ParseRecordErrorKind::InlineRecord)?)?;
    let origin_id = num_dec_64(parts.next().ok_or(ParseRecordErrorKind::InlineRecord)?)?;

    let mut ranges = Vec::new();
    while let Some(part) = parts.next() {
        let address = num_hex_64(part)?;
        let size = num_hex_64(parts.next().ok_or(ParseRecordErrorKind::InlineRecord)?)?;
        ranges.push((address, size));
    }

    if ranges.is_empty() {
        return Err(ParseRecordErrorKind::InlineRecord.into());
    }

    Ok(InlineRecord {
        depth,
        call_line,
        call_file_id,
        origin_id,
        ranges,
    })
}

/// A public function symbol record.
///
/// Example: `PUBLIC m 2160 0 Public2_1`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublicRecord<'d> {
    /// Whether this symbol was referenced multiple times.
    pub multiple: bool,
    /// The address of this symbol relative to the image base.
    pub address: u64,
    /// The size of the parameters on the runtime stack.
    pub parameter_size: u64,
    /// The function name of the symbol.
    pub name: &'d str,
}

pub fn public_record(input: &str) -> Result<PublicRecord> {
    debug_assert!(!input.contains('\n'), "Illegal input: {input}");
    let mut current = input
        .strip_prefix("PUBLIC")
        .ok_or(ParseRecordErrorKind::PublicRecord)?
        .trim_start();

    let multiple = if let Some(rest) = current.strip_prefix('m') {
        current = rest.trim_start();
        true
    } else {
        false
    };

    let mut parts = current.splitn(3, char::is_whitespace);

    current = parts.next().ok_or(ParseRecordErrorKind::PublicRecord)?;
    let address = num_hex_64(current)?;

    current = parts.next().ok_or(ParseRecordErrorKind::PublicRecord)?;
    let parameter_size = num_hex_64(current)?;

    let name = parts.next().unwrap_or(UNKNOWN_NAME);

    Ok(PublicRecord {
        multiple,
        address,
        parameter_size,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_module_record() {
        let string = "MODULE Linux x86_64 492E2DD23CC306CA9C494EEF1533A3810 crash";
        let record = module_record(string).unwrap();

        insta::assert_debug_snapshot!(record, @r###"
        ModuleRecord {
            os: "Linux",
            arch: "x86_64",
            id: "492E2DD23CC306CA9C494EEF1533A3810",
            name: "crash",
        }
        "###);
    }

    #[test]
    fn parse_module_record_short_id() {
        // One character short of a full breakpad id, missing the age.
        let string = "MODULE Linux x86_64 6216C672A8D33EC9CF4A1BAB8B29D00E libdispatch.so";
        let record = module_record(string).unwrap();
        assert_eq!(record.id, "6216C672A8D33EC9CF4A1BAB8B29D00E");
    }

    #[test]
    fn parse_module_record_bad_id() {
        let string = "MODULE Linux x86_64 NOTHEX firefox-bin";
        assert_eq!(
            module_record(string).unwrap_err().kind(),
            ParseRecordErrorKind::Id
        );
    }

    #[test]
    fn parse_file_record() {
        let string = "FILE 37 /usr/include/libkern/i386/_OSByteOrder.h";
        let record = file_record(string).unwrap();

        insta::assert_debug_snapshot!(record, @r###"
        FileRecord {
            id: 37,
            name: "/usr/include/libkern/i386/_OSByteOrder.h",
        }
        "###);
    }

    #[test]
    fn parse_file_record_space() {
        let string = "FILE 38 /usr/local/src/filename with spaces.c";
        let record = file_record(string).unwrap();
        assert_eq!(record.name, "/usr/local/src/filename with spaces.c");
    }

    #[test]
    fn parse_inline_origin_record() {
        let string = "INLINE_ORIGIN 1305 SharedLibraryInfo::Initialize()";
        let record = inline_origin_record(string).unwrap();

        insta::assert_debug_snapshot!(record, @r###"
        InlineOriginRecord {
            id: 1305,
            name: "SharedLibraryInfo::Initialize()",
        }
        "###);
    }

    #[test]
    fn parse_func_record() {
        let string = "FUNC 1730 1a 0 <name omitted>";
        let record = func_record(string).unwrap();

        insta::assert_debug_snapshot!(record, @r###"
        FuncRecord {
            multiple: false,
            address: 5936,
            size: 26,
            parameter_size: 0,
            name: "<name omitted>",
        }
        "###);
    }

    #[test]
    fn parse_func_record_multiple() {
        let string = "FUNC m 1730 1a 0 <name omitted>";
        let record = func_record(string).unwrap();
        assert!(record.multiple);
        assert_eq!(record.address, 0x1730);
    }

    #[test]
    fn parse_func_record_no_name() {
        let string = "FUNC 0 f 0";
        let record = func_record(string).unwrap();
        assert_eq!(record.name, "<unknown>");
    }

    #[test]
    fn parse_func_record_bad_address() {
        let string = "FUNC xyz 1a 0 foo";
        assert_eq!(
            func_record(string).unwrap_err().kind(),
            ParseRecordErrorKind::NumHex
        );
    }

    #[test]
    fn parse_line_record() {
        let string = "1730 6 93 20";
        let record = line_record(string).unwrap();

        insta::assert_debug_snapshot!(record, @r###"
        LineRecord {
            address: 5936,
            size: 6,
            line: 93,
            file_id: 20,
        }
        "###);
    }

    #[test]
    fn parse_line_record_overflowing_address() {
        let string = "1ffffffffffffffff 6 93 20";
        assert_eq!(
            line_record(string).unwrap_err().kind(),
            ParseRecordErrorKind::NumHex
        );
    }

    #[test]
    fn parse_inline_record() {
        let string = "INLINE 0 3082 52 1410 c034 10";
        let record = inline_record(string).unwrap();

        insta::assert_debug_snapshot!(record, @r###"
        InlineRecord {
            depth: 0,
            call_line: 3082,
            call_file_id: 52,
            origin_id: 1410,
            ranges: [
                (
                    49204,
                    16,
                ),
            ],
        }
        "###);
    }

    #[test]
    fn parse_inline_record_multiple_ranges() {
        let string = "INLINE 6 642 8 207 8bb9 b 8bd1 34";
        let record = inline_record(string).unwrap();
        assert_eq!(record.depth, 6);
        assert_eq!(record.ranges, vec![(0x8bb9, 0xb), (0x8bd1, 0x34)]);
    }

    #[test]
    fn parse_inline_record_no_ranges() {
        let string = "INLINE 0 3082 52 1410";
        assert_eq!(
            inline_record(string).unwrap_err().kind(),
            ParseRecordErrorKind::InlineRecord
        );
    }

    #[test]
    fn parse_public_record() {
        let string = "PUBLIC 5180 0 __clang_call_terminate";
        let record = public_record(string).unwrap();

        insta::assert_debug_snapshot!(record, @r###"
        PublicRecord {
            multiple: false,
            address: 20864,
            parameter_size: 0,
            name: "__clang_call_terminate",
        }
        "###);
    }

    #[test]
    fn parse_public_record_multiple() {
        let string = "PUBLIC m 5180 0 __clang_call_terminate";
        let record = public_record(string).unwrap();
        assert!(record.multiple);
    }

    #[test]
    fn parse_public_record_no_name() {
        let string = "PUBLIC 5180 0";
        let record = public_record(string).unwrap();
        assert_eq!(record.name, "<unknown>");
    }
}
