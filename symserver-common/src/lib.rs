//! Common functionality for `symserver`.
//!
//! This crate exposes the key types shared by all other symserver crates:
//!
//!  - [`DebugId`]: The build-unique identifier of a module, as found in the
//!    Breakpad `MODULE` header and in symbolication requests.
//!  - [`ModuleKey`]: The `(debug_file, debug_id)` pair that canonically names
//!    a module throughout the service.

#![warn(missing_docs)]

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// The maximum accepted length of a debug id, in hex characters.
///
/// Breakpad ids are a 32 character UUID plus up to 8 characters of age. Some
/// producers emit truncated ids, which are accepted as long as they are
/// plain hex.
const DEBUG_ID_MAX_LEN: usize = 40;

/// An error returned when parsing an invalid [`DebugId`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("invalid debug id")]
pub struct ParseDebugIdError;

/// A unique identifier of a module's debug information.
///
/// Debug ids are case-insensitive hex strings. They are normalized to
/// uppercase on parse, so two ids that differ only in case compare equal.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DebugId(String);

impl DebugId {
    /// Returns the normalized (uppercase hex) textual form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DebugId {
    type Err = ParseDebugIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() || input.len() > DEBUG_ID_MAX_LEN {
            return Err(ParseDebugIdError);
        }
        if !input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseDebugIdError);
        }
        Ok(DebugId(input.to_ascii_uppercase()))
    }
}

impl fmt::Display for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An error returned when constructing an invalid [`ModuleKey`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InvalidModuleKey {
    /// The debug file name is empty or contains path separators.
    #[error("invalid debug file name")]
    DebugFile,
    /// The debug id is not a hex identifier.
    #[error("invalid debug id")]
    DebugId,
}

impl From<ParseDebugIdError> for InvalidModuleKey {
    fn from(_: ParseDebugIdError) -> Self {
        InvalidModuleKey::DebugId
    }
}

/// The canonical name of a module: its debug file name and debug id.
///
/// This pair is the cache key and download key used throughout the service.
/// The debug file name is guaranteed to be non-empty and free of path
/// separators, so it is safe to use as a path segment.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModuleKey {
    debug_file: String,
    debug_id: DebugId,
}

impl ModuleKey {
    /// Creates a module key, validating both parts.
    pub fn new(debug_file: &str, debug_id: &str) -> Result<Self, InvalidModuleKey> {
        if debug_file.is_empty() || debug_file.contains(['/', '\\', '\0']) {
            return Err(InvalidModuleKey::DebugFile);
        }
        Ok(ModuleKey {
            debug_file: debug_file.to_owned(),
            debug_id: debug_id.parse()?,
        })
    }

    /// The debug file name, e.g. `xul.pdb`.
    pub fn debug_file(&self) -> &str {
        &self.debug_file
    }

    /// The normalized debug id.
    pub fn debug_id(&self) -> &DebugId {
        &self.debug_id
    }

    /// The file name of the Breakpad symbol artifact for this module.
    ///
    /// Symbol stores replace a final `.pdb` extension with `.sym` and append
    /// `.sym` to all other names: `xul.pdb` becomes `xul.sym`, while
    /// `libxul.so` becomes `libxul.so.sym`.
    pub fn sym_filename(&self) -> String {
        match self
            .debug_file
            .strip_suffix(".pdb")
            .or_else(|| self.debug_file.strip_suffix(".PDB"))
        {
            Some(stem) if !stem.is_empty() => format!("{stem}.sym"),
            _ => format!("{}.sym", self.debug_file),
        }
    }

    /// A stable hex fingerprint of this key and a cache format version.
    ///
    /// The fingerprint is the identity of a cache entry: two keys share a
    /// fingerprint if and only if file, id and format version all match.
    pub fn fingerprint(&self, format_version: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.debug_file.as_bytes());
        hasher.update(b"/");
        hasher.update(self.debug_id.as_str().as_bytes());
        hasher.update(b"/");
        hasher.update(format_version.to_le_bytes());
        let digest = hasher.finalize();

        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use fmt::Write;
            let _ = write!(&mut out, "{byte:02x}");
        }
        out
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.debug_file, self.debug_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_id_normalizes_case() {
        let id: DebugId = "deadbeef".parse().unwrap();
        assert_eq!(id.as_str(), "DEADBEEF");
        let other: DebugId = "DeAdBeEf".parse().unwrap();
        assert_eq!(id, other);
    }

    #[test]
    fn debug_id_rejects_garbage() {
        assert!("".parse::<DebugId>().is_err());
        assert!("xyz".parse::<DebugId>().is_err());
        assert!("44E4EC8C2F41492B9369D6B9A059577C2!".parse::<DebugId>().is_err());
        assert!("f".repeat(41).parse::<DebugId>().is_err());
    }

    #[test]
    fn module_key_rejects_path_separators() {
        assert_eq!(
            ModuleKey::new("../etc/passwd", "DEADBEEF").unwrap_err(),
            InvalidModuleKey::DebugFile
        );
        assert_eq!(
            ModuleKey::new("a\\b.pdb", "DEADBEEF").unwrap_err(),
            InvalidModuleKey::DebugFile
        );
        assert_eq!(
            ModuleKey::new("", "DEADBEEF").unwrap_err(),
            InvalidModuleKey::DebugFile
        );
    }

    #[test]
    fn sym_filename_replaces_pdb_suffix() {
        let key = ModuleKey::new("xul.pdb", "44E4EC8C2F41492B9369D6B9A059577C2").unwrap();
        assert_eq!(key.sym_filename(), "xul.sym");

        let key = ModuleKey::new("libxul.so", "DEADBEEF").unwrap();
        assert_eq!(key.sym_filename(), "libxul.so.sym");

        let key = ModuleKey::new(".pdb", "DEADBEEF").unwrap();
        assert_eq!(key.sym_filename(), ".pdb.sym");
    }

    #[test]
    fn fingerprint_is_stable_and_version_scoped() {
        let key = ModuleKey::new("xul.pdb", "deadbeef").unwrap();
        let upper = ModuleKey::new("xul.pdb", "DEADBEEF").unwrap();
        assert_eq!(key.fingerprint(1), upper.fingerprint(1));
        assert_ne!(key.fingerprint(1), key.fingerprint(2));
        assert_eq!(key.fingerprint(1).len(), 64);
    }
}
