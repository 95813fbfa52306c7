use thiserror::Error;

/// An error encountered while parsing a SymCache buffer.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buffer is too small to contain a SymCache header.
    #[error("buffer is too small for a symcache header")]
    HeaderTooSmall,

    /// The header does not start with the SymCache magic.
    #[error("not a symcache file")]
    WrongFormat,

    /// The format version does not match the current version.
    ///
    /// Callers treat this as a cold cache miss and rebuild the blob.
    #[error("unsupported symcache version")]
    WrongVersion,

    /// The section counts in the header do not match the buffer length.
    #[error("symcache sections do not match the buffer length")]
    BadFormatLength,
}
