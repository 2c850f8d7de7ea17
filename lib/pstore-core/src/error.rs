//! Error kinds surfaced by the store's public API.
//!
//! Every fallible operation in this crate returns [`Result<T, Error>`](Error). There is no
//! silent recovery anywhere in the core: a caller either gets `Ok` or a typed reason.

use std::path::PathBuf;

use snafu::Snafu;

/// The store's unified error type.
///
/// Constructed through `snafu` context selectors (`HeaderCorruptSnafu.fail()`, and so on) at
/// the point of failure, the same way the teacher crate's disk-buffer error types are built.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A signature, CRC, or structural invariant failed while validating a header.
    #[snafu(display("header is corrupt: {reason}"))]
    HeaderCorrupt { reason: String },

    /// The header's size or major/minor version did not match what this build expects.
    #[snafu(display(
        "header version mismatch: found {found_major}.{found_minor} (size {found_size}), \
         expected {expected_major}.{expected_minor} (size {expected_size})"
    ))]
    HeaderVersionMismatch {
        found_major: u16,
        found_minor: u16,
        found_size: u32,
        expected_major: u16,
        expected_minor: u16,
        expected_size: u32,
    },

    /// `sync(revision)` could not resolve the requested revision in the visible chain.
    #[snafu(display("unknown revision {revision}"))]
    UnknownRevision { revision: u64 },

    /// A typed read/write address was not aligned for the element type requested.
    #[snafu(display("address {address:#x} is not aligned to {align}"))]
    BadAlignment { address: u64, align: usize },

    /// A `read` returned fewer bytes than requested before reaching end-of-file.
    #[snafu(display("short read: wanted {wanted} bytes, got {got}"))]
    DidNotReadNumberOfBytesRequested { wanted: usize, got: usize },

    /// The file was required to exist (e.g. `writable_no_create`) but did not.
    #[snafu(display("store not found: {}", path.display()))]
    NotFound { path: PathBuf },

    /// An exchange-layer token failed to decode as base64. Never produced by this crate's core;
    /// retained so downstream exchange/import code built against this crate shares one error type.
    #[snafu(display("invalid base64"))]
    BadBase64,

    /// An exchange-layer token failed to parse as a UUID.
    #[snafu(display("invalid uuid"))]
    BadUuid,

    /// An exchange-layer token failed to parse as a digest.
    #[snafu(display("invalid digest"))]
    BadDigest,

    /// A non-blocking lock attempt could not acquire the lock immediately.
    #[snafu(display("would block acquiring lock"))]
    WouldBlock,

    /// The underlying OS call failed.
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl Error {
    /// The raw OS error number, when this is an [`Error::Io`] and the source carried one.
    pub fn os_errno(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
