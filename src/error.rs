//! Error types surfaced by the core engine to its host.
//!
//! Mirrors the hand-rolled `BaseError`-style error taxonomy used throughout
//! this crate's lineage (one flat enum per concern, `Debug`-bound, no
//! `std::error::Error` dependency) rather than reaching for a derive-macro
//! based error crate.

use core::fmt::{self, Display, Formatter};

/// The kinds of failure the core can report, as enumerated in the on-disk
/// format's error-handling design.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The reference map or inode bitmap is exhausted.
    NoSpace,
    /// A buffer read or write failed.
    Io,
    /// An out-of-range block/inode number or otherwise malformed request.
    InvalidArgument,
    /// Attempt to read an inode whose on-disk `nlinks` is zero.
    Stale,
    /// `rmdir` on a non-empty directory.
    NotEmpty,
    /// A link name already exists in the target directory.
    Exists,
    /// Name lookup failed.
    NotFound,
    /// A name exceeds 255 bytes, or a symlink target exceeds one chunk.
    NameTooLong,
    /// A directory chunk failed a structural check.
    Corrupt,
}

/// An error returned by the core engine.
///
/// Carries an optional static detail string instead of an owned `String`,
/// so construction never allocates.
#[derive(Clone, Copy, Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub detail: Option<&'static str>,
}

impl Error {
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    #[must_use]
    pub const fn with_detail(kind: ErrorKind, detail: &'static str) -> Self {
        Self {
            kind,
            detail: Some(detail),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.detail {
            Some(detail) => write!(f, "{:?}: {detail}", self.kind),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

/// Shorthand constructors, one per [`ErrorKind`], used pervasively at call
/// sites (`Err(Error::no_space())`, `Err(Error::corrupt())`). Use
/// [`Error::with_detail`] directly when a static detail string is useful.
macro_rules! error_ctor {
    ($name: ident, $variant: ident) => {
        impl Error {
            #[must_use]
            pub const fn $name() -> Self {
                Self::new(ErrorKind::$variant)
            }
        }
    };
}

error_ctor!(no_space, NoSpace);
error_ctor!(io, Io);
error_ctor!(invalid_argument, InvalidArgument);
error_ctor!(stale, Stale);
error_ctor!(not_empty, NotEmpty);
error_ctor!(exists, Exists);
error_ctor!(not_found, NotFound);
error_ctor!(name_too_long, NameTooLong);
error_ctor!(corrupt, Corrupt);

/// Result type used throughout the core engine.
pub type Result<T> = core::result::Result<T, Error>;

/// Return type for operations that may fail but produce no value on
/// success.
pub type CanFail = Result<()>;
