//! # Storage drivers
//!
//! The [`Driver`] trait abstracts over the places an origin node can keep
//! its objects: memory, the local filesystem, or a temporary directory.
//! Errors from every driver are reported as [`StorageError`], tagged with a
//! [`StorageErrorKind`] so callers can tell a missing object apart from a
//! full disk or an unreachable backend.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorKind;
