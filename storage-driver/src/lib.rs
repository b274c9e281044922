//! Contract between the registry storage core and its backends.
//!
//! This crate defines the narrow interface a storage backend must implement
//! to hold registry data: a flat key/value byte store addressed by UTF-8
//! paths, with streaming reads and writes, enumeration, atomic renames and
//! optional redirect URLs. The registry core is written entirely against
//! [`Driver`]; concrete backends live in the `storage` crate.

mod driver;
mod error;
pub mod retry;

pub use driver::Driver;
pub use driver::FileInfo;
pub use driver::FileWriter;
pub use driver::Reader;
pub use driver::UrlOptions;
pub use driver::WalkControl;
pub use error::StorageError;
pub use error::StorageErrorKind;
