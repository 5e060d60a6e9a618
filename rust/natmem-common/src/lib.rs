//! Core definitions relied upon by all natmem-* crates: the shared error type
//! and the argument/range verification helpers.

pub mod error;
pub mod result;

pub use error::{Error, ErrorKind};
pub use result::Result;
