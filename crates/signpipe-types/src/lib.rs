//! Pure data types for signpipe — item outcomes, signer errors, reports.
//!
//! This crate is a leaf dependency with no async runtime and no hashing code.
//! It exists so that consumers (the CLI, report readers) can work with
//! signpipe's results without pulling in signpipe-kernel's runtime deps.

pub mod error;
pub mod outcome;
pub mod report;

// Flat re-exports for convenience
pub use error::*;
pub use outcome::*;
pub use report::*;
