//! # sideline-core
//!
//! Shared primitives for the sideline phase orchestration engine.
//!
//! - **Storage**: a versioned document store with single-key compare-and-set
//! - **Clock**: injectable time source for deterministic tests
//! - **Observability**: logging initialization and span helpers
//! - **Errors**: shared error type and result alias
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use sideline_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let store = MemoryStore::new();
//! let outcome = store
//!     .compare_and_set("phase-state/2026-02-28/analytics", Precondition::Absent, Bytes::new())
//!     .await?;
//! assert!(outcome.is_committed());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::storage::{CasOutcome, DocumentStore, MemoryStore, Precondition, VersionedDoc};
}

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use storage::{CasOutcome, DocumentStore, MemoryStore, Precondition, VersionedDoc};
