//! # ctxgraph Testkit
//!
//! Test utilities for ctxgraph.
//!
//! This crate provides:
//! - Coordinator harnesses over memory and file stores
//! - Helpers for running code on worker threads and catching usage faults
//! - Property-based test generators using proptest
//! - A lane stress runner
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ctxgraph_testkit::prelude::*;
//!
//! #[test]
//! fn visits_are_merged() {
//!     let harness = TestHarness::memory();
//!     let id = seed_page(&harness, 5);
//!     harness.wait_for_merges();
//!     let page = harness.main_context().object(id).unwrap().unwrap();
//!     assert_eq!(page.get("visits").as_integer(), Some(5));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
