//! Pure utility functions.
//!
//! Process bootstrap and retry policies shared across the crate.

pub mod bootstrap;
pub mod retry;
