//! Tollgate Consolidator
//!
//! The ticker-driven background worker that drains unprocessed egress
//! batches: it fetches each batch's receipt bundle from the submitting
//! node, validates every retrieval receipt against its delegation
//! chain, attributes bytes to spaces, and persists a signed
//! consolidation receipt with exactly-once semantics.

pub mod engine;
mod handler;
#[cfg(test)]
mod tests;

pub use engine::{Consolidator, ConsolidatorError};
