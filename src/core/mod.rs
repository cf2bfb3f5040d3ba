//! In-memory authoritative sale store and index helpers.

/// Helper index aliases.
pub mod indices;
/// Authoritative per-outlet sale store and transition engine.
pub mod store;
