//! Process-wide tracing setup shared by toolhub binaries.

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Initialize process-wide observability with the `info` default filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with_default("info");
}
