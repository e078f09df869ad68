use toolhub_core::AggregateId;

/// A committed mutation as downstream consumers see it.
///
/// Facts: never edited once committed. Commit time travels on the envelope,
/// not here.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable name, e.g. "catalog.tool.created".
    fn event_type(&self) -> &'static str;

    /// Payload schema version.
    fn schema_version(&self) -> u32;

    /// Aggregate the mutation belongs to.
    fn aggregate_id(&self) -> AggregateId;

    /// Aggregate version after the mutation; the first one is 1.
    fn version_after(&self) -> u64;
}
