//! Domain primitives shared by the catalog and the indexer: integer ids, the
//! aggregate contract, optimistic concurrency, and the domain error type.
//!
//! No IO and no async here.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CategoryId, ManufacturerId};
