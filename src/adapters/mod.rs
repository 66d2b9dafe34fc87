pub mod memory;
pub mod postgres;
pub mod store;
pub mod upstream;

pub use memory::{MemoryLockBackend, MemoryMatchStore};
pub use postgres::{PgLockBackend, PgMatchStore};
pub use store::{CandidateQuery, MatchStore, PersistResult};
pub use upstream::{HttpMatchSource, MatchSource, UpstreamMatch};

#[cfg(test)]
pub use upstream::MockMatchSource;
