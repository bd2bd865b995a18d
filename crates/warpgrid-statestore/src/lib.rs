//! warpgrid-statestore — state store adapter over graph and column backends.
//!
//! Exposes one CRUD + bulk + query contract ([`StateStoreAdapter`]) over a
//! graph database speaking nGQL and a wide-column database speaking CQL.
//!
//! # Architecture
//!
//! ```text
//! StateStoreAdapter      lifecycle, key validation, response mapping
//!   ├─ BulkCoordinator   threshold, batch attempt, individual fallback
//!   └─ BackendStore      one leased session per logical operation
//!        ├─ ConnectionManager   bounded pool, liveness probe, retry/backoff
//!        ├─ QueryTranslator     nGQL or CQL statements + row decoding
//!        └─ ConcurrencyController   etag stamping and validation
//! ```
//!
//! Drivers plug in through [`SessionFactory`]. The `scylla` feature ships a
//! CQL factory; graph drivers and test doubles implement the trait directly.
//!
//! Every operation takes an [`OpContext`] carrying cancellation and an
//! optional deadline, honoured at every blocking point.

pub mod adapter;
pub mod bulk;
pub mod config;
pub mod context;
pub mod error;
pub mod etag;
pub mod pool;
pub mod retry;
#[cfg(feature = "scylla")]
pub mod scylla;
pub mod statement;
pub mod store;
pub mod translate;
pub mod types;

pub use adapter::StateStoreAdapter;
pub use config::{BackendKind, StoreConfig};
pub use context::OpContext;
pub use error::{StoreError, StoreResult};
pub use pool::{PoolStats, Session, SessionFactory};
pub use types::*;
