//! Collaborator stores for topic discovery.
//!
//! Three seams: the vector index (embeddings + per-point payload), the relational
//! article tables, and the run store (durable run state and run outputs).
//! Postgres implementations live here; in-memory ones sit behind `test-utils`.

pub mod articles;
pub mod error;
pub mod migrate;
pub mod runs;
pub mod traits;
pub mod vector;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use articles::PgArticleStore;
pub use error::StoreError;
pub use runs::PgRunStore;
pub use traits::{ArticleStore, RunStore, VectorIndex, VectorPoint};
pub use vector::PgVectorIndex;
