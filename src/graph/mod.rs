//! The graph executor (`spec.md` §4.3): materialises parsed commands against
//! a relational-backed property graph. `GraphRepo` is the transactional
//! interface the rest of the crate depends on, a trait behind `Arc<dyn ...>`
//! targeting the literal relational schema of §4.7 directly rather than
//! routing through Apache AGE's embedded Cypher function.

pub mod memory;
pub mod postgres;

use crate::error::PropolisError;
use crate::model::{Command, ExecResult};

#[async_trait::async_trait]
pub trait GraphRepo: Send + Sync {
    /// Executes one command within a single transaction: all reads and
    /// writes happen inside it, committing on success and rolling back on
    /// any fault (including `MultiMatch`).
    async fn execute(&self, command: Command) -> Result<ExecResult, PropolisError>;

    /// Liveness probe for the `/health` endpoint.
    async fn ping(&self) -> anyhow::Result<()>;
}

pub use memory::MemoryGraphRepo;
pub use postgres::PgGraphRepo;
