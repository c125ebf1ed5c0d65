//! Persistence: repository ports and their adapters.

pub mod memory;
pub mod ports;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{InMemoryStore, StoreOp};
pub use ports::PacsStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
