//! Infrastructure adapters for task storage and event transport.

pub mod store;
pub mod transport;

pub use store::InMemoryStore;
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use transport::InMemoryTransport;
#[cfg(feature = "postgres")]
pub use transport::PgNotifyTransport;
