//! Cross-process notification transports.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{InMemoryTransport, DEFAULT_MAX_PAYLOAD_BYTES};
#[cfg(feature = "postgres")]
pub use postgres::PgNotifyTransport;
