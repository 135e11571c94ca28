//! Hearing Sync pending request store
//!
//! The durable retry ledger shared by the message dispatcher and the
//! escalation scheduler.

pub mod error;
pub mod repository;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{Result, StoreError};
pub use repository::PendingRequestRepository;

#[cfg(feature = "sqlite")]
pub use sqlite::SqlitePendingRequestRepository;

#[cfg(feature = "postgres")]
pub use postgres::PostgresPendingRequestRepository;
