//! Hearing Sync message routing
//!
//! - [`client`]: downstream scheduling API client
//! - [`classifier`]: failure taxonomy and dead-letter reasons
//! - [`delivery`]: downstream call plus sync-result publishing, shared with the scheduler
//! - [`dispatcher`]: per-message ledger handling and disposition
//! - [`worker`]: queue polling loop

pub mod classifier;
pub mod client;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod worker;

pub use classifier::{classify, ErrorKind};
pub use client::{AccessToken, HearingApiClient, HearingResponse, HttpHearingApiClient};
pub use delivery::HearingDelivery;
pub use dispatcher::{DispatchOutcome, DispatcherConfig, MessageDispatcher, RoutingKey};
pub use error::{DispatchError, DownstreamError};
pub use worker::{QueueWorker, WorkerConfig};
