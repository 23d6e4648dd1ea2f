//! Hearth Sync - client-side state synchronization.
//!
//! Keeps a local mirror of server-owned household data consistent: a retrying
//! request gateway, a parallel-loading cache, a realtime invalidation channel
//! and optimistic mutations with rollback.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod optimistic;
pub mod realtime;
pub mod session;
pub mod telemetry;

pub use cache::{CacheSnapshot, CacheStore, LoadReport};
pub use client::{ClientTasks, HouseholdClient};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use gateway::{ErrorKind, GatewayError, RequestGateway};
pub use optimistic::{OptimisticExecutor, OptimisticOperation, OptimisticState};
pub use realtime::{ChannelState, RealtimeChannel, SubscriptionRegistry};
pub use session::{Session, SessionStore};
