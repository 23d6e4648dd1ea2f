//! Hearth Core - Household Domain Types
//!
//! Pure data structures shared by every Hearth crate. Nothing in here does
//! I/O; the sync layer owns the network and the async runtime.

pub mod collection;
pub mod entities;
pub mod error;
pub mod events;
pub mod identity;

pub use collection::DomainCollection;
pub use entities::{
    CacheEntity, Domain, Meal, Member, MemberRole, Quest, QuestStatus, Routine, StoreItem, Task,
    WishlistEntry,
};
pub use error::{CoreError, CoreResult};
pub use events::{points_event, InvalidationEvent, PushFrame, POINTS_EVENT_PREFIX};
pub use identity::{canonicalize, EntityId, Identity, Timestamp};
