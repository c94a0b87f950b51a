//! idmesh core library
//!
//! A node on the mesh publishes a signed, self-describing identity (display
//! name, bio, location, avatar, and the set of network-node keys it vouches
//! for) and propagates it through epidemic gossip so other nodes can discover
//! and verify it.
//!
//! ## Architecture
//!
//! ```text
//! profile edits ──┐
//!                 v
//!          ┌──────────────────┐  signed RawMessage  ┌──────────────────┐
//!          │ AnnounceManager  │ ──────────────────> │ IdentityHandler  │ <─> daemon socket
//!          │ (debounce, sign) │ <── NodeKeyAdded ── │ (bind handshake, │
//!          └────────┬─────────┘                     │  3 gossip loops) │
//!                   │                               └────────┬─────────┘
//!                   v                                        v
//!               ┌────────────────────────────────────────────────┐
//!               │ Store (SQLite: identity, announce, profile,    │
//!               │        nodes, day-counter expiry)              │
//!               └────────────────────────────────────────────────┘
//! ```
//!
//! The three pieces share one correctness protocol: the debounce plus the
//! byte-stable signature-reuse check keep an unchanged identity from being
//! re-signed, the store's freshness-gated upsert keeps older writes from
//! clobbering newer ones, and everything the announce manager owns is
//! persisted so a restart picks up exactly where the last run stopped.

pub mod announce;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod profile;
pub mod store;

// Re-exports
pub use announce::AnnounceManager;
pub use config::{AnnounceConfig, HandlerConfig};
pub use error::{MeshError, MeshResult};
pub use events::ChangeEvent;
pub use handler::IdentityHandler;
pub use profile::Profile;
pub use store::{IdentityRecord, Store, StoredAnnounce};
