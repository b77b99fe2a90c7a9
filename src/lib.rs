//! # tabsync - Cross-Context Keyed State Synchronization
//!
//! Multiple execution contexts ("tabs") attached to one [`Host`] share
//! named, typed values and observe each other's updates in near real time,
//! with optional durability across reloads.
//!
//! ## Features
//!
//! - **Capability-driven transports**: native broadcast when available, a
//!   storage-event fallback when not, a silent no-op when neither exists
//! - **Self-broadcast suppression**: per-context identities keep a context
//!   from observing its own publications twice
//! - **Multiplexed channels**: many logical keys share one ref-counted
//!   physical transport per channel name
//! - **Optional persistence**: the latest value survives a context reload,
//!   with a pluggable string codec
//! - **Never throws**: every platform failure degrades to local-only state
//!
//! ## Quick Start
//!
//! ```rust
//! use tabsync::{ChannelOptions, Context, Host};
//!
//! let host = Host::new();
//! let tab_a = Context::attach(&host);
//! let tab_b = Context::attach(&host);
//!
//! let counter_a = tab_a.channel("counter", 0i64, ChannelOptions::new());
//! let counter_b = tab_b.channel("counter", 0i64, ChannelOptions::new());
//!
//! counter_a.set(5);
//! assert_eq!(counter_b.get(), 5);
//! ```

pub mod binding;
pub mod channel;
pub mod context;
pub mod envelope;
pub mod host;
pub mod identity;
pub mod transport;

// Re-export main types for library consumers
pub use binding::{Bindings, SharedState};
pub use channel::{Channel, ChannelOptions, Subscription};
pub use context::Context;
pub use envelope::Envelope;
pub use host::{Host, HostBuilder};
pub use identity::DETACHED_IDENTITY;
pub use transport::{Transport, TransportKind};

/// Prefix for every storage slot this crate touches.
pub const SLOT_PREFIX: &str = "tabsync";

/// Physical channel joined when [`ChannelOptions`] does not name one;
/// unrelated keys multiplex over it.
pub const DEFAULT_CHANNEL_NAME: &str = "tabsync-main";

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) fn slot_name(suffix: &str) -> String {
    format!("{SLOT_PREFIX}-{suffix}")
}
