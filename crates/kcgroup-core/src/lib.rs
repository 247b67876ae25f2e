//! The consumer group membership and reconciliation core.
//!
//! Everything here is driven by a single [`Reactor`]: one thread calls
//! `run_once` in a loop, every other thread only ever touches the group
//! through [`Reactor::sender`] and the futures it hands back. Nothing in
//! this crate spawns its own threads or talks to a broker directly — wire
//! transport is the [`NetworkClient`] the caller provides.

pub mod background;
pub mod commit;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod heartbeat;
pub mod membership;
pub mod metadata;
pub mod metrics;
pub mod network;
pub mod offsets;
pub mod processor;
pub mod queue;
pub mod reactor;
pub mod reaper;
pub mod reconcile;
pub mod request_manager;
pub mod subscription;
pub mod testutil;
pub mod time;

pub use background::{BackgroundEvent, BackgroundEventSink, CallbackRequest};
pub use config::{GroupConfig, GroupConfigBuilder, GroupConfigError};
pub use events::ApplicationEvent;
pub use membership::{MembershipState, StateListener};
pub use metadata::MetadataCache;
pub use metrics::{Metrics, NoopMetrics};
pub use network::{NetworkClient, RequestBody, ResponseBody, UnsentRequest};
pub use queue::ApplicationEventSender;
pub use reactor::{poll_future, Reactor, ReactorContext};
pub use reaper::CompletableFuture;
pub use subscription::{RebalanceMethod, SubscriptionState};
