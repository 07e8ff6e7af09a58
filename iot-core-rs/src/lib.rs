//! IoT Core Library
//!
//! Lifecycle runtime for connected device firmware: a single-consumer event
//! loop that owns the device state, a connectivity manager with a linear
//! reconnect ladder, a provisioning session, and an A/B firmware update
//! pipeline guarded by a timed task lock.
//!
//! ```text
//!   ConnectivityManager ─┐
//!   ProvisioningSession ─┼─► LifecycleContext ─► event queue ─► Coordinator
//!   UpdatePipeline ──────┘        │                                │
//!          │                      └── TaskLock ◄── grant/reap ─────┤
//!          └── FirmwareSlots                    indicator, restart ◄┘
//! ```

pub mod types;
pub mod config;
pub mod error;
pub mod storage;
pub mod queue;
pub mod lock;
pub mod backoff;
pub mod hal;
pub mod context;
pub mod coordinator;
pub mod connectivity;
pub mod router;
pub mod provision;
pub mod firmware;
pub mod update;

pub use types::*;
pub use config::CoreConfig;
pub use error::CoreError;
pub use context::LifecycleContext;
pub use coordinator::{BootMode, Coordinator, ShutdownReport};
pub use connectivity::{ConnectivityManager, ConnectivityService, LinkMode, NetworkDriver};
pub use provision::ProvisioningSession;
pub use router::{RouteTable, Router};
pub use update::{UpdatePipeline, UpdateService};
