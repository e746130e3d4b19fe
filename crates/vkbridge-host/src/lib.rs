//! `vkbridge-host` is the host half of a virtualized GPU command stream.
//!
//! It provides:
//! - A handle table that gives every guest-visible object an opaque, kind-tagged identity
//!   (see [`handle`]).
//! - A registry of every live object, with compressed-format emulation for devices that lack
//!   the guest's formats (see [`Registry`]).
//! - Per-queue and per-command-buffer order ledgers that keep concurrent submissions in guest
//!   program order.
//! - Ring timelines and a sync worker pool that turn host fence completion into guest-visible
//!   events (see [`sync`]).
//! - A stream renderer for the transport commands (see [`renderer`]) and save/restore of handle
//!   identities (see [`snapshot`]).

#![forbid(unsafe_code)]

mod config;
mod error;

pub mod driver;
pub mod emulation;
pub mod handle;
pub mod registry;
pub mod renderer;
pub mod snapshot;
pub mod sync;

pub use config::HostConfig;
pub use error::{HostError, HostResult};
pub use handle::{BoxedHandle, HandleKind, HandleTable};
pub use registry::{ExternalFencePool, Registry};
pub use renderer::{AddressSpaceOps, FenceSink, FenceSyncLookup, RendererCollaborators, ResourceDesc, StreamRenderer};
pub use snapshot::{IdentitySnapshot, SnapshotError};
