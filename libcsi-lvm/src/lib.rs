//! # libcsi-lvm: CSI driver core for LVM logical volumes
//!
//! `libcsi-lvm` exposes the logical volumes of an LVM volume group as
//! dynamically provisioned, snapshot-capable volumes through the three CSI
//! services (Identity, Controller, Node).  Requests travel as JSON over a
//! local Unix socket.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `Volume`, `Snapshot`, capabilities, requests, pages. |
//! | [`error`] | [`CsiError`] and its RPC status [`Code`](error::Code). |
//! | [`config`] | [`DriverConfig`] and endpoint parsing. |
//! | [`message`] | [`CsiMessage`] request / response envelope. |
//! | [`identity`] | [`CsiIdentity`] trait and the fixed capability set. |
//! | [`controller`] | [`CsiController`] trait: volume and snapshot lifecycle. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`transport`] | Unix-socket client and server. |
//! | [`backend`] | The LVM backend: registry, state machines, lvm2 adapter. |

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::lvm::{CommandAdapter, LvmDriver};
pub use config::DriverConfig;
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
