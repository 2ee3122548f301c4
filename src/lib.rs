//! Dual-domain checkpointing engine for AI coding agents: a working-tree
//! snapshot (Checkpoint Store) coupled to a byte-exact transcript cursor
//! (Transcript Manager), so a restore can roll back code, conversation
//! context, or both without losing either domain's history.
//!
//! [`Controller`] is the crate's entry point; everything else is a
//! collaborator it composes. A caller typically only needs:
//!
//! ```no_run
//! use rewind_core::controller::{Controller, CreateCheckpointRequest};
//!
//! # fn main() -> anyhow::Result<()> {
//! let project_root = std::path::Path::new(".");
//! let controller = Controller::new(project_root)?;
//! controller.create_checkpoint(CreateCheckpointRequest {
//!     description: "before the risky refactor".to_string(),
//!     force: true,
//!     ..Default::default()
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod atomic;
pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod hook;
pub mod model;
pub mod paths;
pub mod store;
pub mod transcript;

pub use controller::Controller;
pub use error::{RewindError, Result};
