//! Warden supervision tree.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              boot supervisor                 │
//! ├─────────────────────────────────────────────┤
//! │  daemon_manager │ nano_manager │ llm_manager │
//! ├─────────────────────────────────────────────┤
//! │  temp daemon │ metrics daemon │ nanos │ llm  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Control flows supervisor-down: the boot supervisor owns managers, managers
//! own component processes. State flows store-centric: everything talks only
//! by reading and writing the shared store, never directly.

pub mod backoff;
pub mod boot;
pub mod manager;
pub mod process;
pub mod registry;

pub use backoff::Backoff;
pub use boot::BootSupervisor;
pub use manager::{ComponentManager, ComponentState, ManagerContext};
pub use process::{pid_file_path, process_alive, ProcessHandle, SpawnSpec};
pub use registry::ManagerRegistry;
