//! Transaction execution coordination for workflow automation
//!
//! Gives concurrent workflow executions a gap-free nonce sequence per
//! (wallet, chain), prices gas for the trigger that started them, and keeps
//! RPC access alive across endpoint failures.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod tx;

pub use error::{CoordinatorError, CoordinatorResult};
pub use registry::CoordinatorRegistry;
