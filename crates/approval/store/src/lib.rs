//! Approval storage abstractions.
//!
//! This crate defines the persistence contract the approval engine relies on:
//! - approval request records with compare-and-swap status updates
//! - append-only confirmation records with supersede-on-redecide semantics
//!
//! Design stance:
//! - `update_status` is the only concurrency primitive. Callers always pass
//!   the status they observed and the store refuses the write if it moved.
//! - Confirmation writes check request status atomically with respect to
//!   status updates, so no decision lands on a request that is executing.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod config;
mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryApprovalStorage;
pub use traits::{
    ApprovalStorage, ConfirmationStore, FailureUpdate, QueryWindow, RequestStore, StatusUpdate,
};
