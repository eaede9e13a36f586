//! qanat: run-parameter expansion and job dispatch for experiment tracking.
//!
//! A `qanat run` invocation is expanded into parameter sets
//! ([`core::expander`]), rendered into commands ([`core::command_builder`]),
//! bound to storage directories ([`core::storage`]) and handed to an
//! execution backend ([`system::backend`]).

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Set once the user asked to stop (Ctrl+C, SIGTERM). Polled by long waits.
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
