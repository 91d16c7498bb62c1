// Copyright 2022 Oxide Computer Company

//! Distributed prefix assignment engine.
//!
//! Every node of a multi-router network runs one [`core::Core`]. Fed with
//! links, delegated prefixes and whatever the peers advertise, it converges
//! each (link, delegated prefix) pair to exactly one assigned prefix,
//! loop-free and priority-ordered, following the homenet prefix-assignment
//! algorithm. Policies plug in as [`rules::Rule`] implementations; the
//! [`store`] module remembers applied prefixes across runs.
//!
//! The crate neither routes nor floods: advertisement synchronisation,
//! link discovery and prefix installation belong to the embedder.

use slog::{o, Drain, Logger};

pub mod clock;
pub mod core;
pub mod entropy;
pub mod error;
pub mod filters;
pub mod prefix;
pub mod rules;
pub mod store;
pub mod trie;

/// Length of a node id in bytes.
pub const NODE_ID_LEN: usize = 8;

/// Delay in milliseconds between an event touching a pair and its routine
/// run. The routine never runs synchronously, even at zero.
pub const RUN_DELAY: u64 = 20;

/// Default flooding delay in milliseconds.
pub const DEFAULT_FLOODING_DELAY: u32 = 10_000;

/// Terminal logger for binaries and tests: asynchronous full-format
/// output on stderr.
pub fn term_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
