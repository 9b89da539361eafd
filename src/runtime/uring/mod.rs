//! Linux io_uring event loop implementation.
//!
//! Completion-based I/O with batched harvesting. Every operation's context
//! lives in an `OpTable` until its completion is taken.

mod event_loop;

pub(crate) use event_loop::UringServer;
