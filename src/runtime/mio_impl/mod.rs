//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Available on every supported platform.

mod event_loop;

pub(crate) use event_loop::MioServer;
