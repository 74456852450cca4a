//! Runtime pieces of the daemon: the delivery handler and OS signal handling.

pub mod handler;
pub mod signal;
