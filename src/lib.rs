//! ExecGuard: kernel-event execution authorization engine.
//!
//! Receives exec and file events from the OS security monitor, decides each
//! within the kernel deadline, and never lets a slow decision get the caller
//! killed. Blocked executables are identified by content digest. Our own
//! files are guarded against tampering, and policy arrives over an
//! authenticated control channel from the privileged application.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod identity;
pub mod policy;
pub mod protection;

pub mod monitor;
pub mod valve;

pub mod client;
pub mod engine;

pub mod control;
pub mod notify;
pub mod socket;
