//! The `Logger` collaborator interface (spec §6). `tidepool` does not ship a
//! "printf" or "ignoring" implementation of its own; the one concrete body it
//! carries, [`LogCrateLogger`], forwards to the ambient `log` facade so an
//! embedder gets reasonable diagnostics out of the box while remaining free to
//! supply their own `Logger` (e.g. to route Access-level lines to a separate
//! file, as seasocks-style embedders typically do).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Access,
    Info,
    Warning,
    Error,
    Severe,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "DEBUG",
            Level::Access => "ACCESS",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Severe => "SEVERE",
        };
        f.write_str(s)
    }
}

/// Implemented by anything that wants to receive diagnostic output from the
/// reactor, connections, and handlers. All calls happen on the reactor
/// thread, same as every other callback in this crate.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Forwards every call to the `log` crate's global facade, at the `log::Level`
/// that corresponds most closely to `level`. This is the default logger a
/// [`crate::server::Server`] uses when none is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateLogger;

impl Logger for LogCrateLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => log::debug!("{message}"),
            Level::Access => log::info!(target: "tidepool::access", "{message}"),
            Level::Info => log::info!("{message}"),
            Level::Warning => log::warn!("{message}"),
            Level::Error | Level::Severe => log::error!("{message}"),
        }
    }
}
