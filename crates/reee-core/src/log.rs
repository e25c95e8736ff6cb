//! Level-aware logging shared by the daemon and the client.
//!
//! Three named levels exist on the wire: `taciturn` < `normal` <
//! `verbose`. A [`Printer`] is the capability to emit a message at a
//! level; the [`normal!`](crate::normal) and
//! [`verbose!`](crate::verbose) helpers check the printer's level
//! before formatting so filtered messages cost nothing.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;

/// A logging verbosity level.
///
/// Ordering follows verbosity: `Taciturn < Normal < Verbose`. A printer
/// at level `L` emits messages at levels `<= L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Errors and nothing else.
    Taciturn,
    /// Routine operational messages.
    Normal,
    /// Per-request diagnostic detail.
    Verbose,
}

impl Level {
    /// The wire name of this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Taciturn => "taciturn",
            Self::Normal => "normal",
            Self::Verbose => "verbose",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown level name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("log: invalid level text: {0:?}")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "taciturn" => Ok(Self::Taciturn),
            "normal" => Ok(Self::Normal),
            "verbose" => Ok(Self::Verbose),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// The capability to print a log message at a level.
///
/// Implementations decide where the message goes. The default
/// [`level`](Printer::level) is [`Level::Normal`]; implementations that
/// know their configured level should override it so the filtering
/// helpers can skip formatting early.
pub trait Printer {
    /// Emit `msg` at `lvl`. Implementations are expected to drop
    /// messages above their own level.
    fn print(&self, lvl: Level, msg: &str);

    /// The level this printer is configured at.
    fn level(&self) -> Level {
        Level::Normal
    }
}

/// Log at [`Level::Normal`] through any [`Printer`], formatting only
/// when the printer's level allows it.
#[macro_export]
macro_rules! normal {
    ($printer:expr, $($arg:tt)*) => {{
        if $printer.level() >= $crate::log::Level::Normal {
            $printer.print($crate::log::Level::Normal, &format!($($arg)*));
        }
    }};
}

/// Log at [`Level::Verbose`] through any [`Printer`], formatting only
/// when the printer's level allows it.
#[macro_export]
macro_rules! verbose {
    ($printer:expr, $($arg:tt)*) => {{
        if $printer.level() >= $crate::log::Level::Verbose {
            $printer.print($crate::log::Level::Verbose, &format!($($arg)*));
        }
    }};
}

/// A [`Printer`] that writes to any [`Write`] sink behind a mutex.
///
/// Concurrent callers are serialized; a trailing newline is appended
/// when the message lacks one. Write errors are swallowed, matching the
/// best-effort nature of diagnostic output.
pub struct WriterPrinter<W: Write> {
    lvl: Level,
    w: Mutex<W>,
}

impl<W: Write> WriterPrinter<W> {
    /// Create a printer at `lvl` writing to `w`.
    pub const fn new(lvl: Level, w: W) -> Self {
        Self {
            lvl,
            w: Mutex::new(w),
        }
    }
}

impl<W: Write> Printer for WriterPrinter<W> {
    fn print(&self, lvl: Level, msg: &str) {
        if self.lvl < lvl {
            return;
        }
        let Ok(mut w) = self.w.lock() else {
            return;
        };
        if w.write_all(msg.as_bytes()).is_ok() && !msg.ends_with('\n') {
            let _ = w.write_all(b"\n");
        }
        let _ = w.flush();
    }

    fn level(&self) -> Level {
        self.lvl
    }
}
