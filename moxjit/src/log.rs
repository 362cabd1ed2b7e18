//! The implementation of the `MOXD_LOG` environment variable.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf, sync::LazyLock};
use strum::{EnumCount, FromRepr};

static LOG: LazyLock<Log> = LazyLock::new(|| {
    Log::new().unwrap_or_else(|e| {
        eprintln!("mox-log: {e}");
        Log {
            level: Verbosity::Error,
            path: None,
        }
    })
});

/// Log `msg` at [Verbosity] `level` as per the process's `MOXD_LOG` setting.
pub(crate) fn log(level: Verbosity, msg: &str) {
    LOG.log(level, msg);
}

/// How verbose should mox's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log code generation artifacts (move schedules, deopt blobs).
    Codegen,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` should default to the
    /// platform specific standard for logging (e.g. stderr).
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("MOXD_LOG") {
            Ok(s) => {
                let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
                    [path, level] => {
                        if path == "-" {
                            (None, level)
                        } else {
                            let path = PathBuf::from(path);
                            // If there's an existing log file, truncate (i.e. empty it), so that
                            // later appends to the log aren't appending to a previous log run.
                            File::create(&path).ok();
                            (Some(path), level)
                        }
                    }
                    [level] => (None, level),
                    [..] => return Err("MOXD_LOG must be of the format `[<path|->:]<level>".into()),
                };
                let level = level
                    .parse::<u8>()
                    .map_err(|e| format!("Invalid MOXD_LOG level '{s}': {e}"))?;
                // This unwrap can only fail dynamically if we've got the types wrong statically
                // (i.e. it'll fail as soon as this code is executed for the first time).
                let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
                let level = Verbosity::from_repr(level)
                    .ok_or_else(|| format!("MOXD_LOG level {level} exceeds maximum {max_level}"))?;
                Ok(Self { path, level })
            }
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Log `msg` with the [Verbosity] level `level`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        debug_assert_ne!(level, Verbosity::Disabled);
        if level <= self.level {
            match &self.path {
                Some(p) => {
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut f| f.write_all(format!("mox-log: {msg}\n").as_bytes()))
                        .ok();
                }
                None => eprintln!("mox-log: {msg}"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_level() {
        // Without `MOXD_LOG` set, only errors are logged.
        let log = Log {
            level: Verbosity::Error,
            path: None,
        };
        assert!(Verbosity::Warning > log.level);
        assert!(Verbosity::Codegen > log.level);
    }

    #[test]
    fn level_decoding() {
        assert_eq!(Verbosity::from_repr(0), Some(Verbosity::Disabled));
        assert_eq!(
            Verbosity::from_repr(u8::try_from(Verbosity::COUNT).unwrap() - 1),
            Some(Verbosity::Codegen)
        );
        assert_eq!(Verbosity::from_repr(u8::try_from(Verbosity::COUNT).unwrap()), None);
    }
}
