//! Logging setup.
//!
//! Binaries log to stderr through `env_logger`. The Python extension instead
//! forwards records into Python's `logging` module, one Python logger per Rust
//! module (`_core::mindwave` becomes `_core.mindwave`), so applications
//! configure handlers and levels the usual Python way.
//!
//! The initial level comes from `MINDWAVE_LOG`, then `RUST_LOG`, else `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

pub const LOG_ENV: &str = "MINDWAVE_LOG";

static RUST_LOG_ONCE: Once = Once::new();

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Level requested through the environment.
pub fn env_level() -> LevelFilter {
    let value = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok();
    parse_level(value.as_deref()).unwrap_or(LevelFilter::Info)
}

/// Map `-v` repetitions onto a level: none keeps the environment level.
pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => env_level(),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the stderr logger for binaries. Later calls are no-ops.
pub fn init_rust_logging(level: LevelFilter) {
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        let result = env_logger::Builder::from_env(env)
            .filter_level(level)
            .format_timestamp_millis()
            .format_target(true)
            .try_init();
        if result.is_err() {
            log::set_max_level(level);
        }
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, reset_python_logging_cache, set_python_log_level};

#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once, PoisonError};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyModule, PyTuple};

    static PY_LOG_ONCE: Once = Once::new();
    static BRIDGE: OnceCell<&'static PyLogBridge> = OnceCell::new();

    /// Python logger plus the most verbose Rust level it accepts.
    struct Target {
        accepts: LevelFilter,
        logger: Py<PyAny>,
    }

    struct PyLogBridge {
        ceiling: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        targets: Mutex<HashMap<String, Target>>,
    }

    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    fn accepted_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
        for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
            if logger
                .call_method1("isEnabledFor", (python_level(level),))?
                .is_truthy()?
            {
                return Ok(level.to_level_filter());
            }
        }
        Ok(LevelFilter::Off)
    }

    impl PyLogBridge {
        fn ceiling(&self) -> LevelFilter {
            *self.ceiling.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn target<'py>(
            &self,
            py: Python<'py>,
            name: &str,
        ) -> PyResult<(LevelFilter, Bound<'py, PyAny>)> {
            let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(t) = targets.get(name) {
                return Ok((t.accepts, t.logger.bind(py).clone()));
            }
            let logger = self.logging.bind(py).call_method1("getLogger", (name,))?;
            let accepts = accepted_level(&logger)?;
            targets.insert(
                name.to_string(),
                Target {
                    accepts,
                    logger: logger.clone().unbind(),
                },
            );
            Ok((accepts, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let (accepts, logger) = self.target(py, &name)?;
            if record.level().to_level_filter() > accepts {
                return Ok(());
            }
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &name,
                    python_level(record.level()),
                    record.file().unwrap_or("<rust>"),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PyLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.ceiling()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            // Errors raised by Python handlers are left pending for the interpreter.
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn bridge(py: Python<'_>, level: LevelFilter) -> PyResult<&'static PyLogBridge> {
        BRIDGE
            .get_or_try_init(|| {
                let logging = py.import("logging")?;
                let bridge = PyLogBridge {
                    ceiling: Mutex::new(level),
                    logging: logging.unbind(),
                    targets: Mutex::new(HashMap::new()),
                };
                Ok::<_, PyErr>(&*Box::leak(Box::new(bridge)))
            })
            .copied()
    }

    /// Route Rust log records into Python's `logging`. Later calls are no-ops.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = super::env_level();
        let bridge = bridge(py, level)?;
        PY_LOG_ONCE.call_once(|| {
            if log::set_logger(bridge).is_ok() {
                log::set_max_level(level);
            }
        });
        Ok(())
    }

    /// Forget cached Python loggers, e.g. after `logging.basicConfig`.
    pub fn reset_python_logging_cache() {
        if let Some(bridge) = BRIDGE.get() {
            bridge
                .targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    /// Change the most verbose level forwarded to Python.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = super::parse_level(level).unwrap_or_else(super::env_level);
        let bridge = bridge(py, level)?;
        *bridge.ceiling.lock().unwrap_or_else(PoisonError::into_inner) = level;
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_accepts_names_in_any_case() {
        assert_eq!(parse_level(Some("DEBUG")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some(" warn ")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn test_verbosity_flags_raise_level() {
        assert_eq!(level_for_verbosity(1), LevelFilter::Debug);
        assert_eq!(level_for_verbosity(4), LevelFilter::Trace);
    }
}
