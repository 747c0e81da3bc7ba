//! Python bindings.
//!
//! ```python
//! from mindwave_rs import MindWave
//!
//! mw = MindWave(address="A4:DA:32:70:03:4E", autostart=False, verbose=3)
//! mw.set_callback("attention", lambda x: print("Attention:", x))
//! mw.set_callback("blinkStrength", lambda x: print("Blink:", x))
//! mw.start()
//! ```
//!
//! Callbacks run on the reader thread and take the GIL for each value.

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::errors::DriverError;
use crate::logging;
use crate::mindwave::{ClientConfig, MindWave, SessionEnd, SessionReport, SessionStats};
use crate::types::{Event, PowerBands, Value};

fn to_py_err(e: DriverError) -> PyErr {
    match e {
        DriverError::Bluetooth(_) => PyConnectionError::new_err(e.to_string()),
        DriverError::Io(_) | DriverError::Serial(_) | DriverError::Timeout(_) => {
            PyIOError::new_err(e.to_string())
        }
        DriverError::UnknownEvent(_) => PyValueError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

fn bands_to_dict<'py>(py: Python<'py>, bands: &PowerBands) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    for (name, value) in PowerBands::names().iter().zip(bands.to_array()) {
        dict.set_item(*name, value)?;
    }
    Ok(dict)
}

/// Python view of a decoded value: `int` for levels and raw samples, `dict`
/// for power bands, `bytes` for unknown rows, `str` for a disconnect reason.
fn value_to_py<'py>(py: Python<'py>, value: &Value) -> PyResult<Bound<'py, PyAny>> {
    Ok(match value {
        Value::Level(v) => v.into_pyobject(py)?.into_any(),
        Value::Raw(v) => v.into_pyobject(py)?.into_any(),
        Value::PowerBands(bands) => bands_to_dict(py, bands)?.into_any(),
        Value::Bytes(bytes) => PyBytes::new(py, bytes).into_any(),
        Value::Disconnected(reason) => reason.to_string().into_pyobject(py)?.into_any(),
    })
}

fn stats_to_dict<'py>(py: Python<'py>, stats: &SessionStats) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("bytes_read", stats.bytes_read)?;
    dict.set_item("packets", stats.packets)?;
    dict.set_item("records", stats.records)?;
    dict.set_item("checksum_errors", stats.checksum_errors)?;
    dict.set_item("oversized_lengths", stats.oversized_lengths)?;
    dict.set_item("discarded_bytes", stats.discarded_bytes)?;
    dict.set_item("overflow_bytes", stats.overflow_bytes)?;
    dict.set_item("decode_errors", stats.decode_errors)?;
    dict.set_item("unhandled_records", stats.unhandled_records)?;
    dict.set_item("handler_errors", stats.handler_errors)?;
    dict.set_item("dropped_packets", stats.dropped_packets())?;
    Ok(dict)
}

fn verbosity_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// NeuroSky MindWave headset client.
///
/// Args:
///     address: Bluetooth MAC of a paired headset (e.g. "A4:DA:32:70:03:4E").
///     serial: Serial device path instead of Bluetooth (e.g. "/dev/rfcomm0").
///     autostart: Start reading right after connecting.
///     verbose: 0 (warnings) to 3 (trace) for Rust log records forwarded to
///         Python's ``logging``. ``None`` keeps the ``MINDWAVE_LOG`` level.
///
/// Raises:
///     ValueError: If neither ``address`` nor ``serial`` is given.
///     ConnectionError: If the Bluetooth connection fails.
///     IOError: If the serial device cannot be opened.
#[pyclass(name = "MindWave", unsendable)]
struct PyMindWave {
    inner: MindWave,
    source: String,
}

#[pymethods]
impl PyMindWave {
    #[new]
    #[pyo3(signature = (address=None, serial=None, autostart=false, verbose=None))]
    fn new(
        py: Python<'_>,
        address: Option<String>,
        serial: Option<String>,
        autostart: bool,
        verbose: Option<u8>,
    ) -> PyResult<Self> {
        if let Some(v) = verbose {
            logging::set_python_log_level(py, Some(verbosity_level(v)))?;
        }

        // Handlers start empty, so autostart is applied after construction.
        let config = ClientConfig::default();
        let (inner, source) = match (serial, address) {
            (Some(path), _) => {
                let client = py
                    .detach(|| MindWave::connect_serial(&path, config))
                    .map_err(to_py_err)?;
                (client, path)
            }
            (None, Some(mac)) => {
                let client = py
                    .detach(|| MindWave::connect_bluetooth(&mac, config))
                    .map_err(to_py_err)?;
                (client, mac)
            }
            (None, None) => {
                return Err(PyValueError::new_err(
                    "either address or serial must be given",
                ))
            }
        };

        let mut mw = PyMindWave { inner, source };
        if autostart {
            mw.inner.start().map_err(to_py_err)?;
        }
        Ok(mw)
    }

    /// Register ``callback(value)`` for an event name.
    ///
    /// Names: "eeg", "attention", "meditation", "signalQuality",
    /// "blinkStrength", "powerBands", "unknown", "disconnected".
    /// Replaces any previous callback for that event; may be called while
    /// reading. Exceptions raised by the callback are logged and ignored.
    fn set_callback(&self, name: &str, callback: Py<PyAny>) -> PyResult<()> {
        self.inner
            .register_named(name, move |value: Value| -> anyhow::Result<()> {
                Python::attach(|py| {
                    let arg = value_to_py(py, &value)?;
                    callback.call1(py, (arg,))?;
                    Ok::<_, PyErr>(())
                })?;
                Ok(())
            })
            .map_err(to_py_err)
    }

    /// Remove the callback for an event name. Returns whether one was set.
    fn unset_callback(&self, name: &str) -> PyResult<bool> {
        let event = name.parse::<Event>().map_err(to_py_err)?;
        Ok(self.inner.unregister(event))
    }

    /// Start reading on a background thread.
    ///
    /// Raises:
    ///     RuntimeError: If already running or the connection was used up.
    fn start(&mut self) -> PyResult<()> {
        self.inner.start().map_err(to_py_err)
    }

    /// Stop reading and close the connection.
    ///
    /// Returns:
    ///     "stopped", a disconnect reason, or None if reading never started.
    fn stop(&mut self, py: Python<'_>) -> Option<String> {
        let inner = &mut self.inner;
        py.detach(move || inner.stop()).map(|report| describe_end(&report))
    }

    /// Whether the reader thread is alive.
    #[getter]
    fn running(&self) -> bool {
        self.inner.is_running()
    }

    /// Session counters as a dict.
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        stats_to_dict(py, &self.inner.stats())
    }

    fn __enter__(slf: PyRefMut<'_, Self>) -> PyRefMut<'_, Self> {
        slf
    }

    #[pyo3(signature = (*_args))]
    fn __exit__(&mut self, py: Python<'_>, _args: &Bound<'_, pyo3::types::PyTuple>) -> bool {
        self.stop(py);
        false
    }

    fn __repr__(&self) -> String {
        format!(
            "MindWave(source={:?}, running={})",
            self.source,
            self.inner.is_running()
        )
    }
}

impl Drop for PyMindWave {
    fn drop(&mut self) {
        // The reader may be waiting for the GIL inside a callback.
        let inner = &mut self.inner;
        Python::attach(|py| py.detach(move || inner.stop()));
    }
}

fn describe_end(report: &SessionReport) -> String {
    match &report.end {
        SessionEnd::Stopped => "stopped".to_string(),
        SessionEnd::Disconnected(reason) => reason.to_string(),
    }
}

/// Set the most verbose Rust log level forwarded to Python (e.g. "debug").
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level(py, level)
}

/// Re-read Python logger levels after reconfiguring ``logging``.
#[pyfunction]
fn reset_log_cache() {
    logging::reset_python_logging_cache();
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;
    m.add_class::<PyMindWave>()?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(reset_log_cache, m)?)?;
    m.add(
        "EVENTS",
        Event::ALL.iter().map(|e| e.name()).collect::<Vec<_>>(),
    )?;
    m.add("BAUD_RATE", crate::source::BAUD_RATE)?;
    Ok(())
}
