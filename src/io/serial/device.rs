// src/io/serial/device.rs
//
// Hardware handle behind a session.
// `SerialportDevice` drives a real port through the serialport crate and
// raises data-received notifications from a watcher thread, the way an OS
// serial driver pushes "bytes available" events.

use std::io::{Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::Duration;

use serialport::{SerialPort, SerialPortBuilder};

use super::utils::{
    to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits, validate_baud_rate,
    LineSettings,
};

/// Driver-level timeout for a single read or write call
const IO_TIMEOUT: Duration = Duration::from_millis(1000);

/// How often the watcher asks the driver for pending bytes
const WATCH_INTERVAL: Duration = Duration::from_millis(2);

/// Watcher pause when pending bytes were not drained by the handler
const STALL_BACKOFF: Duration = Duration::from_millis(100);

/// Called from the notification context whenever bytes are waiting
pub type DataReceivedHandler = Arc<dyn Fn() + Send + Sync>;

/// One exclusively-owned serial hardware handle.
///
/// Errors are plain strings; the session wraps them into `SessionError`.
pub trait SerialDevice: Send {
    /// Apply line settings. Only valid before `open`.
    fn configure(&mut self, settings: &LineSettings) -> Result<(), String>;

    fn open(&mut self) -> Result<(), String>;

    fn close(&mut self) -> Result<(), String>;

    fn is_open(&self) -> bool;

    /// Number of bytes currently sitting in the receive buffer
    fn bytes_to_read(&mut self) -> Result<usize, String>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String>;

    /// Write the whole payload in one blocking call
    fn write_all(&mut self, data: &[u8]) -> Result<(), String>;

    /// Install (or clear) the data-received notification
    fn set_data_received(&mut self, handler: Option<DataReceivedHandler>);
}

/// Build a serialport builder from line settings, rejecting anything the
/// driver cannot express.
pub fn serialport_builder(settings: &LineSettings) -> Result<SerialPortBuilder, String> {
    if settings.port_name.trim().is_empty() {
        return Err("Port name is empty".to_string());
    }
    let baud_rate = validate_baud_rate(settings.baud_rate)?;
    let data_bits = to_serialport_data_bits(settings.data_bits)?;
    let parity = to_serialport_parity(&settings.parity)?;
    let stop_bits = to_serialport_stop_bits(&settings.stop_bits)?;

    Ok(serialport::new(&settings.port_name, baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .timeout(IO_TIMEOUT))
}

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

// ============================================================================
// serialport-backed device
// ============================================================================

/// Serial device backed by the serialport crate
pub struct SerialportDevice {
    settings: Option<LineSettings>,
    port: SharedPort,
    handler: Arc<Mutex<Option<DataReceivedHandler>>>,
    watcher_stop: Arc<AtomicBool>,
}

impl SerialportDevice {
    pub fn new() -> Self {
        Self {
            settings: None,
            port: Arc::new(Mutex::new(None)),
            handler: Arc::new(Mutex::new(None)),
            watcher_stop: Arc::new(AtomicBool::new(true)),
        }
    }

    fn port_name(&self) -> &str {
        self.settings
            .as_ref()
            .map(|s| s.port_name.as_str())
            .unwrap_or("<unconfigured>")
    }

    fn with_port<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn SerialPort>) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut guard = self
            .port
            .lock()
            .map_err(|e| format!("Port mutex poisoned: {}", e))?;
        match guard.as_mut() {
            Some(port) => f(port),
            None => Err("Port is not open".to_string()),
        }
    }
}

impl Default for SerialportDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialDevice for SerialportDevice {
    fn configure(&mut self, settings: &LineSettings) -> Result<(), String> {
        if self.is_open() {
            return Err("Cannot change settings while the port is open".to_string());
        }
        serialport_builder(settings)?;
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn open(&mut self) -> Result<(), String> {
        if self.is_open() {
            return Err(format!("Port {} is already open", self.port_name()));
        }
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| "Port settings have not been configured".to_string())?;

        let port = serialport_builder(&settings)?
            .open()
            .map_err(|e| format!("Failed to open {}: {}", settings.port_name, e))?;

        {
            let mut guard = self
                .port
                .lock()
                .map_err(|e| format!("Port mutex poisoned: {}", e))?;
            *guard = Some(port);
        }

        // Each open gets its own stop flag so a watcher left over from an
        // earlier open can never outlive its close.
        let stop = Arc::new(AtomicBool::new(false));
        self.watcher_stop = stop.clone();
        if let Err(e) = spawn_watcher(
            settings.port_name.clone(),
            self.port.clone(),
            self.handler.clone(),
            stop,
        ) {
            self.watcher_stop.store(true, Ordering::SeqCst);
            if let Ok(mut guard) = self.port.lock() {
                *guard = None;
            }
            return Err(format!("Failed to start receive watcher: {}", e));
        }

        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        self.watcher_stop.store(true, Ordering::SeqCst);
        let port = {
            let mut guard = self
                .port
                .lock()
                .map_err(|e| format!("Port mutex poisoned: {}", e))?;
            guard.take()
        };
        // Dropping the port releases the OS handle
        match port {
            Some(_) => Ok(()),
            None => Err("Port is not open".to_string()),
        }
    }

    fn is_open(&self) -> bool {
        self.port.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn bytes_to_read(&mut self) -> Result<usize, String> {
        self.with_port(|port| {
            port.bytes_to_read()
                .map(|n| n as usize)
                .map_err(|e| format!("Failed to query receive buffer: {}", e))
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        self.with_port(|port| port.read(buf).map_err(|e| format!("Read error: {}", e)))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), String> {
        self.with_port(|port| {
            port.write_all(data)
                .and_then(|_| port.flush())
                .map_err(|e| format!("Serial write error: {}", e))
        })
    }

    fn set_data_received(&mut self, handler: Option<DataReceivedHandler>) {
        match self.handler.lock() {
            Ok(mut guard) => *guard = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }
}

impl Drop for SerialportDevice {
    fn drop(&mut self) {
        self.watcher_stop.store(true, Ordering::SeqCst);
    }
}

/// Watch the receive buffer and fire the data-received handler while bytes
/// are pending. Exits once the port is closed or the stop flag is raised.
///
/// The stop flag is checked under the port lock, so a watcher from an earlier
/// open never queries a port opened after it was stopped. A failing query
/// means the line is gone (unplugged, remote hung up): the port is released so
/// `is_open` stops reporting it.
///
/// The thread is never joined: the handler may be waiting on a lock held by
/// whoever is closing the port.
fn spawn_watcher(
    port_name: String,
    port: SharedPort,
    handler: Arc<Mutex<Option<DataReceivedHandler>>>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("serial-rx {}", port_name))
        .spawn(move || loop {
            let pending = match query_pending(&port, &stop) {
                Some(pending) => pending,
                None => break,
            };

            match pending {
                Ok(n) if n > 0 => {
                    let callback = handler.lock().ok().and_then(|g| g.clone());
                    if let Some(callback) = callback {
                        callback();
                    }
                    // Nothing drained the buffer (no handler, or its reads
                    // are failing); slow down instead of spinning on it.
                    if let Some(Ok(left)) = query_pending(&port, &stop) {
                        if left >= n {
                            thread::sleep(STALL_BACKOFF);
                            continue;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let released = match port.lock() {
                        Ok(mut guard) if !stop.load(Ordering::SeqCst) => guard.take().is_some(),
                        _ => false,
                    };
                    if released {
                        tlog!("[Serial:{}] Line lost, port released: {}", port_name, e);
                    }
                    break;
                }
            }

            thread::sleep(WATCH_INTERVAL);
        })
        .map(|_| ())
}

/// Ask the driver how many bytes are waiting.
/// `None` when the watcher should exit (stopped, closed or poisoned).
fn query_pending(port: &SharedPort, stop: &AtomicBool) -> Option<serialport::Result<u32>> {
    let guard = port.lock().ok()?;
    if stop.load(Ordering::SeqCst) {
        return None;
    }
    guard.as_ref().map(|p| p.bytes_to_read())
}
