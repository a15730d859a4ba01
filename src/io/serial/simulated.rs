// src/io/serial/simulated.rs
//
// In-memory serial device for tests and demos.
// A `SimulatedLine` is the "far end" of the wire: it injects inbound chunks,
// records what the session wrote, and can be told to fail operations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::device::{serialport_builder, DataReceivedHandler, SerialDevice};
use super::utils::LineSettings;

#[derive(Default)]
struct LineState {
    settings: Option<LineSettings>,
    open: bool,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    write_calls: usize,
    open_calls: usize,
    handler: Option<DataReceivedHandler>,
    rejected_ports: Vec<String>,
    claimed: bool,
    write_failure: Option<String>,
    close_failure: Option<String>,
    read_failure: Option<String>,
}

/// Controller for a simulated serial line
#[derive(Clone, Default)]
pub struct SimulatedLine {
    state: Arc<Mutex<LineState>>,
}

impl SimulatedLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device handle wired to this line
    pub fn device(&self) -> SimulatedDevice {
        SimulatedDevice {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `open` fail for this port name, as if it did not exist
    pub fn reject_port(&self, name: &str) {
        self.lock().rejected_ports.push(name.to_string());
    }

    /// Make `open` fail as if another process held the port
    pub fn set_claimed(&self, claimed: bool) {
        self.lock().claimed = claimed;
    }

    pub fn fail_writes(&self, message: Option<&str>) {
        self.lock().write_failure = message.map(str::to_string);
    }

    pub fn fail_close(&self, message: Option<&str>) {
        self.lock().close_failure = message.map(str::to_string);
    }

    pub fn fail_reads(&self, message: Option<&str>) {
        self.lock().read_failure = message.map(str::to_string);
    }

    /// Deliver one chunk of inbound bytes and fire the data-received
    /// notification from the calling thread.
    ///
    /// Returns false when the line is closed and the bytes were dropped.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        let handler = {
            let mut state = self.lock();
            if !state.open {
                return false;
            }
            state.rx.extend(bytes.iter().copied());
            state.handler.clone()
        };
        if let Some(handler) = handler {
            handler();
        }
        true
    }

    /// Bytes handed to each `write_all` call, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    pub fn open_calls(&self) -> usize {
        self.lock().open_calls
    }

    /// Bytes still waiting in the receive buffer
    pub fn pending(&self) -> usize {
        self.lock().rx.len()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn has_handler(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub fn settings(&self) -> Option<LineSettings> {
        self.lock().settings.clone()
    }
}

/// Device half of a `SimulatedLine`
pub struct SimulatedDevice {
    state: Arc<Mutex<LineState>>,
}

impl SimulatedDevice {
    fn lock(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SerialDevice for SimulatedDevice {
    fn configure(&mut self, settings: &LineSettings) -> Result<(), String> {
        let mut state = self.lock();
        if state.open {
            return Err("Cannot change settings while the port is open".to_string());
        }
        serialport_builder(settings)?;
        state.settings = Some(settings.clone());
        Ok(())
    }

    fn open(&mut self) -> Result<(), String> {
        let mut state = self.lock();
        state.open_calls += 1;
        let name = match state.settings.as_ref() {
            Some(s) => s.port_name.clone(),
            None => return Err("Port settings have not been configured".to_string()),
        };
        if state.open {
            return Err(format!("Port {} is already open", name));
        }
        if state.rejected_ports.iter().any(|p| p == &name) {
            return Err(format!("Failed to open {}: No such file or directory", name));
        }
        if state.claimed {
            return Err(format!("Failed to open {}: Access denied", name));
        }
        state.open = true;
        state.rx.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        let mut state = self.lock();
        if !state.open {
            return Err("Port is not open".to_string());
        }
        // The handle is gone even when the driver reports a close failure
        state.open = false;
        state.rx.clear();
        match state.close_failure.clone() {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn bytes_to_read(&mut self) -> Result<usize, String> {
        let state = self.lock();
        if !state.open {
            return Err("Port is not open".to_string());
        }
        Ok(state.rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        let mut state = self.lock();
        if !state.open {
            return Err("Port is not open".to_string());
        }
        if let Some(message) = state.read_failure.clone() {
            return Err(message);
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), String> {
        let mut state = self.lock();
        state.write_calls += 1;
        if !state.open {
            return Err("Port is not open".to_string());
        }
        if let Some(message) = state.write_failure.clone() {
            return Err(message);
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn set_data_received(&mut self, handler: Option<DataReceivedHandler>) {
        self.lock().handler = handler;
    }
}
