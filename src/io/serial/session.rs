// src/io/serial/session.rs
//
// Serial session: owns one serial handle end-to-end.
// Public operations never fail outward. Failures become a `false` return plus
// a message in a single read-and-clear error slot.
//
// Locking: the handle mutex serialises open/close/send/inbound reads. The
// error slot and listener list have their own mutexes and are only ever taken
// after (never before) the handle mutex. The delivery mutex is taken first, by
// the notification path only, so packets leave in the order they were read.

use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::device::{DataReceivedHandler, SerialDevice, SerialportDevice};
use super::error::SessionError;
use super::utils::{LineSettings, TextEncoding};
use crate::io::now_us;
use crate::settings::SessionSettings;

// ============================================================================
// Types
// ============================================================================

/// One raw chunk drained from the receive buffer at a single notification.
/// Not aligned to any application-level message boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InboundPacket {
    /// Serial port name
    pub port: String,
    pub bytes: Vec<u8>,
    /// Microseconds since the Unix epoch when the chunk was drained
    pub timestamp_us: u64,
}

impl InboundPacket {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Identifies a registered packet listener
pub type ListenerId = u64;

type PacketHandler = Arc<dyn Fn(InboundPacket) + Send + Sync>;

/// Minimum spacing between receive-failure log lines
const RECEIVE_LOG_INTERVAL: Duration = Duration::from_secs(1);

enum Listener {
    Channel(mpsc::UnboundedSender<InboundPacket>),
    Handler(PacketHandler),
}

struct SessionInner {
    port_name: String,
    settings: Option<LineSettings>,
    text_encoding: TextEncoding,
    handle: Mutex<Option<Box<dyn SerialDevice>>>,
    last_error: Mutex<Option<SessionError>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener_id: AtomicU64,
    /// Bumped under the listener lock on every close
    generation: AtomicU64,
    delivery: Mutex<()>,
    receive_log: Mutex<FailureLog>,
}

/// Throttles a repeating failure to one log line per interval
#[derive(Default)]
struct FailureLog {
    last: Option<Instant>,
    suppressed: u64,
}

impl FailureLog {
    /// `Some(suppressed_since_last)` when a line may be written now
    fn admit(&mut self, now: Instant, interval: Duration) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

// ============================================================================
// Serial Session
// ============================================================================

/// A single serial-port communication session.
///
/// Created closed. `open` and `close` may be repeated; `dispose` (or drop)
/// releases the handle exactly once. Inbound bytes are pushed to every
/// registered listener from the device's notification context.
pub struct SerialSession {
    inner: Arc<SessionInner>,
}

impl SerialSession {
    /// Create a session on the host's serial driver.
    ///
    /// Parity and stop bits are matched case-insensitively; unknown values
    /// fall back to `none` and `one`. When the port name, parity or stop bits
    /// is empty the handle is left unconfigured and `open` will fail.
    pub fn new(port_name: &str, baud_rate: u32, parity: &str, data_bits: u8, stop_bits: &str) -> Self {
        Self::with_device(
            Box::new(SerialportDevice::new()),
            port_name,
            baud_rate,
            parity,
            data_bits,
            stop_bits,
        )
    }

    /// Same as `new`, on a caller-supplied device
    pub fn with_device(
        device: Box<dyn SerialDevice>,
        port_name: &str,
        baud_rate: u32,
        parity: &str,
        data_bits: u8,
        stop_bits: &str,
    ) -> Self {
        let settings = LineSettings::from_parts(port_name, baud_rate, parity, data_bits, stop_bits);
        Self::build(device, port_name.to_string(), settings, TextEncoding::default())
    }

    /// Create a session from loaded settings, on the host's serial driver
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self::from_settings_with_device(Box::new(SerialportDevice::new()), settings)
    }

    pub fn from_settings_with_device(device: Box<dyn SerialDevice>, settings: &SessionSettings) -> Self {
        Self::build(
            device,
            settings.port.clone(),
            settings.line_settings(),
            settings.encoding(),
        )
    }

    fn build(
        mut device: Box<dyn SerialDevice>,
        port_name: String,
        settings: Option<LineSettings>,
        text_encoding: TextEncoding,
    ) -> Self {
        let mut config_error = None;
        match &settings {
            Some(s) => match device.configure(s) {
                Ok(()) => tlog!("[Serial:{}] Configured {}", port_name, s.summary()),
                Err(message) => {
                    config_error = Some(SessionError::Configuration {
                        port: port_name.clone(),
                        message,
                    })
                }
            },
            None => tlog!(
                "[Serial:{}] Missing port name, parity or stop bits; handle left unconfigured",
                port_name
            ),
        }

        let session = Self {
            inner: Arc::new(SessionInner {
                port_name,
                settings,
                text_encoding,
                handle: Mutex::new(Some(device)),
                last_error: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                delivery: Mutex::new(()),
                receive_log: Mutex::new(FailureLog::default()),
            }),
        };
        if let Some(err) = config_error {
            session.inner.record(err);
        }
        session
    }

    pub fn port_name(&self) -> &str {
        &self.inner.port_name
    }

    /// Line settings in effect, `None` when the session is unconfigured
    pub fn settings(&self) -> Option<&LineSettings> {
        self.inner.settings.as_ref()
    }

    pub fn text_encoding(&self) -> TextEncoding {
        self.inner.text_encoding
    }

    /// Open the device and start inbound delivery.
    ///
    /// The data-received notification is only wired up when the device
    /// actually opened; a failed open leaves no listener on the handle.
    pub fn open(&self) -> bool {
        let inner = &self.inner;
        let mut guard = inner.lock_handle();
        let device = match guard.as_mut() {
            Some(device) => device,
            None => {
                inner.record(SessionError::PortNull);
                return false;
            }
        };

        match device.open() {
            Ok(()) => {
                device.set_data_received(Some(inner.data_received_handler()));
                tlog!("[Serial:{}] Opened", inner.port_name);
                true
            }
            Err(message) => {
                inner.record(SessionError::Open {
                    port: inner.port_name.clone(),
                    message,
                });
                false
            }
        }
    }

    /// Close the device. No-op when already closed or disposed.
    pub fn close(&self) {
        let mut guard = self.inner.lock_handle();
        if let Some(device) = guard.as_mut() {
            self.inner.close_device(&mut **device);
        }
    }

    /// Close if open, then release the handle. Safe to call repeatedly.
    ///
    /// Also drops every listener, so subscription receivers see the end of
    /// the stream.
    pub fn dispose(&self) {
        let device = {
            let mut guard = self.inner.lock_handle();
            if let Some(device) = guard.as_mut() {
                self.inner.close_device(&mut **device);
            }
            guard.take()
        };

        if let Some(device) = device {
            drop(device);
            self.inner.lock_listeners().clear();
            tlog!("[Serial:{}] Handle released", self.inner.port_name);
        }
    }

    /// True while the handle exists and the device reports itself open
    pub fn is_open(&self) -> bool {
        self.inner
            .lock_handle()
            .as_ref()
            .map(|device| device.is_open())
            .unwrap_or(false)
    }

    /// Take the pending error message, leaving the slot empty.
    /// Returns `""` when nothing went wrong since the last call.
    pub fn current_error(&self) -> String {
        self.take_error().map(|e| e.to_string()).unwrap_or_default()
    }

    /// Typed form of `current_error`
    pub fn take_error(&self) -> Option<SessionError> {
        self.inner.lock_error().take()
    }

    /// Write a payload in one blocking call. Never retried.
    pub fn send_bytes(&self, data: &[u8]) -> bool {
        self.inner.write_payload(data)
    }

    /// Write text using the session's text encoding (UTF-8 unless configured)
    pub fn send_text(&self, text: &str) -> bool {
        let encoded = self.inner.text_encoding.encode(text);
        self.inner.write_payload(&encoded)
    }

    /// Register a channel listener. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.add_listener(Listener::Channel(tx));
        rx
    }

    /// Register a callback run in the notification context for every packet.
    /// It must return quickly; later deliveries wait for it.
    pub fn add_handler<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(InboundPacket) + Send + Sync + 'static,
    {
        self.inner.add_listener(Listener::Handler(Arc::new(handler)))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock_listeners().len()
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSession")
            .field("port_name", &self.inner.port_name)
            .field("settings", &self.inner.settings)
            .field("is_open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Internals
// ============================================================================

impl SessionInner {
    fn lock_handle(&self) -> MutexGuard<'_, Option<Box<dyn SerialDevice>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_error(&self) -> MutexGuard<'_, Option<SessionError>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an error, replacing any unread one
    fn record(&self, err: SessionError) {
        tlog!("[Serial:{}] {} error: {}", self.port_name, err.kind(), err);
        *self.lock_error() = Some(err);
    }

    fn close_device(&self, device: &mut dyn SerialDevice) {
        if !device.is_open() {
            return;
        }
        device.set_data_received(None);
        {
            // A packet read before this point but not yet handed out is
            // dropped by `dispatch`.
            let _listeners = self.lock_listeners();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        match device.close() {
            Ok(()) => tlog!("[Serial:{}] Closed", self.port_name),
            Err(message) => self.record(SessionError::Close {
                port: self.port_name.clone(),
                message,
            }),
        }
    }

    fn write_payload(&self, payload: &[u8]) -> bool {
        let mut guard = self.lock_handle();
        let device = match guard.as_mut() {
            Some(device) if device.is_open() => device,
            _ => {
                self.record(SessionError::PortNotOpen);
                return false;
            }
        };
        if payload.is_empty() {
            self.record(SessionError::EmptyPayload);
            return false;
        }

        match device.write_all(payload) {
            Ok(()) => true,
            Err(message) => {
                self.record(SessionError::Send {
                    port: self.port_name.clone(),
                    message,
                });
                false
            }
        }
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push((id, listener));
        id
    }

    /// Handler given to the device. Holds only a weak reference so the
    /// device never keeps the session alive.
    fn data_received_handler(self: &Arc<Self>) -> DataReceivedHandler {
        let weak: Weak<SessionInner> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_data_received();
            }
        })
    }

    /// Drain exactly what the driver reports as available and deliver it as
    /// one packet. Failures here have no caller to report to, so they are
    /// logged and the packet is dropped.
    fn on_data_received(&self) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let (bytes, generation) = {
            let mut guard = self.lock_handle();
            let device = match guard.as_mut() {
                Some(device) if device.is_open() => device,
                _ => return,
            };
            let generation = self.generation.load(Ordering::SeqCst);

            let available = match device.bytes_to_read() {
                Ok(n) => n,
                Err(message) => {
                    self.log_receive_failure(message);
                    return;
                }
            };
            if available == 0 {
                return;
            }

            let mut buf = vec![0u8; available];
            match device.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    (buf, generation)
                }
                Err(message) => {
                    self.log_receive_failure(message);
                    return;
                }
            }
        };

        if bytes.is_empty() {
            return;
        }

        self.dispatch(
            InboundPacket {
                port: self.port_name.clone(),
                bytes,
                timestamp_us: now_us(),
            },
            generation,
        );
    }

    fn log_receive_failure(&self, message: String) {
        let admitted = self
            .receive_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(Instant::now(), RECEIVE_LOG_INTERVAL);
        let suppressed = match admitted {
            Some(suppressed) => suppressed,
            None => return,
        };

        let err = SessionError::Receive {
            port: self.port_name.clone(),
            message,
        };
        if suppressed > 0 {
            tlog!(
                "[Serial:{}] Dropped inbound data: {} ({} similar failures not logged)",
                self.port_name,
                err,
                suppressed
            );
        } else {
            tlog!("[Serial:{}] Dropped inbound data: {}", self.port_name, err);
        }
    }

    /// Hand a packet to every listener. Channel sends happen under the
    /// listener lock and are skipped when the port was closed after the
    /// packet was read; callbacks run after the lock is released so they may
    /// call back into the session.
    fn dispatch(&self, packet: InboundPacket, generation: u64) {
        let mut handlers: Vec<PacketHandler> = Vec::new();
        {
            let mut listeners = self.lock_listeners();
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            listeners.retain(|(_, listener)| match listener {
                Listener::Channel(tx) => tx.send(packet.clone()).is_ok(),
                Listener::Handler(handler) => {
                    handlers.push(handler.clone());
                    true
                }
            });
        }

        for handler in handlers {
            let delivery = packet.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(delivery))).is_err() {
                tlog!("[Serial:{}] Packet handler panicked", self.port_name);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::simulated::SimulatedLine;
    use crate::io::serial::utils::{Parity, StopBits};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::mpsc::error::TryRecvError;

    fn session_on(line: &SimulatedLine, port: &str) -> SerialSession {
        SerialSession::with_device(Box::new(line.device()), port, 9600, "none", 8, "one")
    }

    fn open_session(line: &SimulatedLine) -> SerialSession {
        let session = session_on(line, "SIM0");
        assert!(session.open(), "open failed: {}", session.current_error());
        session
    }

    #[test]
    fn test_construct_and_dispose_without_open() {
        let line = SimulatedLine::new();
        let session = session_on(&line, "SIM0");
        assert_eq!(session.current_error(), "");

        session.dispose();
        assert_eq!(session.current_error(), "");
        assert!(!session.is_open());

        // second dispose is a no-op
        session.dispose();
        assert_eq!(session.current_error(), "");
    }

    #[test]
    fn test_open_after_dispose_reports_port_null() {
        let line = SimulatedLine::new();
        let session = session_on(&line, "SIM0");
        session.dispose();
        assert!(!session.open());
        assert_eq!(session.take_error(), Some(SessionError::PortNull));
        assert_eq!(line.open_calls(), 0);
    }

    #[test]
    fn test_rejected_port_scenario() {
        let line = SimulatedLine::new();
        line.reject_port("COM_FAKE");
        let session = SerialSession::with_device(Box::new(line.device()), "COM_FAKE", 9600, "even", 8, "one");

        assert!(!session.open());
        let message = session.current_error();
        assert!(message.contains("COM_FAKE"), "unexpected message: {}", message);
        assert_eq!(session.current_error(), "");
        assert!(!session.is_open());
    }

    #[test]
    fn test_failed_open_does_not_register_handler() {
        let line = SimulatedLine::new();
        line.set_claimed(true);
        let session = session_on(&line, "SIM0");

        assert!(!session.open());
        assert!(matches!(session.take_error(), Some(SessionError::Open { .. })));
        assert!(!line.has_handler());
    }

    #[test]
    fn test_open_twice_fails_second_time() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        assert!(!session.open());
        assert!(session.current_error().contains("already open"));
        assert!(session.is_open());
    }

    #[test]
    fn test_send_before_open_is_rejected() {
        let line = SimulatedLine::new();
        let session = session_on(&line, "SIM0");

        assert!(!session.send_bytes(b"hello"));
        assert_eq!(session.current_error(), "Port not open");
        assert!(!session.send_text("hello"));
        assert_eq!(session.take_error(), Some(SessionError::PortNotOpen));
        assert_eq!(line.write_calls(), 0);
    }

    #[test]
    fn test_send_after_failed_open_is_rejected() {
        let line = SimulatedLine::new();
        line.reject_port("SIM0");
        let session = session_on(&line, "SIM0");
        assert!(!session.open());
        let _ = session.current_error();

        assert!(!session.send_bytes(&[0x01, 0x02]));
        assert_eq!(session.current_error(), "Port not open");
        assert_eq!(line.write_calls(), 0);
    }

    /// An open port with nothing to write gets its own `EmptyPayload` kind
    /// ("No data to send") rather than "Port not open", so a caller can tell
    /// a bad argument apart from a closed port. The open check still runs
    /// first.
    #[test]
    fn test_empty_payload_is_not_written() {
        let line = SimulatedLine::new();
        let session = open_session(&line);

        assert!(!session.send_bytes(&[]));
        assert_eq!(session.take_error(), Some(SessionError::EmptyPayload));
        assert!(!session.send_text(""));
        assert_eq!(line.write_calls(), 0);
    }

    #[test]
    fn test_send_writes_whole_payload_once() {
        let line = SimulatedLine::new();
        let session = open_session(&line);

        assert!(session.send_bytes(&[0xAA, 0x55, 0x00, 0xFF]));
        assert!(session.send_text("AT\r\n"));
        assert_eq!(
            line.written(),
            vec![vec![0xAA, 0x55, 0x00, 0xFF], b"AT\r\n".to_vec()]
        );
        assert_eq!(session.current_error(), "");
    }

    #[test]
    fn test_send_failure_is_captured_without_retry() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        line.fail_writes(Some("device unplugged"));

        assert!(!session.send_bytes(b"ping"));
        assert_eq!(line.write_calls(), 1);
        let err = session.take_error().unwrap();
        assert!(matches!(err, SessionError::Send { .. }));
        assert!(err.to_string().contains("SIM0"));
        assert!(err.to_string().contains("device unplugged"));
    }

    #[test]
    fn test_inbound_packets_arrive_in_order() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        let mut rx = session.subscribe();

        let chunks: Vec<Vec<u8>> = vec![vec![1], vec![2, 3, 4], (0..64).collect(), vec![9, 9]];
        for chunk in &chunks {
            assert!(line.inject(chunk));
        }

        for chunk in &chunks {
            let packet = rx.try_recv().unwrap();
            assert_eq!(&packet.bytes, chunk);
            assert_eq!(packet.port, "SIM0");
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(line.pending(), 0);
    }

    #[test]
    fn test_packet_serializes_for_json_output() {
        let packet = InboundPacket {
            port: "SIM0".to_string(),
            bytes: vec![0x01, 0xFF],
            timestamp_us: 42,
        };
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["port"], "SIM0");
        assert_eq!(json["bytes"], serde_json::json!([1, 255]));
        assert_eq!(json["timestamp_us"], 42);
        assert_eq!(packet.to_hex(), "01ff");
    }

    #[test]
    fn test_every_listener_receives_every_packet() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        let mut rx_a = session.subscribe();
        let mut rx_b = session.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.add_handler(move |packet| sink.lock().unwrap().push(packet.into_bytes()));

        line.inject(b"abc");
        line.inject(b"de");

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.try_recv().unwrap().bytes, b"abc".to_vec());
            assert_eq!(rx.try_recv().unwrap().bytes, b"de".to_vec());
        }
        assert_eq!(*seen.lock().unwrap(), vec![b"abc".to_vec(), b"de".to_vec()]);
    }

    #[test]
    fn test_packets_are_drained_without_listeners() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        assert_eq!(session.listener_count(), 0);

        line.inject(&[0u8; 128]);
        assert_eq!(line.pending(), 0);
        assert_eq!(session.current_error(), "");
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        let rx = session.subscribe();
        let _kept = session.subscribe();
        assert_eq!(session.listener_count(), 2);

        drop(rx);
        line.inject(b"x");
        assert_eq!(session.listener_count(), 1);
    }

    #[test]
    fn test_remove_listener() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = session.add_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        line.inject(b"1");
        assert!(session.remove_listener(id));
        assert!(!session.remove_listener(id));
        line.inject(b"2");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_send_from_notification_context() {
        let line = SimulatedLine::new();
        let session = Arc::new(open_session(&line));
        let echo = Arc::downgrade(&session);
        session.add_handler(move |packet| {
            if let Some(session) = echo.upgrade() {
                session.send_bytes(&packet.bytes);
            }
        });

        line.inject(b"echo");
        assert_eq!(line.written(), vec![b"echo".to_vec()]);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        session.add_handler(|_| panic!("listener bug"));
        let mut rx = session.subscribe();

        line.inject(b"one");
        line.inject(b"two");
        assert_eq!(rx.try_recv().unwrap().bytes, b"one".to_vec());
        assert_eq!(rx.try_recv().unwrap().bytes, b"two".to_vec());
    }

    #[test]
    fn test_read_failure_is_logged_not_raised() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        let mut rx = session.subscribe();
        line.fail_reads(Some("framing error"));

        line.inject(b"bad");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(session.is_open());
        assert_eq!(session.current_error(), "");

        line.fail_reads(None);
        line.inject(b"ok");
        // the failed chunk is still buffered and comes out with the next one
        assert_eq!(rx.try_recv().unwrap().bytes, b"badok".to_vec());
    }

    #[test]
    fn test_is_open_follows_lifecycle() {
        let line = SimulatedLine::new();
        let session = session_on(&line, "SIM0");
        assert!(!session.is_open());

        assert!(session.open());
        assert!(session.is_open());
        assert!(line.has_handler());

        session.close();
        assert!(!session.is_open());
        assert!(!line.has_handler());

        // reopen works and delivers again
        assert!(session.open());
        let mut rx = session.subscribe();
        line.inject(b"again");
        assert_eq!(rx.try_recv().unwrap().bytes, b"again".to_vec());

        session.dispose();
        assert!(!session.is_open());
        assert!(!line.is_open());
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let line = SimulatedLine::new();
        let session = session_on(&line, "SIM0");
        session.close();
        session.close();
        assert_eq!(session.current_error(), "");
    }

    #[test]
    fn test_close_failure_is_captured() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        line.fail_close(Some("EIO"));

        session.close();
        assert!(!session.is_open());
        let err = session.take_error().unwrap();
        assert!(matches!(err, SessionError::Close { .. }));
        assert!(err.to_string().contains("EIO"));
    }

    #[test]
    fn test_dispose_ends_subscriptions() {
        let line = SimulatedLine::new();
        let session = open_session(&line);
        let mut rx = session.subscribe();

        session.dispose();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
        assert_eq!(session.listener_count(), 0);
    }

    #[test]
    fn test_drop_releases_open_port() {
        let line = SimulatedLine::new();
        {
            let _session = open_session(&line);
            assert!(line.is_open());
        }
        assert!(!line.is_open());
    }

    #[test]
    fn test_unknown_option_strings_use_defaults() {
        let line = SimulatedLine::new();
        let session = SerialSession::with_device(Box::new(line.device()), "SIM0", 19200, "evn", 7, "1.5");

        let settings = session.settings().unwrap();
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(line.settings().unwrap().baud_rate, 19200);
        assert_eq!(session.current_error(), "");
    }

    #[test]
    fn test_missing_strings_leave_session_unconfigured() {
        let line = SimulatedLine::new();
        let session = SerialSession::with_device(Box::new(line.device()), "SIM0", 9600, "", 8, "one");

        assert!(session.settings().is_none());
        assert!(line.settings().is_none());
        assert_eq!(session.current_error(), "");

        assert!(!session.open());
        assert!(session.current_error().contains("not been configured"));
    }

    #[test]
    fn test_unsupported_settings_are_configuration_errors() {
        let line = SimulatedLine::new();
        let session = SerialSession::with_device(Box::new(line.device()), "SIM0", 9600, "mark", 8, "one");

        let err = session.take_error().unwrap();
        assert!(matches!(err, SessionError::Configuration { .. }));
        assert!(err.to_string().starts_with("Serial port SIM0 error"));
        assert!(!session.open());
    }

    #[test]
    fn test_newer_error_overwrites_unread_one() {
        let line = SimulatedLine::new();
        let session = session_on(&line, "SIM0");

        session.send_bytes(b"a");
        session.dispose();
        session.open();
        assert_eq!(session.current_error(), "Port Null");
        assert_eq!(session.current_error(), "");
    }

    #[test]
    fn test_ascii_text_encoding() {
        let line = SimulatedLine::new();
        let settings = crate::settings::parse_settings(
            "port = \"SIM0\"\ntext_encoding = \"ascii\"\n",
        )
        .unwrap();
        let session = SerialSession::from_settings_with_device(Box::new(line.device()), &settings);
        assert_eq!(session.text_encoding(), TextEncoding::Ascii);

        assert!(session.open());
        assert!(session.send_text("25°C"));
        assert_eq!(line.written(), vec![b"25?C".to_vec()]);
    }

    #[test]
    fn test_close_races_with_inbound_delivery() {
        let line = SimulatedLine::new();
        let session = Arc::new(open_session(&line));
        let mut rx = session.subscribe();

        let feeder = {
            let line = line.clone();
            std::thread::spawn(move || {
                let mut delivered = 0usize;
                for i in 0..500u32 {
                    if line.inject(&i.to_le_bytes()) {
                        delivered += 1;
                    }
                }
                delivered
            })
        };

        // Once the poller sees the port closed it must never see it open again
        let polling = Arc::new(AtomicBool::new(true));
        let poller = {
            let session = session.clone();
            let polling = polling.clone();
            std::thread::spawn(move || {
                let mut seen_closed = false;
                let mut reopened = false;
                while polling.load(Ordering::SeqCst) {
                    let open = session.is_open();
                    if seen_closed && open {
                        reopened = true;
                    }
                    seen_closed |= !open;
                }
                reopened
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(1));
        session.close();

        let mut received = 0usize;
        while let Ok(packet) = rx.try_recv() {
            assert_eq!(packet.len(), 4);
            received += 1;
        }

        let delivered = feeder.join().unwrap();
        polling.store(false, Ordering::SeqCst);
        assert!(!poller.join().unwrap());

        // Nothing injected after close() returned reached the listener
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(received <= delivered);
        assert!(!session.is_open());
        assert_eq!(session.current_error(), "");
    }

    #[test]
    fn test_repeated_receive_failures_are_throttled() {
        let interval = Duration::from_secs(1);
        let start = Instant::now();
        let mut log = FailureLog::default();

        assert_eq!(log.admit(start, interval), Some(0));
        for ms in 1..=499u64 {
            assert_eq!(log.admit(start + Duration::from_millis(ms), interval), None);
        }
        assert_eq!(log.admit(start + interval, interval), Some(499));
        assert_eq!(log.admit(start + interval, interval), None);
        assert_eq!(log.admit(start + interval * 3, interval), Some(1));
    }
}
