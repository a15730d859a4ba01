// src/io/serial/mod.rs
//
// Serial session over one hardware port.
//
// Features:
// - Line configuration with silent fallback for unknown option strings
// - Open/close/dispose with failures captured in a read-and-clear error slot
// - Raw inbound chunks pushed to channel and callback listeners
// - Single-call blocking writes (bytes or encoded text)

pub mod device;
pub mod error;
pub mod session;
pub mod simulated;
pub mod utils;

pub use device::{DataReceivedHandler, SerialDevice, SerialportDevice};
pub use error::SessionError;
pub use session::{InboundPacket, ListenerId, SerialSession};
pub use simulated::{SimulatedDevice, SimulatedLine};
pub use utils::{parse_parity, parse_stop_bits, LineSettings, Parity, StopBits, TextEncoding};
