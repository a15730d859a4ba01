#[macro_use]
pub mod logging;

pub mod catalog;
pub mod io;
pub mod settings;

pub use catalog::{available_port_names, list_serial_ports, SerialPortInfo};
pub use io::serial::{
    InboundPacket, LineSettings, ListenerId, Parity, SerialDevice, SerialSession, SessionError,
    SimulatedLine, StopBits, TextEncoding,
};
pub use settings::{load_settings, parse_settings, save_settings, SessionSettings};
