// src/catalog.rs
//
// Port option catalog: canonical option strings for building configuration
// UIs, plus enumeration of the host's serial ports. Independent of any session.

use serde::Serialize;

/// Common baud rates, slowest first
pub static BAUD_RATES: &[u32] = &[
    300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Every stop bit name a session recognises.
///
/// `onepointfive` and `none` are not supported by the serialport driver and
/// fail construction with a configuration error; offer `SUPPORTED_STOP_BITS`
/// in pickers.
pub static STOP_BITS: &[&str] = &["one", "onepointfive", "two", "none"];

/// Stop bit names the serialport driver can open with
pub static SUPPORTED_STOP_BITS: &[&str] = &["one", "two"];

/// Every parity name a session recognises.
///
/// `mark` and `space` are not supported by the serialport driver and fail
/// construction with a configuration error; offer `SUPPORTED_PARITIES` in
/// pickers.
pub static PARITIES: &[&str] = &["none", "odd", "even", "mark", "space"];

/// Parity names the serialport driver can open with
pub static SUPPORTED_PARITIES: &[&str] = &["none", "odd", "even"];

/// Data bit counts
pub static DATA_BITS: &[u8] = &[5, 6, 7, 8];

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The cu (calling unit) devices are non-blocking and preferred for outgoing connections.
/// The tty (terminal) devices block on open waiting for carrier detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports = serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    Ok(ports
        .into_iter()
        .filter(|p| is_listed(&p.port_name))
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

/// Names of the ports currently present on the host.
/// Enumeration failures yield an empty list.
pub fn available_port_names() -> Vec<String> {
    match list_serial_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            tlog!("[catalog] {}", e);
            Vec::new()
        }
    }
}

#[cfg_attr(not(target_os = "macos"), allow(unused_variables))]
fn is_listed(port_name: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        !port_name.starts_with("/dev/tty.")
    }
    #[cfg(not(target_os = "macos"))]
    {
        true
    }
}
