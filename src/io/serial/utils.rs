// src/io/serial/utils.rs
//
// Line setting types and their string / serialport conversions.
// Option strings resolve case-insensitively; unknown strings fall back to the
// default setting instead of failing.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, StopBits as SpStopBits};

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Stop bit setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    None,
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Encoding used by `send_text`.
///
/// UTF-8 is the default. ASCII mirrors the classic serial-port encoder:
/// every non-ASCII character becomes `?`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
}

impl Parity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
            Parity::Mark => "mark",
            Parity::Space => "space",
        }
    }

    /// Single-letter form used in `9600-8-N-1` style summaries.
    pub fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        }
    }
}

impl StopBits {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopBits::None => "none",
            StopBits::One => "one",
            StopBits::OnePointFive => "onepointfive",
            StopBits::Two => "two",
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            StopBits::None => "0",
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        }
    }
}

impl TextEncoding {
    /// Encode text for the wire.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

// ============================================================================
// String Resolution
// ============================================================================

/// Resolve a parity name ("none", "odd", "even", "mark", "space").
/// Unrecognised names resolve to `Parity::None`.
pub fn parse_parity(s: &str) -> Parity {
    match s.trim().to_lowercase().as_str() {
        "odd" => Parity::Odd,
        "even" => Parity::Even,
        "mark" => Parity::Mark,
        "space" => Parity::Space,
        _ => Parity::None,
    }
}

/// Resolve a stop bits name ("none", "one", "onepointfive", "two").
/// Unrecognised names resolve to `StopBits::One`.
pub fn parse_stop_bits(s: &str) -> StopBits {
    match s.trim().to_lowercase().as_str() {
        "none" => StopBits::None,
        "onepointfive" => StopBits::OnePointFive,
        "two" => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Resolve a text encoding name ("utf8", "utf-8", "ascii").
/// Unrecognised names resolve to `TextEncoding::Utf8`.
pub fn parse_text_encoding(s: &str) -> TextEncoding {
    match s.trim().to_lowercase().as_str() {
        "ascii" | "us-ascii" => TextEncoding::Ascii,
        _ => TextEncoding::Utf8,
    }
}

// ============================================================================
// Line Settings
// ============================================================================

/// Immutable line parameters of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LineSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: StopBits,
}

impl LineSettings {
    /// Build settings from the raw construction parameters.
    ///
    /// Returns `None` when the port name, parity or stop bits string is empty;
    /// the session is then left unconfigured.
    pub fn from_parts(
        port_name: &str,
        baud_rate: u32,
        parity: &str,
        data_bits: u8,
        stop_bits: &str,
    ) -> Option<Self> {
        if port_name.trim().is_empty() || parity.trim().is_empty() || stop_bits.trim().is_empty() {
            return None;
        }
        Some(Self {
            port_name: port_name.to_string(),
            baud_rate,
            parity: parse_parity(parity),
            data_bits,
            stop_bits: parse_stop_bits(stop_bits),
        })
    }

    /// `9600-8-E-1` style summary for log lines.
    pub fn summary(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits.summary()
        )
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: &Parity) -> Result<SpParity, String> {
    match p {
        Parity::None => Ok(SpParity::None),
        Parity::Odd => Ok(SpParity::Odd),
        Parity::Even => Ok(SpParity::Even),
        Parity::Mark | Parity::Space => Err(format!(
            "Parity '{}' is not supported by the serial driver",
            p.as_str()
        )),
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Data bits must be between 5 and 8 (got {})", bits)),
    }
}

/// Convert our StopBits enum to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: &StopBits) -> Result<SpStopBits, String> {
    match bits {
        StopBits::One => Ok(SpStopBits::One),
        StopBits::Two => Ok(SpStopBits::Two),
        StopBits::None | StopBits::OnePointFive => Err(format!(
            "Stop bits '{}' is not supported by the serial driver",
            bits.as_str()
        )),
    }
}

/// Check a baud rate before handing it to the driver
pub fn validate_baud_rate(baud_rate: u32) -> Result<u32, String> {
    if baud_rate == 0 {
        return Err("Baud rate must be a positive number".to_string());
    }
    Ok(baud_rate)
}

// ============================================================================
// Tests
// ============================================================================
