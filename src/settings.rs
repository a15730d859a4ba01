use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::io::serial::utils::{parse_text_encoding, LineSettings, TextEncoding};

/// Session settings as stored in a TOML file.
///
/// Option strings are kept as written; resolution (with silent fallback for
/// unknown values) happens when the session is built.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_parity")]
    pub parity: String, // "none" | "odd" | "even" | "mark" | "space"
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: String, // "none" | "one" | "onepointfive" | "two"
    #[serde(default = "default_text_encoding")]
    pub text_encoding: String, // "utf8" | "ascii"
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> String {
    "one".to_string()
}
fn default_text_encoding() -> String {
    "utf8".to_string()
}

impl SessionSettings {
    /// Settings for `port` with every other field at its default
    pub fn for_port(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: default_baud_rate(),
            parity: default_parity(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            text_encoding: default_text_encoding(),
        }
    }

    /// Resolved line settings, `None` when a required string is empty
    pub fn line_settings(&self) -> Option<LineSettings> {
        LineSettings::from_parts(
            &self.port,
            self.baud_rate,
            &self.parity,
            self.data_bits,
            &self.stop_bits,
        )
    }

    pub fn encoding(&self) -> TextEncoding {
        parse_text_encoding(&self.text_encoding)
    }
}

pub fn parse_settings(content: &str) -> Result<SessionSettings, String> {
    toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))
}

pub fn load_settings(path: &Path) -> Result<SessionSettings, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read settings file {}: {}", path.display(), e))?;
    parse_settings(&content)
}

pub fn save_settings(path: &Path, settings: &SessionSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }
    }

    let content = toml::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
}
