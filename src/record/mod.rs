//! The persisted settings record.
//!
//! One record holds four relay device slots followed by the audio gain-control
//! settings. It is stored as a single `#`-delimited string, see [`codec`].

pub mod codec;

pub use codec::{decode, encode};

use std::ops::RangeInclusive;

/// Number of relay device slots in a record.
pub const DEVICE_SLOTS: usize = 4;
/// Number of fields in the encoded record.
pub const FIELD_COUNT: usize = DEVICE_SLOTS * 3 + 3;
/// Separator between encoded fields. Never appears inside a field.
pub const DELIMITER: char = '#';
/// Maximum length of a device name, in bytes.
pub const NAME_CAPACITY: usize = 32;
/// Highest GPIO number a relay can be mapped to.
pub const MAX_PIN: u8 = 48;
/// Accepted AGC level percentages.
pub const AGC_LEVEL_RANGE: RangeInclusive<u8> = 1..=100;

/// Bounded device name.
pub type DeviceName = heapless::String<NAME_CAPACITY>;

/// A single relay-driven device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSlot {
    /// Display name, may be empty.
    pub name: DeviceName,
    /// GPIO the relay is wired to, `None` when unassigned.
    pub pin: Option<u8>,
    /// Whether the relay is switched on.
    pub on: bool,
}

impl DeviceSlot {
    pub fn new(name: &str, pin: Option<u8>, on: bool) -> Self {
        Self {
            name: device_name(name),
            pin,
            on,
        }
    }
}

/// Audio gain-control settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioSettings {
    /// AGC on the wake-word detector input.
    pub wake_word_agc: bool,
    /// AGC on the audio pipeline.
    pub audio_agc: bool,
    /// AGC level in percent, `None` when never set.
    pub agc_level: Option<u8>,
}

/// The whole persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsRecord {
    pub devices: [DeviceSlot; DEVICE_SLOTS],
    pub audio: AudioSettings,
}

/// Builds a [`DeviceName`], cutting at the first delimiter and at the capacity.
///
/// Truncation happens on a character boundary, so the result may be shorter
/// than [`NAME_CAPACITY`] bytes when the input contains multi-byte characters.
pub fn device_name(raw: &str) -> DeviceName {
    let mut name = DeviceName::new();
    let raw = raw.split(DELIMITER).next().unwrap_or_default();
    for c in raw.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

/// Why a single field value was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    NotANumber,
    OutOfRange,
    NotAFlag,
    /// The value did not fit its buffer or was not valid text.
    Malformed,
}

/// Parses a pin token. The empty token means "unassigned".
pub fn parse_pin(token: &str) -> Result<Option<u8>, FieldError> {
    if token.is_empty() {
        return Ok(None);
    }
    let pin: u8 = token.parse().map_err(|_| FieldError::NotANumber)?;
    if pin > MAX_PIN {
        return Err(FieldError::OutOfRange);
    }
    Ok(Some(pin))
}

/// Parses a `0`/`1` flag. The empty token reads as `false`.
pub fn parse_flag(token: &str) -> Result<bool, FieldError> {
    match token {
        "" | "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(FieldError::NotAFlag),
    }
}

/// Parses an AGC level percentage. The empty token means "unset".
pub fn parse_level(token: &str) -> Result<Option<u8>, FieldError> {
    if token.is_empty() {
        return Ok(None);
    }
    let level: u8 = token.parse().map_err(|_| FieldError::NotANumber)?;
    if !AGC_LEVEL_RANGE.contains(&level) {
        return Err(FieldError::OutOfRange);
    }
    Ok(Some(level))
}
