//! Delimited string form of [`SettingsRecord`].
//!
//! Layout, in order: `name#pin#state` for each of the four devices, then
//! `wake_word_agc#audio_agc#agc_level`. Flags are `0`/`1`, unset numbers are
//! empty tokens.

use super::{
    AudioSettings, DELIMITER, DeviceSlot, FIELD_COUNT, SettingsRecord, device_name, parse_flag,
    parse_level, parse_pin,
};

/// Encodes a record into its 15-field stored form.
pub fn encode(record: &SettingsRecord) -> String {
    let mut fields: Vec<String> = Vec::with_capacity(FIELD_COUNT);
    for device in &record.devices {
        fields.push(device_name(&device.name).to_string());
        fields.push(optional_number(device.pin));
        fields.push(flag(device.on).to_string());
    }
    fields.push(flag(record.audio.wake_word_agc).to_string());
    fields.push(flag(record.audio.audio_agc).to_string());
    fields.push(optional_number(record.audio.agc_level));
    fields.join(&*DELIMITER.encode_utf8(&mut [0; 4]))
}

/// Decodes a stored string. Never fails.
///
/// Missing trailing tokens read as empty, tokens past the fifteenth are
/// ignored, and a token that does not parse leaves its field at the default.
pub fn decode(raw: &str) -> SettingsRecord {
    let mut tokens = raw.split(DELIMITER).chain(std::iter::repeat(""));
    let mut next = move || tokens.next().unwrap_or_default();

    let mut record = SettingsRecord::default();
    for slot in record.devices.iter_mut() {
        *slot = DeviceSlot {
            name: device_name(next()),
            pin: parse_pin(next()).ok().flatten(),
            on: parse_flag(next()).unwrap_or_default(),
        };
    }
    record.audio = AudioSettings {
        wake_word_agc: parse_flag(next()).unwrap_or_default(),
        audio_agc: parse_flag(next()).unwrap_or_default(),
        agc_level: parse_level(next()).ok().flatten(),
    };
    record
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn optional_number(value: Option<u8>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
