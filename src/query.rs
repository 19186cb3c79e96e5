//! Parsing of the `/settings` query string.
//!
//! Every value is URL-decoded straight into a fixed-capacity buffer, so a
//! client can never make the parser allocate per field. Names that do not fit
//! are cut silently. A number or flag that does not fit rejects the request in
//! [`SettingsForm::to_record`], where all values are validated.

use thiserror::Error;

use crate::record::{
    AudioSettings, DEVICE_SLOTS, FieldError, NAME_CAPACITY, SettingsRecord, device_name,
    parse_flag, parse_level, parse_pin,
};

/// Longest query string accepted on the write path.
pub const MAX_QUERY_LEN: usize = 2048;
pub const PIN_CAPACITY: usize = 8;
pub const FLAG_CAPACITY: usize = 4;
pub const LEVEL_CAPACITY: usize = 8;

const NAME_KEYS: [&str; DEVICE_SLOTS] = ["Den1", "Den2", "Den3", "Den4"];
const PIN_KEYS: [&str; DEVICE_SLOTS] = ["Den1IO", "Den2IO", "Den3IO", "Den4IO"];
const STATE_KEYS: [&str; DEVICE_SLOTS] = ["Den1Sta", "Den2Sta", "Den3Sta", "Den4Sta"];
const WAKE_WORD_AGC_KEY: &str = "AgcW";
const AUDIO_AGC_KEY: &str = "AgcA";
const AGC_LEVEL_KEY: &str = "AgcL";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("Invalid value for {key}")]
    InvalidField {
        key: &'static str,
        reason: FieldError,
    },
}

/// What a `/settings` request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsRequest {
    /// No query: serve the settings page.
    Read,
    /// A query is present: replace the stored record.
    Write(SettingsForm),
}

impl SettingsRequest {
    pub fn from_query(query: Option<&str>) -> Result<Self, QueryError> {
        match query {
            None | Some("") => Ok(SettingsRequest::Read),
            Some(query) if query.len() > MAX_QUERY_LEN => Err(QueryError::TooLong {
                len: query.len(),
                max: MAX_QUERY_LEN,
            }),
            Some(query) => Ok(SettingsRequest::Write(SettingsForm::parse(query))),
        }
    }
}

/// Raw values of one device slot, decoded but not validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceForm {
    pub name: heapless::String<NAME_CAPACITY>,
    pub pin: heapless::String<PIN_CAPACITY>,
    pub state: heapless::String<FLAG_CAPACITY>,
}

/// The fifteen `/settings` values, decoded but not validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsForm {
    pub devices: [DeviceForm; DEVICE_SLOTS],
    pub wake_word_agc: heapless::String<FLAG_CAPACITY>,
    pub audio_agc: heapless::String<FLAG_CAPACITY>,
    pub agc_level: heapless::String<LEVEL_CAPACITY>,
    /// First numeric or flag key whose value was cut or not valid UTF-8.
    pub malformed: Option<&'static str>,
}

impl SettingsForm {
    /// Extracts and decodes all fields. Absent keys become empty strings.
    pub fn parse(query: &str) -> Self {
        let mut form = SettingsForm::default();
        let mut exact = ExactFields::default();
        for (i, device) in form.devices.iter_mut().enumerate() {
            device.name = field(query, NAME_KEYS[i]);
            device.pin = exact.field(query, PIN_KEYS[i]);
            device.state = exact.field(query, STATE_KEYS[i]);
        }
        form.wake_word_agc = exact.field(query, WAKE_WORD_AGC_KEY);
        form.audio_agc = exact.field(query, AUDIO_AGC_KEY);
        form.agc_level = exact.field(query, AGC_LEVEL_KEY);
        form.malformed = exact.malformed;
        form
    }

    /// Validates every field. Either all fifteen are accepted or none is.
    pub fn to_record(&self) -> Result<SettingsRecord, QueryError> {
        if let Some(key) = self.malformed {
            return Err(QueryError::InvalidField {
                key,
                reason: FieldError::Malformed,
            });
        }
        let mut record = SettingsRecord::default();
        for (i, (slot, form)) in record.devices.iter_mut().zip(&self.devices).enumerate() {
            slot.name = device_name(&form.name);
            slot.pin = parse_pin(&form.pin).map_err(invalid(PIN_KEYS[i]))?;
            slot.on = parse_flag(&form.state).map_err(invalid(STATE_KEYS[i]))?;
        }
        record.audio = AudioSettings {
            wake_word_agc: parse_flag(&self.wake_word_agc).map_err(invalid(WAKE_WORD_AGC_KEY))?,
            audio_agc: parse_flag(&self.audio_agc).map_err(invalid(AUDIO_AGC_KEY))?,
            agc_level: parse_level(&self.agc_level).map_err(invalid(AGC_LEVEL_KEY))?,
        };
        Ok(record)
    }
}

fn invalid(key: &'static str) -> impl Fn(FieldError) -> QueryError {
    move |reason| QueryError::InvalidField { key, reason }
}

/// Names are cut silently.
fn field<const N: usize>(query: &str, key: &str) -> heapless::String<N> {
    query_value(query, key)
        .map(url_decode::<N>)
        .unwrap_or_default()
}

/// Numbers and flags must decode completely, a cut `0000000549` must not read as `5`.
#[derive(Default)]
struct ExactFields {
    malformed: Option<&'static str>,
}

impl ExactFields {
    fn field<const N: usize>(&mut self, query: &str, key: &'static str) -> heapless::String<N> {
        let Some(raw) = query_value(query, key) else {
            return heapless::String::new();
        };
        let (decoded, complete) = decode_bounded::<N>(raw);
        if !complete && self.malformed.is_none() {
            self.malformed = Some(key);
        }
        decoded
    }
}

/// Returns the raw value of the first `key=value` pair matching `key`.
///
/// A bare `key` without `=` has an empty value.
pub fn query_value<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then_some(value)
    })
}

/// URL-decodes `raw` into a buffer of at most `N` bytes.
///
/// `%XX` becomes the byte, `+` becomes a space, and a `%` not followed by two
/// hex digits is kept as is. Output stops when the buffer is full. Bytes that
/// do not form valid UTF-8, including a character cut by the capacity, are dropped.
pub fn url_decode<const N: usize>(raw: &str) -> heapless::String<N> {
    decode_bounded(raw).0
}

/// Like [`url_decode`], also reporting whether every input byte made it into the output.
fn decode_bounded<const N: usize>(raw: &str) -> (heapless::String<N>, bool) {
    let input = raw.as_bytes();
    let mut bytes: heapless::Vec<u8, N> = heapless::Vec::new();
    let mut i = 0;
    while i < input.len() {
        let (byte, consumed) = match input[i] {
            b'%' => match (
                input.get(i + 1).and_then(hex_value),
                input.get(i + 2).and_then(hex_value),
            ) {
                (Some(hi), Some(lo)) => ((hi << 4) | lo, 3),
                _ => (b'%', 1),
            },
            b'+' => (b' ', 1),
            other => (other, 1),
        };
        if bytes.push(byte).is_err() {
            break;
        }
        i += consumed;
    }

    let mut complete = i == input.len();
    let mut decoded = heapless::String::new();
    for chunk in bytes.utf8_chunks() {
        // Valid text is a subset of `bytes`, so it always fits.
        let _ = decoded.push_str(chunk.valid());
        complete &= chunk.invalid().is_empty();
    }
    (decoded, complete)
}

fn hex_value(byte: &u8) -> Option<u8> {
    (*byte as char).to_digit(16).map(|digit| digit as u8)
}
