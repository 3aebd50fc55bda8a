//! # Telemetry Line Parser
//!
//! Turns one line of board output into a [`TelemetryRecord`].
//!
//! Wire format, one record per line, 16 positional fields, no header:
//!
//! ```text
//! date,time,satellites,lat,lon,alt,xAcc,yAcc,zAcc,xMag,yMag,zMag,xGyro,yGyro,zGyro,temp
//! ```

use std::borrow::Cow;

use super::TelemetryRecord;

/// Field delimiter on the wire
pub const FIELD_DELIMITER: char = ',';

/// Number of positional fields in a complete record
pub const RECORD_FIELD_COUNT: usize = 16;

/// Parse one line into a telemetry record
///
/// Leading and trailing whitespace is trimmed before splitting. Lines with fewer
/// than [`RECORD_FIELD_COUNT`] fields return `None`; partial lines are normal
/// while the board boots, so they are not errors. Fields past the 16th are ignored.
///
/// # Examples
///
/// ```
/// use teensy_telemetry::telemetry::parser::parse_record;
///
/// let record = parse_record("2024-01-01,12:00:00,8,40.0,-75.0,100,0.1,0.2,9.8,10,20,30,0.01,0.02,0.03,25.0")
///     .unwrap();
/// assert_eq!(record.satellite_count, "8");
/// assert!(parse_record("garbage").is_none());
/// ```
pub fn parse_record(line: &str) -> Option<TelemetryRecord> {
    let fields: Vec<&str> = line.trim().split(FIELD_DELIMITER).collect();
    if fields.len() < RECORD_FIELD_COUNT {
        return None;
    }

    let field = |i: usize| fields[i].to_string();
    let vector = |start: usize| [field(start), field(start + 1), field(start + 2)];

    Some(TelemetryRecord {
        date: field(0),
        time: field(1),
        satellite_count: field(2),
        latitude: field(3),
        longitude: field(4),
        altitude: field(5),
        acceleration: vector(6),
        magnetic_field: vector(9),
        angular_velocity: vector(12),
        temperature: field(15),
    })
}

/// Decode raw line bytes into text
///
/// Invalid UTF-8 sequences are dropped rather than replaced, so line noise on the
/// wire never shows up as U+FFFD inside a field. A trailing `\n` or `\r\n` is
/// removed. Borrows when the input is already valid.
pub fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);

    if let Ok(text) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(text);
    }

    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    Cow::Owned(text)
}
