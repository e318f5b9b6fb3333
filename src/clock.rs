//! Wall-clock timestamps and their rendered form.
//!
//! Records carry milliseconds since the Unix epoch; the consumer renders
//! them in local time as `YYYY-MM-DD HH:MM:SS.mmm `. The local UTC offset is
//! resolved once, at first use, because querying it is not reliable once
//! other threads exist; when it cannot be determined the rendering falls
//! back to UTC.

use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use time::{OffsetDateTime, UtcOffset};

/// Rendered length of a timestamp, trailing space included.
pub const TIMESTAMP_LEN: usize = "YYYY-MM-DD hh:mm:ss.mmm ".len();

lazy_static! {
    static ref LOCAL_OFFSET: UtcOffset =
        UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

// Writes `value` into `out[*pos..]` zero-padded to `digits` and advances
// the cursor.
fn write_padded(out: &mut [u8], pos: &mut usize, mut value: u64, digits: usize) {
    for i in (0..digits).rev() {
        out[*pos + i] = b'0' + (value % 10) as u8;
        value /= 10;
    }
    *pos += digits;
}

/// Renders `ms` with an explicit UTC offset. Returns the rendered length,
/// always [`TIMESTAMP_LEN`].
pub fn render_timestamp_at(ms: i64, offset: UtcOffset, out: &mut [u8; TIMESTAMP_LEN]) -> usize {
    let seconds = ms.div_euclid(1000);
    let millis = ms.rem_euclid(1000) as u64;

    let dt = OffsetDateTime::from_unix_timestamp(seconds)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .to_offset(offset);

    let mut pos = 0;
    write_padded(out, &mut pos, dt.year().unsigned_abs() as u64, 4);
    out[pos] = b'-';
    pos += 1;
    write_padded(out, &mut pos, u8::from(dt.month()) as u64, 2);
    out[pos] = b'-';
    pos += 1;
    write_padded(out, &mut pos, dt.day() as u64, 2);
    out[pos] = b' ';
    pos += 1;
    write_padded(out, &mut pos, dt.hour() as u64, 2);
    out[pos] = b':';
    pos += 1;
    write_padded(out, &mut pos, dt.minute() as u64, 2);
    out[pos] = b':';
    pos += 1;
    write_padded(out, &mut pos, dt.second() as u64, 2);
    out[pos] = b'.';
    pos += 1;
    write_padded(out, &mut pos, millis, 3);
    out[pos] = b' ';
    pos + 1
}

/// Renders `ms` in local time (UTC when the local offset is unknown).
pub fn render_timestamp(ms: i64, out: &mut [u8; TIMESTAMP_LEN]) -> usize {
    render_timestamp_at(ms, *LOCAL_OFFSET, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_instant_in_utc() {
        let mut buf = [0u8; TIMESTAMP_LEN];
        let len = render_timestamp_at(1_700_000_000_000, UtcOffset::UTC, &mut buf);
        assert_eq!(len, TIMESTAMP_LEN);
        assert_eq!(&buf[..len], b"2023-11-14 22:13:20.000 ");
    }

    #[test]
    fn millisecond_padding() {
        let mut buf = [0u8; TIMESTAMP_LEN];
        render_timestamp_at(1_700_000_000_007, UtcOffset::UTC, &mut buf);
        assert!(buf.ends_with(b".007 "));

        render_timestamp_at(1_700_000_000_070, UtcOffset::UTC, &mut buf);
        assert!(buf.ends_with(b".070 "));

        render_timestamp_at(1_700_000_000_700, UtcOffset::UTC, &mut buf);
        assert!(buf.ends_with(b".700 "));
    }

    #[test]
    fn offset_shifts_rendering() {
        let mut buf = [0u8; TIMESTAMP_LEN];
        let offset = UtcOffset::from_hms(1, 0, 0).unwrap();
        render_timestamp_at(1_700_000_000_000, offset, &mut buf);
        assert_eq!(&buf[..], b"2023-11-14 23:13:20.000 ");
    }

    #[test]
    fn unix_millis_is_current() {
        let a = unix_millis();
        assert!(a > 1_600_000_000_000);
    }
}
