//! Wire format of a single log record.
//!
//! A committed record in a staging buffer is laid out as
//!
//! ```text
//! [ u64 log_id ][ u64 info_size ][ i64 ms_timestamp ][ arg bytes... ]
//! ```
//!
//! `info_size` counts the whole record including the header and is the sole
//! resynchronization marker: the consumer advances exactly that many bytes
//! per record. Argument bytes follow the rules below, applied in parameter
//! order:
//!
//! * non-string values are the raw bytes of their native width,
//! * byte strings are `[usize byte_length][bytes...][0x00]` with
//!   `byte_length` excluding the NUL and already truncated by whichever
//!   precision rule applied,
//! * wide strings store `byte_length = codepoints * 4` followed by the `u32`
//!   units verbatim and a single NUL byte,
//! * dynamic width/precision values are the raw bytes of their source
//!   integer, and a dynamic precision is remembered so it can bound the
//!   stored length of the string that follows.

use std::ptr;

use crate::format::ParamType;

/// Bytes occupied by the record header.
pub const HEADER_SIZE: usize = 24;

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub log_id: u64,
    pub info_size: u64,
    pub ms_timestamp: i64,
}

impl RecordHeader {
    /// Reads a header from the start of `bytes`, or `None` when fewer than
    /// [`HEADER_SIZE`] bytes are present.
    pub fn read(bytes: &[u8]) -> Option<RecordHeader> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(RecordHeader {
            log_id: u64::from_ne_bytes(bytes[0..8].try_into().unwrap()),
            info_size: u64::from_ne_bytes(bytes[8..16].try_into().unwrap()),
            ms_timestamp: i64::from_ne_bytes(bytes[16..24].try_into().unwrap()),
        })
    }
}

/// One argument captured at a callsite, borrowed from the caller for the
/// duration of the `log` call. The encoder copies it into the staging buffer
/// before returning, so nothing is retained.
#[derive(Debug, Clone, Copy)]
pub enum LogArg<'a> {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(char),
    Str(&'a str),
    WideStr(&'a [u32]),
    Ptr(usize),
}

impl LogArg<'_> {
    /// Encoded width of the value itself. Strings answer 0; their size is
    /// computed from content and precision.
    pub fn native_size(&self) -> usize {
        match self {
            LogArg::I8(_) | LogArg::U8(_) => 1,
            LogArg::I16(_) | LogArg::U16(_) => 2,
            LogArg::I32(_) | LogArg::U32(_) | LogArg::F32(_) | LogArg::Char(_) => 4,
            LogArg::I64(_) | LogArg::U64(_) | LogArg::F64(_) => 8,
            LogArg::Ptr(_) => std::mem::size_of::<usize>(),
            LogArg::Str(_) | LogArg::WideStr(_) => 0,
        }
    }

    fn as_precision(&self) -> usize {
        // Mirrors the encode-side convention for precision arguments:
        // a negative value wraps around and therefore never truncates.
        match *self {
            LogArg::I8(v) => v as usize,
            LogArg::I16(v) => v as usize,
            LogArg::I32(v) => v as usize,
            LogArg::I64(v) => v as usize,
            LogArg::U8(v) => v as usize,
            LogArg::U16(v) => v as usize,
            LogArg::U32(v) => v as usize,
            LogArg::U64(v) => v as usize,
            _ => 0,
        }
    }
}

/// The string length actually stored, in source units, after applying the
/// static cap or a preceding dynamic precision.
fn effective_units(param_type: ParamType, len: usize, pre_precision: usize) -> usize {
    match param_type {
        ParamType::String(cap) => len.min(cap as usize),
        ParamType::StringWithDynamicPrecision => len.min(pre_precision),
        _ => len,
    }
}

/// Encoded size of one argument. Updates `pre_precision` when the argument
/// is a dynamic precision so the following string sizes itself identically
/// on both the size and encode passes.
pub fn arg_encoded_size(param_type: ParamType, arg: &LogArg, pre_precision: &mut usize) -> usize {
    if param_type.is_string() {
        return match arg {
            LogArg::Str(s) => {
                effective_units(param_type, s.len(), *pre_precision) + std::mem::size_of::<usize>() + 1
            }
            LogArg::WideStr(w) => {
                effective_units(param_type, w.len(), *pre_precision) * 4 + std::mem::size_of::<usize>() + 1
            }
            // A non-string value in a string slot is a callsite defect; it is
            // rejected at registration before sizing can ever see it.
            _ => 0,
        };
    }

    if param_type == ParamType::DynamicPrecision {
        *pre_precision = arg.as_precision();
    }

    match arg {
        // A string passed where the specifier names a non-string is stored
        // as its address, exactly like any other pointer.
        LogArg::Str(_) | LogArg::WideStr(_) => std::mem::size_of::<usize>(),
        _ => arg.native_size(),
    }
}

/// Per-parameter encoded widths as recorded in a descriptor at
/// registration, derived from the first invocation's argument types.
/// Strings answer 0: their length travels inline in each record.
pub fn param_sizes_for(param_types: &[ParamType], args: &[LogArg]) -> Vec<usize> {
    param_types
        .iter()
        .zip(args)
        .map(|(pt, arg)| {
            if pt.is_string() {
                0
            } else {
                match arg {
                    LogArg::Str(_) | LogArg::WideStr(_) => std::mem::size_of::<usize>(),
                    _ => arg.native_size(),
                }
            }
        })
        .collect()
}

/// Total encoded record size for an argument list, header included.
pub fn record_size(param_types: &[ParamType], args: &[LogArg]) -> usize {
    let mut pre_precision = 0usize;
    let mut size = HEADER_SIZE;
    for (pt, arg) in param_types.iter().zip(args) {
        size += arg_encoded_size(*pt, arg, &mut pre_precision);
    }
    size
}

unsafe fn put_bytes(dst: &mut *mut u8, bytes: &[u8]) {
    ptr::copy_nonoverlapping(bytes.as_ptr(), *dst, bytes.len());
    *dst = dst.add(bytes.len());
}

/// Encodes a complete record at `dst`.
///
/// # Safety
///
/// `dst` must point to at least `info_size` writable bytes, where
/// `info_size` was computed by [`record_size`] over the same
/// `(param_types, args)` pair.
pub unsafe fn encode_record(
    dst: *mut u8,
    log_id: u64,
    info_size: u64,
    ms_timestamp: i64,
    param_types: &[ParamType],
    args: &[LogArg],
) {
    let mut p = dst;
    put_bytes(&mut p, &log_id.to_ne_bytes());
    put_bytes(&mut p, &info_size.to_ne_bytes());
    put_bytes(&mut p, &ms_timestamp.to_ne_bytes());

    let mut pre_precision = 0usize;
    for (pt, arg) in param_types.iter().zip(args) {
        if pt.is_string() {
            match arg {
                LogArg::Str(s) => {
                    let n = effective_units(*pt, s.len(), pre_precision);
                    put_bytes(&mut p, &n.to_ne_bytes());
                    put_bytes(&mut p, &s.as_bytes()[..n]);
                    put_bytes(&mut p, &[0u8]);
                }
                LogArg::WideStr(w) => {
                    let n = effective_units(*pt, w.len(), pre_precision);
                    put_bytes(&mut p, &(n * 4).to_ne_bytes());
                    for unit in &w[..n] {
                        put_bytes(&mut p, &unit.to_ne_bytes());
                    }
                    put_bytes(&mut p, &[0u8]);
                }
                _ => {}
            }
            continue;
        }

        if *pt == ParamType::DynamicPrecision {
            pre_precision = arg.as_precision();
        }

        match *arg {
            LogArg::I8(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::I16(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::I32(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::I64(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::U8(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::U16(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::U32(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::U64(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::F32(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::F64(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::Char(c) => put_bytes(&mut p, &(c as u32).to_ne_bytes()),
            LogArg::Ptr(v) => put_bytes(&mut p, &v.to_ne_bytes()),
            LogArg::Str(s) => put_bytes(&mut p, &(s.as_ptr() as usize).to_ne_bytes()),
            LogArg::WideStr(w) => put_bytes(&mut p, &(w.as_ptr() as usize).to_ne_bytes()),
        }
    }

    debug_assert_eq!(p as usize - dst as usize, info_size as usize);
}

unsafe fn load_raw(p: *const u8, nbytes: usize) -> [u8; 8] {
    let mut buf = [0u8; 8];
    ptr::copy_nonoverlapping(p, buf.as_mut_ptr(), nbytes.min(8));
    buf
}

/// Loads a signed integer of `nbytes` width (1, 2, 4 or 8) from `p`.
///
/// # Safety
///
/// `p` must point to at least `nbytes` readable bytes.
pub unsafe fn load_signed(p: *const u8, nbytes: usize) -> i64 {
    let b = load_raw(p, nbytes);
    match nbytes {
        1 => i8::from_ne_bytes([b[0]]) as i64,
        2 => i16::from_ne_bytes([b[0], b[1]]) as i64,
        4 => i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as i64,
        8 => i64::from_ne_bytes(b),
        _ => 0,
    }
}

/// Loads an unsigned integer of `nbytes` width (1, 2, 4 or 8) from `p`.
///
/// # Safety
///
/// `p` must point to at least `nbytes` readable bytes.
pub unsafe fn load_unsigned(p: *const u8, nbytes: usize) -> u64 {
    let b = load_raw(p, nbytes);
    match nbytes {
        1 => b[0] as u64,
        2 => u16::from_ne_bytes([b[0], b[1]]) as u64,
        4 => u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as u64,
        8 => u64::from_ne_bytes(b),
        _ => 0,
    }
}

/// Loads a float of `nbytes` width (4 or 8) from `p`.
///
/// # Safety
///
/// `p` must point to at least `nbytes` readable bytes.
pub unsafe fn load_float(p: *const u8, nbytes: usize) -> f64 {
    let b = load_raw(p, nbytes);
    match nbytes {
        4 => f32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f64,
        8 => f64::from_ne_bytes(b),
        _ => 0.0,
    }
}

/// Loads the `usize` length prefix of an inline string segment.
///
/// # Safety
///
/// `p` must point to at least `size_of::<usize>()` readable bytes.
pub unsafe fn load_usize(p: *const u8) -> usize {
    let b = load_raw(p, std::mem::size_of::<usize>());
    usize::from_ne_bytes(b[..std::mem::size_of::<usize>()].try_into().unwrap())
}

/// Conversion of caller values into [`LogArg`]s, implemented for everything
/// a format specifier can consume.
pub trait Loggable {
    fn as_log_arg(&self) -> LogArg<'_>;
}

macro_rules! loggable_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl Loggable for $ty {
            fn as_log_arg(&self) -> LogArg<'_> {
                LogArg::$variant(*self)
            }
        })*
    };
}

loggable_scalar! {
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64, char => Char,
}

impl Loggable for isize {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::I64(*self as i64)
    }
}

impl Loggable for usize {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::U64(*self as u64)
    }
}

impl Loggable for str {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::Str(self)
    }
}

impl Loggable for String {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::Str(self)
    }
}

impl Loggable for [u32] {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::WideStr(self)
    }
}

impl<const N: usize> Loggable for [u32; N] {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::WideStr(self)
    }
}

impl<T> Loggable for *const T {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::Ptr(*self as usize)
    }
}

impl<T> Loggable for *mut T {
    fn as_log_arg(&self) -> LogArg<'_> {
        LogArg::Ptr(*self as usize)
    }
}

impl<T: Loggable + ?Sized> Loggable for &T {
    fn as_log_arg(&self) -> LogArg<'_> {
        (**self).as_log_arg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::analyze_format;

    fn encode_to_vec(fmt: &str, args: &[LogArg], log_id: u64, ts: i64) -> Vec<u8> {
        let analysis = analyze_format(fmt).unwrap();
        let size = record_size(&analysis.param_types, args);
        let mut buf = vec![0u8; size];
        unsafe {
            encode_record(
                buf.as_mut_ptr(),
                log_id,
                size as u64,
                ts,
                &analysis.param_types,
                args,
            );
        }
        buf
    }

    #[test]
    fn header_round_trip() {
        let buf = encode_to_vec("no args", &[], 7, 1_700_000_000_000);
        assert_eq!(buf.len(), HEADER_SIZE);
        let header = RecordHeader::read(&buf).unwrap();
        assert_eq!(header.log_id, 7);
        assert_eq!(header.info_size, HEADER_SIZE as u64);
        assert_eq!(header.ms_timestamp, 1_700_000_000_000);

        assert!(RecordHeader::read(&buf[..HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn non_string_round_trip() {
        let args = [LogArg::I32(-42), LogArg::U64(u64::MAX), LogArg::F64(3.25)];
        let buf = encode_to_vec("%d %llu %f", &args, 0, 0);
        assert_eq!(buf.len(), HEADER_SIZE + 4 + 8 + 8);

        unsafe {
            let p = buf.as_ptr().add(HEADER_SIZE);
            assert_eq!(load_signed(p, 4), -42);
            assert_eq!(load_unsigned(p.add(4), 8), u64::MAX);
            assert_eq!(load_float(p.add(12), 8), 3.25);
        }
    }

    #[test]
    fn narrow_widths_round_trip() {
        let args = [LogArg::I8(-5), LogArg::U16(515), LogArg::F32(1.5)];
        let buf = encode_to_vec("%hhd %hu %f", &args, 0, 0);
        unsafe {
            let p = buf.as_ptr().add(HEADER_SIZE);
            assert_eq!(load_signed(p, 1), -5);
            assert_eq!(load_unsigned(p.add(1), 2), 515);
            assert_eq!(load_float(p.add(3), 4), 1.5);
        }
    }

    #[test]
    fn dynamic_precision_bounds_string_segment() {
        // "val=%.*s|" with (3, "abcdef"): the string segment must be
        // [usize 3]['a']['b']['c'][0x00].
        let args = [LogArg::I32(3), LogArg::Str("abcdef")];
        let buf = encode_to_vec("val=%.*s|", &args, 0, 0);

        let usize_len = std::mem::size_of::<usize>();
        assert_eq!(buf.len(), HEADER_SIZE + 4 + usize_len + 3 + 1);

        let seg = &buf[HEADER_SIZE + 4..];
        unsafe {
            assert_eq!(load_usize(seg.as_ptr()), 3);
        }
        assert_eq!(&seg[usize_len..usize_len + 3], b"abc");
        assert_eq!(seg[usize_len + 3], 0);
    }

    #[test]
    fn static_cap_truncates() {
        let args = [LogArg::Str("abcdef")];
        let buf = encode_to_vec("%.2s", &args, 0, 0);
        let usize_len = std::mem::size_of::<usize>();
        assert_eq!(buf.len(), HEADER_SIZE + usize_len + 2 + 1);
        assert_eq!(&buf[HEADER_SIZE + usize_len..HEADER_SIZE + usize_len + 2], b"ab");
    }

    #[test]
    fn negative_dynamic_precision_never_truncates() {
        let args = [LogArg::I32(-1), LogArg::Str("abcdef")];
        let buf = encode_to_vec("%.*s", &args, 0, 0);
        let usize_len = std::mem::size_of::<usize>();
        assert_eq!(buf.len(), HEADER_SIZE + 4 + usize_len + 6 + 1);
    }

    #[test]
    fn wide_string_segment() {
        let wide = ['h' as u32, 'i' as u32, 0x4e2d];
        let args = [LogArg::WideStr(&wide)];
        let buf = encode_to_vec("%ls", &args, 0, 0);

        let usize_len = std::mem::size_of::<usize>();
        assert_eq!(buf.len(), HEADER_SIZE + usize_len + 12 + 1);
        unsafe {
            let p = buf.as_ptr().add(HEADER_SIZE);
            assert_eq!(load_usize(p), 12);
            assert_eq!(load_unsigned(p.add(usize_len), 4), 'h' as u64);
            assert_eq!(load_unsigned(p.add(usize_len + 8), 4), 0x4e2d);
        }
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn size_matches_encode_for_mixed_args() {
        // The invariant both sides rely on: record_size equals what
        // encode_record actually writes (checked by its debug_assert).
        let wide = ['a' as u32; 4];
        let args = [
            LogArg::I32(2),
            LogArg::Str("hello"),
            LogArg::U8(9),
            LogArg::I16(4),
            LogArg::WideStr(&wide),
        ];
        let buf = encode_to_vec("%.*s %hhu %.*ls", &args, 3, 99);
        let header = RecordHeader::read(&buf).unwrap();
        assert_eq!(header.info_size as usize, buf.len());
    }
}
