//! Format-string pre-analysis.
//!
//! Every callsite's printf-style format string is parsed exactly once into a
//! [`StaticLogInfo`] descriptor: one [`FormatFragment`] per conversion
//! specifier, one [`ParamType`] per formal parameter slot, and a packed
//! `conversion_storage` array holding a byte-identical, NUL-terminated copy
//! of each specifier for the runtime formatter. The descriptor is immutable
//! and reused for every record the callsite ever emits.
//!
//! Grammar walked by the analyzer:
//!
//! ```text
//! spec := '%' flag* width? ('.' precision)? length? conversion
//! width := '*' | digits        precision := '*' | digits
//! conversion ∈ { d i u o x X f F e E g G a A c p s }
//! ```
//!
//! `%%` is an escape that consumes no argument and stays literal format text.
//! `%n` is rejected.

use thiserror::Error;

/// Sentinel for a callsite id slot that has not been registered yet.
pub const UNREGISTERED_LOG_ID: i32 = -1;

/// Log severity. Records with a severity above the configured threshold are
/// dropped before any encoding happens.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Threshold value that disables all output.
    None = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    pub(crate) fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::None,
            1 => LogLevel::Error,
            2 => LogLevel::Warning,
            3 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    /// Bracketed tag used in the formatted line prefix.
    pub(crate) fn tag(self) -> &'static str {
        match self {
            LogLevel::None => "[<none>]",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warning => "[WARNING]",
            LogLevel::Info => "[INFO]",
            LogLevel::Debug => "[DEBUG]",
        }
    }
}

/// Native type named by a conversion specifier, derived from its length
/// modifier and conversion letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionType {
    None,

    UnsignedChar,
    UnsignedShort,
    UnsignedInt,
    UnsignedLong,
    UnsignedLongLong,
    UnsignedMax,
    Size,
    WideChar,

    SignedChar,
    Short,
    Int,
    Long,
    LongLong,
    SignedMax,
    Ptrdiff,

    Double,
    LongDouble,

    Pointer,
    ByteString,
    WideString,
}

impl ConversionType {
    pub fn is_signed_integer(self) -> bool {
        matches!(
            self,
            ConversionType::SignedChar
                | ConversionType::Short
                | ConversionType::Int
                | ConversionType::Long
                | ConversionType::LongLong
                | ConversionType::SignedMax
                | ConversionType::Ptrdiff
        )
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(
            self,
            ConversionType::UnsignedChar
                | ConversionType::UnsignedShort
                | ConversionType::UnsignedInt
                | ConversionType::UnsignedLong
                | ConversionType::UnsignedLongLong
                | ConversionType::UnsignedMax
                | ConversionType::Size
                | ConversionType::WideChar
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ConversionType::Double | ConversionType::LongDouble)
    }
}

/// Classification of one formal parameter slot in a format string.
///
/// Encodable as an `i32`: the negative values tag the non-string cases and
/// any value `>= 0` is a string parameter with that static precision cap
/// (`%.20s` encodes as `20`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Invalid,
    /// The `*` in the width slot, e.g. `%*d`.
    DynamicWidth,
    /// The `*` in the precision slot, e.g. `%.*f`.
    DynamicPrecision,
    /// Any non-string value parameter.
    NonString,
    /// `%.*s`: the string whose cap is the preceding dynamic precision.
    StringWithDynamicPrecision,
    /// `%s`: no precision cap.
    StringWithNoPrecision,
    /// `%.Ns`: static precision cap of `N`.
    String(u32),
}

impl ParamType {
    pub fn to_i32(self) -> i32 {
        match self {
            ParamType::Invalid => -6,
            ParamType::DynamicWidth => -5,
            ParamType::DynamicPrecision => -4,
            ParamType::NonString => -3,
            ParamType::StringWithDynamicPrecision => -2,
            ParamType::StringWithNoPrecision => -1,
            ParamType::String(cap) => cap as i32,
        }
    }

    pub fn from_i32(v: i32) -> ParamType {
        match v {
            -6 => ParamType::Invalid,
            -5 => ParamType::DynamicWidth,
            -4 => ParamType::DynamicPrecision,
            -3 => ParamType::NonString,
            -2 => ParamType::StringWithDynamicPrecision,
            -1 => ParamType::StringWithNoPrecision,
            cap => ParamType::String(cap as u32),
        }
    }

    /// True for the three variants that take a string argument.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            ParamType::StringWithDynamicPrecision
                | ParamType::StringWithNoPrecision
                | ParamType::String(_)
        )
    }
}

/// One conversion specifier within a format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatFragment {
    /// Native type the specifier converts.
    pub conversion_type: ConversionType,
    /// Bytes the specifier occupies in the original format string.
    pub specifier_length: usize,
    /// Byte offset of the leading `%` in the format string.
    pub format_pos: usize,
    /// Byte offset of this specifier's stencil in `conversion_storage`.
    pub storage_pos: usize,
}

/// Parse failure. Registration of a malformed callsite aborts loudly at
/// first use: the logger cannot format records it does not understand.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unrecognized conversion specifier {found:?} after '%' at byte {pos}")]
    UnknownSpecifier { pos: usize, found: char },
    #[error("conversion specifier %n is not supported (byte {pos})")]
    UnsupportedSpecifier { pos: usize },
    #[error("format string ends inside a conversion specifier starting at byte {pos}")]
    TruncatedSpecifier { pos: usize },
    #[error("format string needs {expected} arguments, callsite passed {got}")]
    ArgumentCountMismatch { expected: usize, got: usize },
}

/// Immutable per-callsite descriptor produced by [`analyze_format`] plus the
/// callsite identity and the argument widths observed at registration.
///
/// Invariants: `fragments` is sorted by `format_pos`, `storage_pos` values
/// are strictly increasing, and every stencil in `conversion_storage` ends
/// with a single NUL byte.
#[derive(Debug)]
pub struct StaticLogInfo {
    pub filename: &'static str,
    pub line_number: u32,
    pub severity: LogLevel,
    pub format: &'static str,
    pub conversion_storage: Box<[u8]>,
    pub fragments: Box<[FormatFragment]>,
    pub param_types: Box<[ParamType]>,
    /// Per-parameter encoded byte width. Strings use 0 here; their size is
    /// carried inline in the record.
    pub param_sizes: Box<[usize]>,
}

impl StaticLogInfo {
    pub fn num_conversions(&self) -> usize {
        self.fragments.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.param_types.len()
    }

    /// The NUL-terminated stencil for `fragment`, without the NUL.
    pub fn stencil(&self, fragment: &FormatFragment) -> &[u8] {
        &self.conversion_storage[fragment.storage_pos..fragment.storage_pos + fragment.specifier_length]
    }
}

/// Result of one analyzer pass over a format string.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FormatAnalysis {
    pub fragments: Vec<FormatFragment>,
    pub param_types: Vec<ParamType>,
    pub conversion_storage: Vec<u8>,
}

fn is_flag(b: u8) -> bool {
    matches!(b, b'-' | b'+' | b' ' | b'#' | b'0')
}

fn is_length(b: u8) -> bool {
    matches!(b, b'h' | b'l' | b'j' | b'z' | b't' | b'L')
}

fn is_conversion(b: u8) -> bool {
    matches!(
        b,
        b'd' | b'i'
            | b'u'
            | b'o'
            | b'x'
            | b'X'
            | b'f'
            | b'F'
            | b'e'
            | b'E'
            | b'g'
            | b'G'
            | b'a'
            | b'A'
            | b'c'
            | b'p'
            | b's'
    )
}

/// Maps a length-modifier set and conversion letter to the native type.
fn conversion_type(letter: u8, h_cnt: u32, l_cnt: u32, big_l: bool, j: bool, z: bool, t: bool) -> ConversionType {
    match letter {
        b'd' | b'i' => {
            if h_cnt >= 2 {
                ConversionType::SignedChar
            } else if l_cnt >= 2 {
                ConversionType::LongLong
            } else if h_cnt >= 1 {
                ConversionType::Short
            } else if l_cnt >= 1 {
                ConversionType::Long
            } else if j {
                ConversionType::SignedMax
            } else if z {
                ConversionType::Size
            } else if t {
                ConversionType::Ptrdiff
            } else {
                ConversionType::Int
            }
        }
        b'u' | b'o' | b'x' | b'X' => {
            if h_cnt >= 2 {
                ConversionType::UnsignedChar
            } else if l_cnt >= 2 {
                ConversionType::UnsignedLongLong
            } else if h_cnt >= 1 {
                ConversionType::UnsignedShort
            } else if l_cnt >= 1 {
                ConversionType::UnsignedLong
            } else if j {
                ConversionType::UnsignedMax
            } else if z {
                ConversionType::Size
            } else if t {
                ConversionType::Ptrdiff
            } else {
                ConversionType::UnsignedInt
            }
        }
        b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => {
            if big_l {
                ConversionType::LongDouble
            } else {
                ConversionType::Double
            }
        }
        b'c' => {
            if l_cnt >= 1 {
                ConversionType::WideChar
            } else {
                ConversionType::Int
            }
        }
        b's' => {
            if l_cnt >= 1 {
                ConversionType::WideString
            } else {
                ConversionType::ByteString
            }
        }
        b'p' => ConversionType::Pointer,
        _ => ConversionType::None,
    }
}

/// Walks `fmt` once, producing the fragment array, the parameter
/// classification in consumption order, and the packed stencil storage.
pub fn analyze_format(fmt: &str) -> Result<FormatAnalysis, FormatError> {
    let bytes = fmt.as_bytes();
    let mut out = FormatAnalysis::default();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        let spec_start = i;
        i += 1;

        if i < bytes.len() && bytes[i] == b'%' {
            // Escape, stays literal format text.
            i += 1;
            continue;
        }

        let storage_pos = out.conversion_storage.len();
        out.conversion_storage.push(b'%');

        macro_rules! cur {
            () => {
                *bytes.get(i).ok_or(FormatError::TruncatedSpecifier { pos: spec_start })?
            };
        }

        while is_flag(cur!()) {
            out.conversion_storage.push(bytes[i]);
            i += 1;
        }

        if cur!() == b'*' {
            out.param_types.push(ParamType::DynamicWidth);
            out.conversion_storage.push(b'*');
            i += 1;
        } else {
            while cur!().is_ascii_digit() {
                out.conversion_storage.push(bytes[i]);
                i += 1;
            }
        }

        let mut has_dynamic_precision = false;
        let mut precision: i64 = -1;
        if cur!() == b'.' {
            out.conversion_storage.push(b'.');
            i += 1;
            if cur!() == b'*' {
                out.param_types.push(ParamType::DynamicPrecision);
                out.conversion_storage.push(b'*');
                has_dynamic_precision = true;
                i += 1;
            } else {
                precision = 0;
                while cur!().is_ascii_digit() {
                    precision = precision * 10 + i64::from(bytes[i] - b'0');
                    out.conversion_storage.push(bytes[i]);
                    i += 1;
                }
            }
        }

        let (mut h_cnt, mut l_cnt) = (0u32, 0u32);
        let (mut big_l, mut j, mut z, mut t) = (false, false, false, false);
        while is_length(cur!()) {
            match bytes[i] {
                b'h' => h_cnt += 1,
                b'l' => l_cnt += 1,
                b'L' => big_l = true,
                b'j' => j = true,
                b'z' => z = true,
                b't' => t = true,
                _ => {}
            }
            out.conversion_storage.push(bytes[i]);
            i += 1;
        }

        let letter = cur!();
        if letter == b'n' {
            return Err(FormatError::UnsupportedSpecifier { pos: spec_start });
        }
        if !is_conversion(letter) {
            return Err(FormatError::UnknownSpecifier {
                pos: spec_start,
                found: letter as char,
            });
        }
        out.conversion_storage.push(letter);
        out.conversion_storage.push(0);
        i += 1;

        out.param_types.push(if letter != b's' {
            ParamType::NonString
        } else if has_dynamic_precision {
            ParamType::StringWithDynamicPrecision
        } else if precision < 0 {
            ParamType::StringWithNoPrecision
        } else {
            ParamType::String(precision as u32)
        });

        out.fragments.push(FormatFragment {
            conversion_type: conversion_type(letter, h_cnt, l_cnt, big_l, j, z, t),
            specifier_length: i - spec_start,
            format_pos: spec_start,
            storage_pos,
        });
    }

    Ok(out)
}
