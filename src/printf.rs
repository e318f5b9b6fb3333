//! Specifier-driven runtime formatter.
//!
//! The assembler hands this module one stencil out of a descriptor's
//! `conversion_storage` (a byte-identical copy of the original specifier,
//! e.g. `%-8.3lf`), the dynamic width/precision values decoded from the
//! record, and the argument value. [`expand`] appends the complete expansion
//! to a scratch buffer; the assembler then decides whether the expansion
//! fits its output region.
//!
//! Length modifiers in the stencil are ignored here: the argument already
//! arrives at its native width, decoded via the descriptor's `param_sizes`.

/// Argument value as decoded from a record.
#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Bytes(&'a [u8]),
    Wide(&'a [u32]),
    Pointer(u64),
}

#[derive(Debug, Default)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
    conversion: u8,
}

fn parse_spec(stencil: &[u8], dyn_width: Option<i64>, dyn_precision: Option<i64>) -> Spec {
    let mut spec = Spec::default();
    let mut i = 1; // skip '%'

    while i < stencil.len() {
        match stencil[i] {
            b'-' => spec.left = true,
            b'+' => spec.plus = true,
            b' ' => spec.space = true,
            b'#' => spec.alt = true,
            b'0' => spec.zero = true,
            _ => break,
        }
        i += 1;
    }

    if stencil.get(i) == Some(&b'*') {
        let w = dyn_width.unwrap_or(0);
        // A negative dynamic width means left alignment with |w|.
        if w < 0 {
            spec.left = true;
        }
        spec.width = w.unsigned_abs() as usize;
        i += 1;
    } else {
        while i < stencil.len() && stencil[i].is_ascii_digit() {
            spec.width = spec.width * 10 + (stencil[i] - b'0') as usize;
            i += 1;
        }
    }

    if stencil.get(i) == Some(&b'.') {
        i += 1;
        if stencil.get(i) == Some(&b'*') {
            // A negative dynamic precision reads as if omitted.
            spec.precision = dyn_precision.and_then(|p| usize::try_from(p).ok());
            i += 1;
        } else {
            let mut p = 0usize;
            while i < stencil.len() && stencil[i].is_ascii_digit() {
                p = p * 10 + (stencil[i] - b'0') as usize;
                i += 1;
            }
            spec.precision = Some(p);
        }
    }

    while i < stencil.len() && matches!(stencil[i], b'h' | b'l' | b'j' | b'z' | b't' | b'L') {
        i += 1;
    }

    spec.conversion = stencil.get(i).copied().unwrap_or(b'd');
    spec
}

fn as_signed(value: &Value) -> i64 {
    match *value {
        Value::Signed(v) => v,
        Value::Unsigned(v) => v as i64,
        Value::Float(v) => v as i64,
        Value::Pointer(v) => v as i64,
        _ => 0,
    }
}

fn as_unsigned(value: &Value) -> u64 {
    match *value {
        Value::Signed(v) => v as u64,
        Value::Unsigned(v) => v,
        Value::Float(v) => v as u64,
        Value::Pointer(v) => v,
        _ => 0,
    }
}

fn as_float(value: &Value) -> f64 {
    match *value {
        Value::Signed(v) => v as f64,
        Value::Unsigned(v) => v as f64,
        Value::Float(v) => v,
        Value::Pointer(v) => v as f64,
        _ => 0.0,
    }
}

/// Assembles `[sign][prefix][body]` padded to the spec's width. Zero padding
/// goes between the prefix and the body; left alignment and an explicit
/// precision both disable it.
fn emit_padded(out: &mut Vec<u8>, spec: &Spec, sign: &str, prefix: &str, body: &[u8], allow_zero_pad: bool) {
    let content_len = sign.len() + prefix.len() + body.len();
    let pad = spec.width.saturating_sub(content_len);

    if spec.left {
        out.extend_from_slice(sign.as_bytes());
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(body);
        out.extend(std::iter::repeat(b' ').take(pad));
    } else if spec.zero && allow_zero_pad {
        out.extend_from_slice(sign.as_bytes());
        out.extend_from_slice(prefix.as_bytes());
        out.extend(std::iter::repeat(b'0').take(pad));
        out.extend_from_slice(body);
    } else {
        out.extend(std::iter::repeat(b' ').take(pad));
        out.extend_from_slice(sign.as_bytes());
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(body);
    }
}

fn unsigned_digits(mut v: u64, base: u64, upper: bool) -> Vec<u8> {
    let digits = if upper {
        b"0123456789ABCDEF"
    } else {
        b"0123456789abcdef"
    };
    let mut buf = Vec::with_capacity(20);
    loop {
        buf.push(digits[(v % base) as usize]);
        v /= base;
        if v == 0 {
            break;
        }
    }
    buf.reverse();
    buf
}

fn emit_integer(out: &mut Vec<u8>, spec: &Spec, negative: bool, magnitude: u64) {
    let (base, upper) = match spec.conversion {
        b'o' => (8, false),
        b'x' => (16, false),
        b'X' => (16, true),
        _ => (10, false),
    };

    // Precision 0 with a zero value prints nothing.
    let mut body = if spec.precision == Some(0) && magnitude == 0 {
        Vec::new()
    } else {
        unsigned_digits(magnitude, base, upper)
    };
    if let Some(p) = spec.precision {
        while body.len() < p {
            body.insert(0, b'0');
        }
    }

    let sign = if negative {
        "-"
    } else if spec.plus && matches!(spec.conversion, b'd' | b'i') {
        "+"
    } else if spec.space && matches!(spec.conversion, b'd' | b'i') {
        " "
    } else {
        ""
    };

    let prefix = match spec.conversion {
        b'x' if spec.alt && magnitude != 0 => "0x",
        b'X' if spec.alt && magnitude != 0 => "0X",
        b'o' if spec.alt && !body.starts_with(b"0") => "0",
        _ => "",
    };

    emit_padded(out, spec, sign, prefix, &body, spec.precision.is_none());
}

fn float_sign(spec: &Spec, negative: bool) -> &'static str {
    if negative {
        "-"
    } else if spec.plus {
        "+"
    } else if spec.space {
        " "
    } else {
        ""
    }
}

fn emit_float_special(out: &mut Vec<u8>, spec: &Spec, v: f64) {
    let upper = spec.conversion.is_ascii_uppercase();
    let body: &[u8] = if v.is_nan() {
        if upper {
            b"NAN"
        } else {
            b"nan"
        }
    } else if upper {
        b"INF"
    } else {
        b"inf"
    };
    emit_padded(out, spec, float_sign(spec, v.is_sign_negative()), "", body, false);
}

/// Splits Rust's `{:e}` rendering into mantissa and exponent, then rebuilds
/// the C shape with a signed, two-digit exponent.
fn exp_style(av: f64, precision: usize) -> (String, i32) {
    let s = format!("{:.*e}", precision, av);
    let pos = s.rfind('e').unwrap();
    let mantissa = s[..pos].to_string();
    let exponent: i32 = s[pos + 1..].parse().unwrap();
    (mantissa, exponent)
}

fn emit_float(out: &mut Vec<u8>, spec: &Spec, v: f64) {
    if !v.is_finite() {
        emit_float_special(out, spec, v);
        return;
    }

    let negative = v.is_sign_negative();
    let av = v.abs();
    let sign = float_sign(spec, negative);
    let upper = spec.conversion.is_ascii_uppercase();

    let mut body: String = match spec.conversion {
        b'f' | b'F' => {
            let p = spec.precision.unwrap_or(6);
            let mut s = format!("{:.*}", p, av);
            if spec.alt && p == 0 {
                s.push('.');
            }
            s
        }
        b'e' | b'E' => {
            let p = spec.precision.unwrap_or(6);
            let (mut mantissa, exponent) = exp_style(av, p);
            if spec.alt && p == 0 {
                mantissa.push('.');
            }
            format!("{}e{}{:02}", mantissa, if exponent < 0 { '-' } else { '+' }, exponent.abs())
        }
        b'g' | b'G' => {
            let p = spec.precision.unwrap_or(6).max(1);
            let (_, exponent) = exp_style(av, p - 1);
            if exponent >= -4 && exponent < p as i32 {
                let frac = (p as i32 - 1 - exponent) as usize;
                let mut s = format!("{:.*}", frac, av);
                if !spec.alt && s.contains('.') {
                    while s.ends_with('0') {
                        s.pop();
                    }
                    if s.ends_with('.') {
                        s.pop();
                    }
                }
                s
            } else {
                let (mut mantissa, exponent) = exp_style(av, p - 1);
                if !spec.alt && mantissa.contains('.') {
                    while mantissa.ends_with('0') {
                        mantissa.pop();
                    }
                    if mantissa.ends_with('.') {
                        mantissa.pop();
                    }
                }
                format!("{}e{}{:02}", mantissa, if exponent < 0 { '-' } else { '+' }, exponent.abs())
            }
        }
        b'a' | b'A' => hex_float(av, spec.precision),
        _ => format!("{}", av),
    };

    if upper {
        body = body.to_uppercase();
    }
    emit_padded(out, spec, sign, "", body.as_bytes(), true);
}

/// C `%a` rendering of a non-negative finite double: `0xh.hhhp±d` with the
/// binary exponent in decimal. Without a precision the mantissa is exact
/// with trailing zero digits stripped.
fn hex_float(av: f64, precision: Option<usize>) -> String {
    let bits = av.to_bits();
    let raw_exponent = ((bits >> 52) & 0x7ff) as i64;
    let fraction = bits & ((1u64 << 52) - 1);

    if av == 0.0 {
        return match precision {
            Some(p) if p > 0 => format!("0x0.{}p+0", "0".repeat(p)),
            _ => "0x0p+0".to_string(),
        };
    }

    let (lead, exponent) = if raw_exponent == 0 {
        (0u8, -1022i64)
    } else {
        (1u8, raw_exponent - 1023)
    };

    // 13 hex digits hold the full 52-bit fraction.
    let mut digits: Vec<u8> = (0..13).map(|i| ((fraction >> (48 - 4 * i)) & 0xf) as u8).collect();
    let mut lead = lead;

    let keep = match precision {
        Some(p) => {
            if p < 13 {
                // Round half to even at the cut.
                let dropped_bits = 52 - 4 * p as u64;
                let rem = fraction & ((1u64 << dropped_bits) - 1);
                let half = 1u64 << (dropped_bits - 1);
                let kept_lsb_odd = if p == 0 {
                    lead & 1 == 1
                } else {
                    digits[p - 1] & 1 == 1
                };
                if rem > half || (rem == half && kept_lsb_odd) {
                    let mut carry = 1u8;
                    for d in digits[..p].iter_mut().rev() {
                        let sum = *d + carry;
                        *d = sum & 0xf;
                        carry = sum >> 4;
                        if carry == 0 {
                            break;
                        }
                    }
                    if p == 0 || carry == 1 {
                        lead += 1;
                    }
                }
            }
            digits.truncate(precision.unwrap());
            while digits.len() < precision.unwrap() {
                digits.push(0);
            }
            digits.len()
        }
        None => {
            let mut keep = 13;
            while keep > 0 && digits[keep - 1] == 0 {
                keep -= 1;
            }
            keep
        }
    };

    let mut s = format!("0x{:x}", lead);
    if keep > 0 {
        s.push('.');
        for d in &digits[..keep] {
            s.push(char::from_digit(*d as u32, 16).unwrap());
        }
    }
    s.push_str(&format!("p{}{}", if exponent < 0 { '-' } else { '+' }, exponent.abs()));
    s
}

fn emit_char(out: &mut Vec<u8>, spec: &Spec, value: &Value) {
    let code = as_unsigned(value) as u32;
    let c = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
    let mut body = [0u8; 4];
    let body = c.encode_utf8(&mut body);
    emit_padded(out, spec, "", "", body.as_bytes(), false);
}

fn emit_string(out: &mut Vec<u8>, spec: &Spec, value: &Value) {
    let mut body: Vec<u8> = match *value {
        Value::Bytes(bytes) => {
            let cap = spec.precision.unwrap_or(bytes.len()).min(bytes.len());
            bytes[..cap].to_vec()
        }
        Value::Wide(units) => {
            let cap = spec.precision.unwrap_or(units.len()).min(units.len());
            let mut buf = Vec::with_capacity(cap * 4);
            for unit in &units[..cap] {
                let c = char::from_u32(*unit).unwrap_or(char::REPLACEMENT_CHARACTER);
                let mut enc = [0u8; 4];
                buf.extend_from_slice(c.encode_utf8(&mut enc).as_bytes());
            }
            buf
        }
        _ => Vec::new(),
    };
    if spec.precision == Some(0) {
        body.clear();
    }
    emit_padded(out, spec, "", "", &body, false);
}

fn emit_pointer(out: &mut Vec<u8>, spec: &Spec, value: &Value) {
    let body = unsigned_digits(as_unsigned(value), 16, false);
    emit_padded(out, spec, "", "0x", &body, false);
}

/// Expands one specifier against its argument, appending the full rendering
/// to `out`. The stencil must come from an analyzed descriptor; length
/// modifiers inside it are skipped.
pub fn expand(stencil: &[u8], dyn_width: Option<i64>, dyn_precision: Option<i64>, value: Value, out: &mut Vec<u8>) {
    let spec = parse_spec(stencil, dyn_width, dyn_precision);

    match spec.conversion {
        b'd' | b'i' => {
            let v = as_signed(&value);
            emit_integer(out, &spec, v < 0, v.unsigned_abs());
        }
        b'u' | b'o' | b'x' | b'X' => {
            emit_integer(out, &spec, false, as_unsigned(&value));
        }
        b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => {
            emit_float(out, &spec, as_float(&value));
        }
        b'c' => emit_char(out, &spec, &value),
        b's' => emit_string(out, &spec, &value),
        b'p' => emit_pointer(out, &spec, &value),
        _ => {}
    }
}
