//! Shell and C-style quoting of byte names.
//!
//! Object and path names land in human-readable reports and in generated
//! shell fragments; they are byte strings, not UTF-8, so all quoting here
//! operates on [`BStr`]/[`BString`].

use bstr::{BStr, BString, ByteVec};

use crate::UtilError;

/// Returns true if a byte needs shell-quoting (single quote or exclamation).
fn need_bs_quote(c: u8) -> bool {
    c == b'\'' || c == b'!'
}

/// Single-quote shell quoting.
///
/// Wraps the name in single quotes, escaping embedded single quotes as
/// `'\''` (and `!` as `'\!'`). The result is one shell word that expands
/// back to the input.
///
/// ```text
/// name  ==>  'name'
/// a b   ==>  'a b'
/// a'b   ==>  'a'\''b'
/// ```
pub fn sq_quote(src: &BStr) -> BString {
    let mut out = BString::from("'");
    for &c in src.iter() {
        if need_bs_quote(c) {
            out.push_str(b"'\\");
            out.push_byte(c);
            out.push_byte(b'\'');
        } else {
            out.push_byte(c);
        }
    }
    out.push_byte(b'\'');
    out
}

/// C-quote lookup table.
/// Positive: quote as octal always.
/// Zero: high byte, quote as octal.
/// Negative: never quote.
/// Char value: quote as `\<char>`.
fn cq_lookup(c: u8) -> i8 {
    match c {
        0x00..=0x06 => 1,
        0x07 => b'a' as i8,
        0x08 => b'b' as i8,
        0x09 => b't' as i8,
        0x0a => b'n' as i8,
        0x0b => b'v' as i8,
        0x0c => b'f' as i8,
        0x0d => b'r' as i8,
        0x0e..=0x1f => 1,
        0x22 => b'"' as i8,  // "
        0x5c => b'\\' as i8, // backslash
        0x7f => 1,
        0x80..=0xff => 0,
        _ => -1, // printable ASCII (except " and \)
    }
}

fn cq_must_quote(c: u8) -> bool {
    cq_lookup(c) + 1 > 0
}

/// Returns true if the name contains bytes that require C-style quoting:
/// control chars, `"`, `\`, or bytes ≥ 0x80.
pub fn needs_c_quoting(name: &BStr) -> bool {
    name.iter().any(|&b| cq_must_quote(b))
}

/// C-style name quoting.
///
/// Produces a double-quoted string with backslash escapes for control
/// characters, `"`, `\`, and high bytes (as three-digit octal). Returns the
/// name unchanged when no quoting is needed.
pub fn quote_c_style(name: &BStr) -> BString {
    if !needs_c_quoting(name) {
        return BString::from(&name[..]);
    }

    let mut out = BString::from("\"");
    for &b in name.iter() {
        if !cq_must_quote(b) {
            out.push_byte(b);
            continue;
        }
        let lookup = cq_lookup(b);
        out.push_byte(b'\\');
        if lookup >= b' ' as i8 {
            out.push_byte(lookup as u8);
        } else {
            out.push_byte(((b >> 6) & 0o3) + b'0');
            out.push_byte(((b >> 3) & 0o7) + b'0');
            out.push_byte((b & 0o7) + b'0');
        }
    }
    out.push_byte(b'"');
    out
}

/// C-style name unquoting.
///
/// `quoted` must start at the opening double quote. Returns the unquoted
/// name and the number of bytes consumed, including the closing quote, so
/// callers can keep parsing past it.
pub fn unquote_c_style(quoted: &BStr) -> Result<(BString, usize), UtilError> {
    let bytes: &[u8] = quoted;
    if bytes.first() != Some(&b'"') {
        return Err(UtilError::BadQuoting { position: 0 });
    }

    let mut out = BString::from(Vec::new());
    let mut i = 1;
    loop {
        let &c = bytes.get(i).ok_or(UtilError::BadQuoting { position: i })?;
        i += 1;
        match c {
            b'"' => return Ok((out, i)),
            b'\\' => {
                let &esc = bytes.get(i).ok_or(UtilError::BadQuoting { position: i })?;
                i += 1;
                let decoded = match esc {
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b't' => b'\t',
                    b'n' => b'\n',
                    b'v' => 0x0b,
                    b'f' => 0x0c,
                    b'r' => b'\r',
                    b'\\' | b'"' => esc,
                    b'0'..=b'7' => {
                        // octal escapes are exactly three digits
                        let mut value = (esc - b'0') as u32;
                        for _ in 0..2 {
                            let &d = bytes.get(i).ok_or(UtilError::BadQuoting { position: i })?;
                            if !(b'0'..=b'7').contains(&d) {
                                return Err(UtilError::BadQuoting { position: i });
                            }
                            value = (value << 3) | (d - b'0') as u32;
                            i += 1;
                        }
                        value as u8
                    }
                    _ => return Err(UtilError::BadQuoting { position: i - 1 }),
                };
                out.push_byte(decoded);
            }
            _ => out.push_byte(c),
        }
    }
}
