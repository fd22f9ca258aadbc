//! Leaf scanners and writers for JSON text.
//!
//! Everything here works on plain byte slices and reports failures as a
//! [`ScanError`] with an offset relative to the slice it was given. The
//! runtime support layer translates those into context errors.

use crate::context::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanError {
    pub code: ErrorCode,
    /// Offset from the start of the scanned slice.
    pub at: usize,
}

impl ScanError {
    fn new(code: ErrorCode, at: usize) -> Self {
        ScanError { code, at }
    }

    fn eof(at: usize) -> Self {
        ScanError::new(ErrorCode::UnexpectedEof, at)
    }
}

#[inline]
pub fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\n' | b'\r' | b'\t')
}

/// Number of leading whitespace bytes.
#[inline]
pub fn skip_ws(input: &[u8]) -> usize {
    input.iter().take_while(|&&b| is_ws(b)).count()
}

/// Error for a position where a value or delimiter was expected.
pub fn unexpected(input: &[u8], at: usize) -> ScanError {
    if at >= input.len() {
        ScanError::eof(at)
    } else {
        ScanError::new(ErrorCode::UnexpectedChar, at)
    }
}

/// Match a bare literal (`true`, `false`, `null`) at the start of `input`.
pub fn literal(input: &[u8], word: &[u8]) -> Result<usize, ScanError> {
    if input.len() < word.len() {
        if word.starts_with(input) {
            return Err(ScanError::eof(input.len()));
        }
        return Err(ScanError::new(ErrorCode::InvalidLiteral, 0));
    }
    if &input[..word.len()] != word {
        return Err(ScanError::new(ErrorCode::InvalidLiteral, 0));
    }
    Ok(word.len())
}

/// Shape of a number lexeme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberLexeme {
    pub len: usize,
    pub negative: bool,
    /// Has a fraction or an exponent.
    pub is_float: bool,
}

/// Validate the JSON number grammar at the start of `input`.
pub fn number(input: &[u8]) -> Result<NumberLexeme, ScanError> {
    let mut i = 0;
    let negative = input.first() == Some(&b'-');
    if negative {
        i += 1;
    }
    match input.get(i) {
        Some(b'0') => i += 1,
        Some(b'1'..=b'9') => {
            while matches!(input.get(i), Some(b'0'..=b'9')) {
                i += 1;
            }
        }
        None => return Err(ScanError::eof(i)),
        Some(_) => return Err(ScanError::new(ErrorCode::InvalidNumber, i)),
    }
    let mut is_float = false;
    if input.get(i) == Some(&b'.') {
        is_float = true;
        i += 1;
        let start = i;
        while matches!(input.get(i), Some(b'0'..=b'9')) {
            i += 1;
        }
        if i == start {
            return Err(digit_error(input, i));
        }
    }
    if matches!(input.get(i), Some(b'e' | b'E')) {
        is_float = true;
        i += 1;
        if matches!(input.get(i), Some(b'+' | b'-')) {
            i += 1;
        }
        let start = i;
        while matches!(input.get(i), Some(b'0'..=b'9')) {
            i += 1;
        }
        if i == start {
            return Err(digit_error(input, i));
        }
    }
    Ok(NumberLexeme {
        len: i,
        negative,
        is_float,
    })
}

fn digit_error(input: &[u8], at: usize) -> ScanError {
    if at >= input.len() {
        ScanError::eof(at)
    } else {
        ScanError::new(ErrorCode::InvalidNumber, at)
    }
}

fn lexeme_str(bytes: &[u8]) -> &str {
    // Number lexemes are ASCII by construction.
    core::str::from_utf8(bytes).unwrap_or_default()
}

/// Outcome of reading a number into an integer target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntRead<T> {
    Value(T),
    /// A well-formed number that the target cannot hold.
    OutOfRange,
    /// A fraction or exponent, which integer targets reject.
    NotInteger,
}

pub fn parse_i64(lexeme: &[u8], info: NumberLexeme) -> IntRead<i64> {
    if info.is_float {
        return IntRead::NotInteger;
    }
    match lexeme_str(lexeme).parse() {
        Ok(v) => IntRead::Value(v),
        Err(_) => IntRead::OutOfRange,
    }
}

pub fn parse_u64(lexeme: &[u8], info: NumberLexeme) -> IntRead<u64> {
    if info.is_float {
        return IntRead::NotInteger;
    }
    if info.negative {
        return IntRead::OutOfRange;
    }
    match lexeme_str(lexeme).parse() {
        Ok(v) => IntRead::Value(v),
        Err(_) => IntRead::OutOfRange,
    }
}

pub fn parse_f64(lexeme: &[u8]) -> Option<f64> {
    lexeme_str(lexeme).parse().ok().filter(|v: &f64| v.is_finite())
}

fn hex4(input: &[u8], at: usize) -> Result<u16, ScanError> {
    let digits = input.get(at..at + 4).ok_or(ScanError::eof(input.len()))?;
    let mut v = 0u16;
    for (k, &d) in digits.iter().enumerate() {
        let nibble = match d {
            b'0'..=b'9' => d - b'0',
            b'a'..=b'f' => d - b'a' + 10,
            b'A'..=b'F' => d - b'A' + 10,
            _ => return Err(ScanError::new(ErrorCode::InvalidEscape, at + k)),
        };
        v = (v << 4) | nibble as u16;
    }
    Ok(v)
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Decode the string literal at the start of `input` (which must begin with
/// `"`) into `out`. Returns the number of input bytes consumed.
///
/// Unpaired surrogates decode to U+FFFD. Invalid UTF-8 is an error when
/// `validate` is set and is replaced with U+FFFD otherwise.
pub fn string(input: &[u8], out: &mut Vec<u8>, validate: bool) -> Result<usize, ScanError> {
    if input.first() != Some(&b'"') {
        return Err(unexpected(input, 0));
    }
    let start = out.len();
    let mut i = 1;
    loop {
        let run = input[i..]
            .iter()
            .position(|&b| b == b'"' || b == b'\\' || b < 0x20)
            .ok_or(ScanError::eof(input.len()))?;
        out.extend_from_slice(&input[i..i + run]);
        i += run;
        match input[i] {
            b'"' => {
                i += 1;
                break;
            }
            b'\\' => {
                let esc = *input.get(i + 1).ok_or(ScanError::eof(input.len()))?;
                i += 2;
                match esc {
                    b'"' => out.push(b'"'),
                    b'\\' => out.push(b'\\'),
                    b'/' => out.push(b'/'),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'u' => {
                        let hi = hex4(input, i)?;
                        i += 4;
                        let c = if (0xD800..0xDC00).contains(&hi) {
                            if input.get(i..i + 2) == Some(b"\\u") {
                                let lo = hex4(input, i + 2)?;
                                if (0xDC00..0xE000).contains(&lo) {
                                    i += 6;
                                    let cp = 0x10000 + (((hi as u32) - 0xD800) << 10) + ((lo as u32) - 0xDC00);
                                    char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER)
                                } else {
                                    char::REPLACEMENT_CHARACTER
                                }
                            } else {
                                char::REPLACEMENT_CHARACTER
                            }
                        } else {
                            char::from_u32(hi as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
                        };
                        push_char(out, c);
                    }
                    _ => return Err(ScanError::new(ErrorCode::InvalidEscape, i - 1)),
                }
            }
            _ => return Err(ScanError::new(ErrorCode::ControlCharacter, i)),
        }
    }
    if core::str::from_utf8(&out[start..]).is_err() {
        if validate {
            return Err(ScanError::new(ErrorCode::InvalidUtf8, 0));
        }
        let fixed = String::from_utf8_lossy(&out[start..]).into_owned();
        out.truncate(start);
        out.extend_from_slice(fixed.as_bytes());
    }
    Ok(i)
}

/// Length of the string literal at the start of `input`, without decoding it.
fn skip_string(input: &[u8]) -> Result<usize, ScanError> {
    let mut i = 1;
    loop {
        let run = input[i..]
            .iter()
            .position(|&b| b == b'"' || b == b'\\' || b < 0x20)
            .ok_or(ScanError::eof(input.len()))?;
        i += run;
        match input[i] {
            b'"' => return Ok(i + 1),
            b'\\' => {
                if i + 1 >= input.len() {
                    return Err(ScanError::eof(input.len()));
                }
                i += 2;
            }
            _ => return Err(ScanError::new(ErrorCode::ControlCharacter, i)),
        }
    }
}

/// Length of the JSON value at the start of `input` (after whitespace).
///
/// Iterative, so hostile nesting cannot exhaust the native stack; nesting
/// past `max_depth` is an error.
pub fn skip_value(input: &[u8], max_depth: usize) -> Result<usize, ScanError> {
    // One entry per open container: the byte that closes it.
    let mut open: Vec<u8> = Vec::new();
    let mut i = skip_ws(input);
    loop {
        // Expect a value at `i`.
        match input.get(i) {
            None => return Err(ScanError::eof(i)),
            Some(b'{') | Some(b'[') => {
                if open.len() >= max_depth {
                    return Err(ScanError::new(ErrorCode::DepthLimit, i));
                }
                let close = if input[i] == b'{' { b'}' } else { b']' };
                open.push(close);
                i += 1;
                i += skip_ws(&input[i..]);
                if input.get(i) == Some(&close) {
                    open.pop();
                    i += 1;
                } else {
                    if close == b'}' {
                        i = skip_key(input, i)?;
                    }
                    continue;
                }
            }
            Some(b'"') => i += skip_string(&input[i..]).map_err(|e| shift(e, i))?,
            Some(b't') => i += literal(&input[i..], b"true").map_err(|e| shift(e, i))?,
            Some(b'f') => i += literal(&input[i..], b"false").map_err(|e| shift(e, i))?,
            Some(b'n') => i += literal(&input[i..], b"null").map_err(|e| shift(e, i))?,
            Some(b'-' | b'0'..=b'9') => i += number(&input[i..]).map_err(|e| shift(e, i))?.len,
            Some(_) => return Err(ScanError::new(ErrorCode::UnexpectedChar, i)),
        }
        // After a value: close containers or move to the next element.
        loop {
            let Some(&close) = open.last() else {
                return Ok(i);
            };
            i += skip_ws(&input[i..]);
            match input.get(i) {
                Some(b',') => {
                    i += 1;
                    i += skip_ws(&input[i..]);
                    if close == b'}' {
                        i = skip_key(input, i)?;
                    }
                    break;
                }
                Some(&b) if b == close => {
                    open.pop();
                    i += 1;
                }
                _ => return Err(unexpected(input, i)),
            }
        }
    }
}

/// Skip `"key" :` and any whitespace after the colon.
fn skip_key(input: &[u8], i: usize) -> Result<usize, ScanError> {
    if input.get(i) != Some(&b'"') {
        return Err(unexpected(input, i));
    }
    let mut i = i + skip_string(&input[i..]).map_err(|e| shift(e, i))?;
    i += skip_ws(&input[i..]);
    if input.get(i) != Some(&b':') {
        return Err(unexpected(input, i));
    }
    i += 1;
    Ok(i + skip_ws(&input[i..]))
}

fn shift(e: ScanError, by: usize) -> ScanError {
    ScanError {
        code: e.code,
        at: e.at + by,
    }
}

/// Write `s` as a quoted JSON string.
pub fn escape_str(out: &mut Vec<u8>, s: &str, html: bool) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push(b'"');
    let bytes = s.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let esc: Option<&[u8]> = match b {
            b'"' => Some(b"\\\""),
            b'\\' => Some(b"\\\\"),
            b'\n' => Some(b"\\n"),
            b'\r' => Some(b"\\r"),
            b'\t' => Some(b"\\t"),
            0x08 => Some(b"\\b"),
            0x0c => Some(b"\\f"),
            b'<' if html => Some(b"\\u003c"),
            b'>' if html => Some(b"\\u003e"),
            b'&' if html => Some(b"\\u0026"),
            _ => None,
        };
        if let Some(esc) = esc {
            out.extend_from_slice(&bytes[start..i]);
            out.extend_from_slice(esc);
            i += 1;
            start = i;
        } else if b < 0x20 {
            out.extend_from_slice(&bytes[start..i]);
            out.extend_from_slice(&[b'\\', b'u', b'0', b'0', HEX[(b >> 4) as usize], HEX[(b & 0xf) as usize]]);
            i += 1;
            start = i;
        } else if b == 0xE2 && bytes.get(i + 1) == Some(&0x80) && matches!(bytes.get(i + 2), Some(0xA8 | 0xA9)) {
            // U+2028 and U+2029 break JavaScript string literals.
            out.extend_from_slice(&bytes[start..i]);
            out.extend_from_slice(if bytes[i + 2] == 0xA8 { b"\\u2028" } else { b"\\u2029" });
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }
    out.extend_from_slice(&bytes[start..]);
    out.push(b'"');
}

/// Upper bound on the bytes [`escape_str`] writes for an input of `len` bytes.
pub fn escaped_len_bound(len: usize) -> usize {
    len * 6 + 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &str) -> Result<(String, usize), ScanError> {
        let mut out = Vec::new();
        let n = string(input.as_bytes(), &mut out, true)?;
        Ok((String::from_utf8(out).unwrap(), n))
    }

    #[test]
    fn strings_unescape() {
        assert_eq!(decode(r#""plain" tail"#).unwrap(), ("plain".into(), 7));
        assert_eq!(decode(r#""a\"b\\c\/\n""#).unwrap().0, "a\"b\\c/\n");
        assert_eq!(decode(r#""é中""#).unwrap().0, "é中");
        assert_eq!(decode(r#""😀""#).unwrap().0, "😀");
        assert_eq!(decode(r#""\ud83dx""#).unwrap().0, "\u{fffd}x");
    }

    #[test]
    fn string_errors_carry_offsets() {
        assert_eq!(decode(r#""abc"#).unwrap_err().code, ErrorCode::UnexpectedEof);
        assert_eq!(decode(r#""a\qb""#).unwrap_err(), ScanError::new(ErrorCode::InvalidEscape, 3));
        assert_eq!(decode("\"a\u{1}\"").unwrap_err(), ScanError::new(ErrorCode::ControlCharacter, 2));
        assert_eq!(decode(r#""\u12g4""#).unwrap_err().code, ErrorCode::InvalidEscape);
    }

    #[test]
    fn invalid_utf8_is_rejected_or_replaced() {
        let input = b"\"a\xffb\"";
        let mut out = Vec::new();
        assert_eq!(string(input, &mut out, true).unwrap_err().code, ErrorCode::InvalidUtf8);
        let mut out = Vec::new();
        assert_eq!(string(input, &mut out, false).unwrap(), 5);
        assert_eq!(out, "a\u{fffd}b".as_bytes());
    }

    #[test]
    fn numbers_follow_json_grammar() {
        let n = number(b"-12.5e3,").unwrap();
        assert_eq!((n.len, n.negative, n.is_float), (7, true, true));
        assert_eq!(number(b"0").unwrap().len, 1);
        assert_eq!(number(b"012").unwrap().len, 1);
        assert_eq!(number(b"1.").unwrap_err().code, ErrorCode::UnexpectedEof);
        assert_eq!(number(b"1.x").unwrap_err().code, ErrorCode::InvalidNumber);
        assert_eq!(number(b"-").unwrap_err().code, ErrorCode::UnexpectedEof);
        assert_eq!(number(b"+1").unwrap_err().code, ErrorCode::InvalidNumber);
    }

    #[test]
    fn integer_reads() {
        let read_i = |s: &str| parse_i64(s.as_bytes(), number(s.as_bytes()).unwrap());
        let read_u = |s: &str| parse_u64(s.as_bytes(), number(s.as_bytes()).unwrap());
        assert_eq!(read_i("-42"), IntRead::Value(-42));
        assert_eq!(read_i("9223372036854775808"), IntRead::OutOfRange);
        assert_eq!(read_i("1.5"), IntRead::NotInteger);
        assert_eq!(read_u("18446744073709551615"), IntRead::Value(u64::MAX));
        assert_eq!(read_u("-1"), IntRead::OutOfRange);
    }

    #[test]
    fn skip_value_spans_nested_input() {
        let input = br#" {"a": [1, 2, {"b": null}], "c": "x\"y"} , 9"#;
        let n = skip_value(input, 16).unwrap();
        assert_eq!(&input[n..], b" , 9");
        assert_eq!(skip_value(b"[]", 16).unwrap(), 2);
        assert_eq!(skip_value(b"{}", 16).unwrap(), 2);
        assert_eq!(skip_value(b"tru", 16).unwrap_err().code, ErrorCode::UnexpectedEof);
        assert_eq!(skip_value(b"[1 2]", 16).unwrap_err(), ScanError::new(ErrorCode::UnexpectedChar, 3));
        assert_eq!(skip_value(b"[[[1]]]", 2).unwrap_err().code, ErrorCode::DepthLimit);
        assert_eq!(skip_value(b"{\"a\" 1}", 16).unwrap_err().code, ErrorCode::UnexpectedChar);
    }

    #[test]
    fn skip_value_allows_spaces_after_commas() {
        let input = b"[ 1 ,\n 2 , [ 3 ,\t4 ] , { \"k\" : 5 ,  \"m\" : [ ] } ]x";
        assert_eq!(skip_value(input, 16).unwrap(), input.len() - 1);
        assert_eq!(skip_value(b"[1, ]", 16).unwrap_err(), ScanError::new(ErrorCode::UnexpectedChar, 4));
    }

    #[test]
    fn escaping_matches_json_rules() {
        let mut out = Vec::new();
        escape_str(&mut out, "a\"b\\\n\u{1}<\u{2028}", false);
        assert_eq!(out, br#""a\"b\\\n\u0001<\u2028""#);
        let mut out = Vec::new();
        escape_str(&mut out, "<&>", true);
        assert_eq!(out, br#""\u003c\u0026\u003e""#);
    }
}
