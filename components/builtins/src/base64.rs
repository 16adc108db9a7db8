//! The Base64 builtin. The runtime carries its own codec over the
//! standard alphabet.

use core_types::{CallResult, CallReturn, Error, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::ExecutionUnit;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Installs the `Base64` object.
pub fn install(eu: &mut ExecutionUnit) {
    let atoms = eu.atoms();
    let encode_a = atoms.borrow_mut().intern("encode");
    let decode_a = atoms.borrow_mut().intern("decode");
    ProtoBuilder::new(eu, WellKnown::Base64.into())
        .method(encode_a, encode)
        .method(decode_a, decode)
        .build();
}

/// Encodes bytes with `=` padding.
pub fn encode_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[(triple >> 18) as usize & 63] as char);
        out.push(ALPHABET[(triple >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(triple >> 6) as usize & 63] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[triple as usize & 63] as char
        } else {
            '='
        });
    }
    out
}

fn sextet(c: u8) -> Option<u32> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u32),
        b'a'..=b'z' => Some((c - b'a') as u32 + 26),
        b'0'..=b'9' => Some((c - b'0') as u32 + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decodes a padded base64 string.
pub fn decode_str(text: &str) -> Option<Vec<u8>> {
    let bytes: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if bytes.len() % 4 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(bytes.len() / 4 * 3);
    for chunk in bytes.chunks(4) {
        let pad = chunk.iter().rev().take_while(|&&c| c == b'=').count();
        if pad > 2 {
            return None;
        }
        let mut triple = 0u32;
        for (i, &c) in chunk.iter().enumerate() {
            let s = if c == b'=' { 0 } else { sextet(c)? };
            triple |= s << (18 - 6 * i);
        }
        out.push((triple >> 16) as u8);
        if pad < 2 {
            out.push((triple >> 8) as u8);
        }
        if pad < 1 {
            out.push(triple as u8);
        }
    }
    Some(out)
}

fn encode(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let text = eu.to_string_value(eu.native_arg(nparams, 0));
    let encoded = encode_bytes(text.as_bytes());
    let id = eu.heap().borrow_mut().create_string(&encoded);
    eu.push(Value::Str(id));
    Ok(CallReturn::Count(1))
}

fn decode(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let text = eu.to_string_value(eu.native_arg(nparams, 0));
    let bytes = decode_str(&text).ok_or(Error::OutOfRange)?;
    let decoded = String::from_utf8(bytes).map_err(|_| Error::OutOfRange)?;
    let id = eu.heap().borrow_mut().create_string(&decoded);
    eu.push(Value::Str(id));
    Ok(CallReturn::Count(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_vectors() {
        assert_eq!(encode_bytes(b""), "");
        assert_eq!(encode_bytes(b"f"), "Zg==");
        assert_eq!(encode_bytes(b"fo"), "Zm8=");
        assert_eq!(encode_bytes(b"foo"), "Zm9v");
        assert_eq!(encode_bytes(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_decode_round_trip() {
        for input in ["", "a", "ab", "abc", "hello world!"] {
            let encoded = encode_bytes(input.as_bytes());
            assert_eq!(decode_str(&encoded).unwrap(), input.as_bytes());
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_str("not base64 at all!").is_none());
        assert!(decode_str("Zg=").is_none());
    }
}
