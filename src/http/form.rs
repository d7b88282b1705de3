//! `application/x-www-form-urlencoded` decoding.
//!
//! Invoked by handlers through [`Request::form`](crate::http::Request::form),
//! never by the server core.

use std::collections::HashMap;

/// Decoded form fields.
pub type Form = HashMap<String, String>;

/// Decodes `key=value` pairs separated by `&`.
///
/// `+` decodes to a space and `%XY` to the byte `0xXY`. A pair without a
/// `=` makes the whole input invalid and yields an empty form.
pub fn parse_form(data: &str) -> Form {
    let mut form = Form::new();
    for pair in data.split('&') {
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Form::new();
        };
        form.insert(decode_component(key), decode_component(value));
    }
    form
}

fn decode_component(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}
