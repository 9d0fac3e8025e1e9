//! Decoding of raw controller bytes.
//!
//! The controller stores values big-endian (`INT`, `REAL`) and packs flag
//! words least-significant-bit first within each byte.

use super::LinkError;

/// Return bit `bit` of `byte`.
pub fn get_bool(byte: u8, bit: u8) -> bool {
    (byte >> bit) & 1 == 1
}

/// Set or clear bit `bit` of `byte`.
pub fn set_bool(byte: u8, bit: u8, value: bool) -> u8 {
    if value {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    }
}

/// Decode a signed 16-bit big-endian integer.
pub fn get_int(data: &[u8]) -> Result<i16, LinkError> {
    let raw: [u8; 2] = take(data)?;
    Ok(i16::from_be_bytes(raw))
}

/// Decode a big-endian IEEE-754 single-precision value.
pub fn get_real(data: &[u8]) -> Result<f32, LinkError> {
    let raw: [u8; 4] = take(data)?;
    Ok(f32::from_be_bytes(raw))
}

/// Decode four consecutive `REAL` values.
pub fn get_reals4(data: &[u8]) -> Result<[f32; 4], LinkError> {
    if data.len() < 16 {
        return Err(short(16, data.len()));
    }
    let mut values = [0.0f32; 4];
    for (i, value) in values.iter_mut().enumerate() {
        *value = get_real(&data[i * 4..])?;
    }
    Ok(values)
}

/// Decode a fixed-length, NUL-padded text field.
///
/// Only NUL padding is removed; spaces belong to the label. Invalid UTF-8 is
/// replaced rather than rejected; operators still want to see whatever the
/// scanner produced.
pub fn get_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim_matches('\0').to_string()
}

/// Unpack a byte string into bits, LSB first per byte.
pub fn unpack_bits(data: &[u8]) -> Vec<bool> {
    data.iter()
        .flat_map(|byte| (0..8).map(move |bit| get_bool(*byte, bit)))
        .collect()
}

fn take<const N: usize>(data: &[u8]) -> Result<[u8; N], LinkError> {
    data.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| short(N, data.len()))
}

fn short(expected: usize, got: usize) -> LinkError {
    LinkError::Protocol(format!("expected {expected} bytes, got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_lsb_first() {
        assert!(get_bool(0b0000_0001, 0));
        assert!(!get_bool(0b0000_0001, 1));
        assert!(get_bool(0b1000_0000, 7));
        assert_eq!(
            unpack_bits(&[0b0000_0101, 0b1000_0000]),
            vec![true, false, true, false, false, false, false, false, false, false, false, false, false, false, false, true]
        );
    }

    #[test]
    fn set_bool_only_touches_one_bit() {
        assert_eq!(set_bool(0b1010_0000, 0, true), 0b1010_0001);
        assert_eq!(set_bool(0b1010_0001, 5, false), 0b1000_0001);
        assert_eq!(set_bool(0b1000_0001, 5, false), 0b1000_0001);
    }

    #[test]
    fn integers_are_big_endian_signed() {
        assert_eq!(get_int(&[0x00, 0x2A]).unwrap(), 42);
        assert_eq!(get_int(&[0xFF, 0xFE]).unwrap(), -2);
        assert!(get_int(&[0x01]).is_err());
    }

    #[test]
    fn reals_decode_in_order() {
        let mut raw = Vec::new();
        for v in [1.5f32, -2.0, 230.0, 21.25] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(get_reals4(&raw).unwrap(), [1.5, -2.0, 230.0, 21.25]);
        assert!(get_reals4(&raw[..15]).is_err());
    }

    #[test]
    fn text_strips_padding() {
        let mut raw = b"BOX-001".to_vec();
        raw.resize(16, 0);
        assert_eq!(get_text(&raw), "BOX-001");
        assert_eq!(get_text(b"  AB \0\0"), "  AB ");
        assert_eq!(get_text(b"\0BOX 7\0"), "BOX 7");
        assert_eq!(get_text(&[0u8; 4]), "");
    }
}
