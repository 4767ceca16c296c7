//! A backup's id is its start time (seconds since the epoch) encoded in
//! base-36 (digits `0-9` then lowercase `a-z`), used verbatim as the
//! on-disk directory name.

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn encode(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 alphabet is ASCII")
}

#[derive(Debug, thiserror::Error)]
#[error("{0:?} is not a valid base-36 backup id")]
pub struct DecodeError(String);

pub fn decode(s: &str) -> Result<u64, DecodeError> {
    if s.is_empty() {
        return Err(DecodeError(s.to_string()));
    }
    let mut value: u64 = 0;
    for c in s.chars() {
        let digit = c
            .to_ascii_lowercase()
            .to_digit(36)
            .ok_or_else(|| DecodeError(s.to_string()))?;
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(|| DecodeError(s.to_string()))?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_canonical_digits() {
        for value in [0u64, 1, 35, 36, 1_700_000_000, u32::MAX as u64] {
            let encoded = encode(value);
            assert_eq!(decode(&encoded).unwrap(), value);
            // Canonical encodings never carry uppercase or leading zeros
            // (besides the literal value zero).
            assert_eq!(encoded, encode(decode(&encoded).unwrap()));
        }
    }

    #[test]
    fn rejects_non_alphabet_chars() {
        assert!(decode("").is_err());
        assert!(decode("!!!").is_err());
    }

    #[test]
    fn decode_is_case_insensitive() {
        assert_eq!(decode("AZ").unwrap(), decode("az").unwrap());
    }
}
