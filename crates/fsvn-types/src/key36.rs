//! Base-36 counter keys.
//!
//! The `txn-current` sequence and the per-transaction `next-ids` counters
//! are lowercase base-36 strings (`0-9a-z`), incremented lexically with
//! carry. `"z"` increments to `"10"`.

use fsvn_error::{FsfsError, Result};

/// Maximum key length accepted. Far beyond anything a real repository
/// reaches; bounds the carry loop against corrupt input.
pub const MAX_KEY_LEN: usize = 200;

fn digit_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'z' => Some(b - b'a' + 10),
        _ => None,
    }
}

fn digit_char(v: u8) -> u8 {
    if v < 10 {
        b'0' + v
    } else {
        b'a' + (v - 10)
    }
}

/// Validate that `key` is a well-formed base-36 key.
pub fn validate(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(FsfsError::corrupt(format!("malformed base-36 key '{key}'")));
    }
    if key.bytes().any(|b| digit_value(b).is_none()) {
        return Err(FsfsError::corrupt(format!("malformed base-36 key '{key}'")));
    }
    Ok(())
}

/// Return `key + 1` in base-36.
pub fn next_key(key: &str) -> Result<String> {
    validate(key)?;
    let mut digits: Vec<u8> = key.bytes().collect();
    let mut i = digits.len();
    loop {
        if i == 0 {
            digits.insert(0, b'1');
            break;
        }
        i -= 1;
        let v = digit_value(digits[i]).expect("validated above");
        if v == 35 {
            digits[i] = b'0';
        } else {
            digits[i] = digit_char(v + 1);
            break;
        }
    }
    Ok(String::from_utf8(digits).expect("base-36 digits are ASCII"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn simple_increments() {
        assert_eq!(next_key("0").unwrap(), "1");
        assert_eq!(next_key("9").unwrap(), "a");
        assert_eq!(next_key("z").unwrap(), "10");
        assert_eq!(next_key("zz").unwrap(), "100");
        assert_eq!(next_key("az").unwrap(), "b0");
        assert_eq!(next_key("10").unwrap(), "11");
    }

    #[test]
    fn rejects_garbage() {
        assert!(next_key("").is_err());
        assert!(next_key("A").is_err());
        assert!(next_key("1-2").is_err());
        assert!(next_key(&"z".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    fn to_u64(key: &str) -> u64 {
        key.bytes()
            .fold(0u64, |acc, b| acc * 36 + u64::from(digit_value(b).unwrap()))
    }

    proptest! {
        #[test]
        fn increment_matches_numeric(n in 0u64..1_000_000) {
            // Format n in base 36, increment, and compare numerically.
            let mut key = String::new();
            let mut v = n;
            loop {
                key.insert(0, char::from(digit_char((v % 36) as u8)));
                v /= 36;
                if v == 0 {
                    break;
                }
            }
            let next = next_key(&key).unwrap();
            prop_assert_eq!(to_u64(&next), n + 1);
        }
    }
}
