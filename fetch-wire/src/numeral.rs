//! Leading-numeral parsing used for follower comparisons.
//!
//! Policy:
//! - Digits are accumulated left to right until the first non-digit.
//! - If that character is `.`, up to `decimals` fractional digits are taken.
//! - The result is scaled so it always carries `decimals` fractional places.
//! - Empty / non-numeric input parses to 0; overflow saturates.

/// Parse the leading numeral of `s` with `decimals` fractional places kept.
///
/// `parse_leading_numeral("12.7", 0) == 12`,
/// `parse_leading_numeral("12.7", 2) == 1270`,
/// `parse_leading_numeral("1,234", 0) == 1`.
pub fn parse_leading_numeral(s: &str, decimals: u32) -> u64 {
    let mut value: u64 = 0;
    let mut bytes = s.bytes().peekable();

    while let Some(b) = bytes.peek().copied() {
        if !b.is_ascii_digit() {
            break;
        }
        value = push_digit(value, b);
        bytes.next();
    }

    let mut remaining = decimals;
    if remaining > 0 && bytes.peek() == Some(&b'.') {
        bytes.next();
        for b in bytes {
            if remaining == 0 || !b.is_ascii_digit() {
                break;
            }
            value = push_digit(value, b);
            remaining -= 1;
        }
    }

    (0..remaining).fold(value, |acc, _| acc.saturating_mul(10))
}

fn push_digit(acc: u64, digit: u8) -> u64 {
    acc.saturating_mul(10).saturating_add(u64::from(digit - b'0'))
}
