//! Fractional index keys.
//!
//! Keys are base-62 digit strings compared lexicographically. A key can always
//! be generated strictly between two existing keys, so ordered results can
//! absorb inserts without renumbering their neighbours. Keys never end in the
//! zero digit, which keeps the space between any two keys non-empty.

const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = 62;

fn digit_value(c: u8) -> usize {
    DIGITS.iter().position(|d| *d == c).unwrap_or(0)
}

/// Generate a key strictly between `lower` and `upper`.
///
/// `None` means unbounded on that side. Callers must pass `lower < upper`
/// when both are present; equal or inverted bounds fall back to a key after
/// `lower`.
pub fn key_between(lower: Option<&str>, upper: Option<&str>) -> String {
    let a = lower.unwrap_or("").as_bytes();
    match upper {
        Some(b) if b.as_bytes() > a => midpoint(a, Some(b.as_bytes())),
        _ => midpoint(a, None),
    }
}

fn midpoint(a: &[u8], b: Option<&[u8]>) -> String {
    if let Some(b) = b {
        // Copy the shared prefix, treating missing digits of `a` as zero.
        let mut n = 0;
        while n < b.len() && a.get(n).copied().unwrap_or(DIGITS[0]) == b[n] {
            n += 1;
        }
        if n > 0 {
            let prefix = String::from_utf8_lossy(&b[..n]).into_owned();
            let rest_a = if n < a.len() { &a[n..] } else { &[][..] };
            return prefix + &midpoint(rest_a, Some(&b[n..]));
        }
    }

    let digit_a = a.first().map(|c| digit_value(*c)).unwrap_or(0);
    let digit_b = match b {
        Some(b) if !b.is_empty() => digit_value(b[0]),
        _ => BASE,
    };

    if digit_b > digit_a + 1 {
        let mid = (digit_a + digit_b) / 2;
        return (DIGITS[mid] as char).to_string();
    }

    // Adjacent digits: keep `b`'s first digit if `b` continues, else descend
    // into `a`.
    match b {
        Some(b) if b.len() > 1 => (b[0] as char).to_string(),
        _ => {
            let head = (DIGITS[digit_a] as char).to_string();
            let tail = if a.len() > 1 { &a[1..] } else { &[][..] };
            head + &midpoint(tail, None)
        }
    }
}

/// Generate `n` ascending keys between `lower` and `upper`.
pub fn keys_between(lower: Option<&str>, upper: Option<&str>, n: usize) -> Vec<String> {
    let mut keys = Vec::with_capacity(n);
    let mut previous = lower.map(|s| s.to_string());
    for _ in 0..n {
        let key = key_between(previous.as_deref(), upper);
        previous = Some(key.clone());
        keys.push(key);
    }
    keys
}
