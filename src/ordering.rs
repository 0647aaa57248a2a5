//! Fractional sort keys: a key strictly between two neighbours, no other row rewritten.
//!
//! A key is an integer part followed by an optional fraction, both in base 62 (`0-9A-Za-z`, which is
//! also byte order). The head character encodes the integer part's length: `a`..`z` are the
//! non-negative integers with 1..26 digits, `Z`..`A` the negative ones. Appending or prepending
//! only increments or decrements the integer, so keys grow slowly at the ends; inserting between
//! two fixed neighbours bisects the fraction and costs about one character per six inserts.
//! Keys are capped at [`MAX_KEY_LEN`]; past that the table needs a renumbering pass
//! ([`SortKeyRebalancer`]).

use crate::config::ResolvedTable;
use crate::error::EngineError;
use async_trait::async_trait;
use rand::Rng;
use sqlx::PgConnection;

const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Key of the first row in an empty table.
pub const INITIAL_KEY: &str = "a0";

/// Longest key the allocator hands out.
pub const MAX_KEY_LEN: usize = 128;

/// Random digits [`random_key_between`] appends.
pub const JITTER_LEN: usize = 5;

const SMALLEST_INTEGER: &str = "A00000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid sort key: {0:?}")]
    Invalid(String),
    #[error("sort keys out of order: {0:?} >= {1:?}")]
    OutOfOrder(String, String),
    #[error("no key fits between {0:?} and {1:?}")]
    Exhausted(Option<String>, Option<String>),
}

impl From<KeyError> for EngineError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Exhausted(after, before) => EngineError::SortKeyExhausted { after, before },
            other => EngineError::Validation {
                field: None,
                message: other.to_string(),
            },
        }
    }
}

/// Table-wide renumbering, run when the key space between two neighbours is used up.
/// Called inside the reorder transaction; the allocation is retried once afterwards.
#[async_trait]
pub trait SortKeyRebalancer: Send + Sync {
    async fn rebalance(&self, conn: &mut PgConnection, table: &ResolvedTable) -> Result<(), EngineError>;
}

fn digit(c: u8) -> Option<usize> {
    DIGITS.iter().position(|d| *d == c)
}

fn integer_len(head: u8) -> Option<usize> {
    match head {
        b'a'..=b'z' => Some((head - b'a') as usize + 2),
        b'A'..=b'Z' => Some((b'Z' - head) as usize + 2),
        _ => None,
    }
}

fn split_key(key: &str) -> Result<(&str, &str), KeyError> {
    let bytes = key.as_bytes();
    let invalid = || KeyError::Invalid(key.to_string());
    let head = *bytes.first().ok_or_else(invalid)?;
    let len = integer_len(head).ok_or_else(invalid)?;
    if len > bytes.len() || !bytes.iter().all(|b| digit(*b).is_some()) {
        return Err(invalid());
    }
    let (int, frac) = key.split_at(len);
    if key == SMALLEST_INTEGER || frac.ends_with('0') {
        return Err(invalid());
    }
    Ok((int, frac))
}

/// Midpoint of two fractions (`b = None` means 1). Neither may end in the zero digit.
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Vec<u8> {
    if let Some(b) = b {
        // strip the common prefix, padding `a` with zeros
        let mut n = 0;
        while n < b.len() && a.get(n).copied().unwrap_or(b'0') == b[n] {
            n += 1;
        }
        if n > 0 {
            let mut out = b[..n].to_vec();
            let rest_a = if n < a.len() { &a[n..] } else { &[][..] };
            out.extend(midpoint(rest_a, Some(&b[n..])));
            return out;
        }
    }
    let da = a.first().and_then(|c| digit(*c)).unwrap_or(0);
    let db = match b {
        Some(b) => b.first().and_then(|c| digit(*c)).unwrap_or(DIGITS.len()),
        None => DIGITS.len(),
    };
    if db - da > 1 {
        return vec![DIGITS[(da + db + 1) / 2]];
    }
    match b {
        Some(b) if b.len() > 1 => vec![b[0]],
        _ => {
            let mut out = vec![DIGITS[da]];
            let rest_a = if a.len() > 1 { &a[1..] } else { &[][..] };
            out.extend(midpoint(rest_a, None));
            out
        }
    }
}

fn increment_integer(x: &str) -> Option<String> {
    let bytes = x.as_bytes();
    let head = bytes[0];
    let mut digs = bytes[1..].to_vec();
    let mut carry = true;
    for d in digs.iter_mut().rev() {
        let next = digit(*d).unwrap_or(0) + 1;
        if next == DIGITS.len() {
            *d = DIGITS[0];
        } else {
            *d = DIGITS[next];
            carry = false;
            break;
        }
    }
    if carry {
        if head == b'Z' {
            return Some("a0".into());
        }
        if head == b'z' {
            return None;
        }
        let h = head + 1;
        if h > b'a' {
            digs.push(DIGITS[0]);
        } else {
            digs.pop();
        }
        digs.insert(0, h);
        return String::from_utf8(digs).ok();
    }
    digs.insert(0, head);
    String::from_utf8(digs).ok()
}

fn decrement_integer(x: &str) -> Option<String> {
    let bytes = x.as_bytes();
    let head = bytes[0];
    let mut digs = bytes[1..].to_vec();
    let mut borrow = true;
    for d in digs.iter_mut().rev() {
        match digit(*d).unwrap_or(0) {
            0 => *d = DIGITS[DIGITS.len() - 1],
            n => {
                *d = DIGITS[n - 1];
                borrow = false;
                break;
            }
        }
    }
    if borrow {
        if head == b'a' {
            return Some(format!("Z{}", DIGITS[DIGITS.len() - 1] as char));
        }
        if head == b'A' {
            return None;
        }
        let h = head - 1;
        if h < b'Z' {
            digs.push(DIGITS[DIGITS.len() - 1]);
        } else {
            digs.pop();
        }
        digs.insert(0, h);
        return String::from_utf8(digs).ok();
    }
    digs.insert(0, head);
    String::from_utf8(digs).ok()
}

fn to_key(int: &str, frac: Vec<u8>) -> String {
    let mut out = int.to_string();
    out.push_str(&String::from_utf8_lossy(&frac));
    out
}

fn generate(a: Option<&str>, b: Option<&str>) -> Result<String, KeyError> {
    let exhausted = || KeyError::Exhausted(a.map(str::to_string), b.map(str::to_string));
    match (a, b) {
        (None, None) => Ok(INITIAL_KEY.into()),
        (None, Some(b)) => {
            let (ib, fb) = split_key(b)?;
            if ib == SMALLEST_INTEGER {
                return Ok(to_key(ib, midpoint(b"", Some(fb.as_bytes()))));
            }
            if ib.len() < b.len() {
                return Ok(ib.to_string());
            }
            decrement_integer(ib).ok_or_else(exhausted)
        }
        (Some(a), None) => {
            let (ia, fa) = split_key(a)?;
            match increment_integer(ia) {
                Some(i) => Ok(i),
                None => Ok(to_key(ia, midpoint(fa.as_bytes(), None))),
            }
        }
        (Some(a), Some(b)) => {
            let (ia, fa) = split_key(a)?;
            let (ib, fb) = split_key(b)?;
            if ia == ib {
                return Ok(to_key(ia, midpoint(fa.as_bytes(), Some(fb.as_bytes()))));
            }
            let i = increment_integer(ia).ok_or_else(exhausted)?;
            if i.as_str() < b {
                return Ok(i);
            }
            Ok(to_key(ia, midpoint(fa.as_bytes(), None)))
        }
    }
}

/// A key strictly between `a` and `b` (`None` is unbounded on that side).
pub fn key_between(a: Option<&str>, b: Option<&str>) -> Result<String, KeyError> {
    if let (Some(a), Some(b)) = (a, b) {
        if a >= b {
            return Err(KeyError::OutOfOrder(a.to_string(), b.to_string()));
        }
    }
    let key = generate(a, b)?;
    if key.len() > MAX_KEY_LEN {
        return Err(KeyError::Exhausted(a.map(str::to_string), b.map(str::to_string)));
    }
    Ok(key)
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    let mut out: String = (0..JITTER_LEN - 1)
        .map(|_| DIGITS[rng.gen_range(0..DIGITS.len())] as char)
        .collect();
    // a fraction must not end in the zero digit
    out.push(DIGITS[rng.gen_range(1..DIGITS.len())] as char);
    out
}

/// [`key_between`] plus [`JITTER_LEN`] random fraction digits. Two writers that read the same
/// neighbours at the same time still store distinct keys. This is the allocator the service uses.
pub fn random_key_between(a: Option<&str>, b: Option<&str>) -> Result<String, KeyError> {
    let exhausted = || KeyError::Exhausted(a.map(str::to_string), b.map(str::to_string));
    let mut base = key_between(a, b)?;
    loop {
        let key = format!("{}{}", base, random_suffix());
        if key.len() > MAX_KEY_LEN {
            return Err(exhausted());
        }
        match b {
            // base is a prefix of b, so the suffix could overshoot; move base up first
            Some(b) if key.as_str() >= b => {
                base = key_between(Some(&base), Some(b)).map_err(|_| exhausted())?;
            }
            _ => return Ok(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn empty_table_gets_initial_key() {
        assert_eq!(key_between(None, None).unwrap(), "a0");
    }

    #[test]
    fn append_and_prepend_move_the_integer() {
        assert_eq!(key_between(Some("a0"), None).unwrap(), "a1");
        assert_eq!(key_between(Some("az"), None).unwrap(), "b00");
        assert_eq!(key_between(None, Some("a0")).unwrap(), "Zz");
        assert_eq!(key_between(None, Some("a0V")).unwrap(), "a0");
        assert_eq!(key_between(None, Some("b00")).unwrap(), "az");
    }

    #[test]
    fn between_bisects_the_fraction() {
        assert_eq!(key_between(Some("a0"), Some("a1")).unwrap(), "a0V");
        assert_eq!(key_between(Some("a0"), Some("a0V")).unwrap(), "a0G");
        assert_eq!(key_between(Some("a0V"), Some("a1")).unwrap(), "a0l");
        assert_eq!(key_between(Some("a0"), Some("b00")).unwrap(), "a1");
        assert_eq!(key_between(Some("Zz"), Some("a0")).unwrap(), "ZzV");
        assert_eq!(key_between(Some("a1"), Some("a1V")).unwrap(), "a1G");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(key_between(Some("a1"), Some("a1")), Err(KeyError::OutOfOrder(..))));
        assert!(matches!(key_between(Some("a1"), Some("a0")), Err(KeyError::OutOfOrder(..))));
        assert!(matches!(key_between(Some("a10"), None), Err(KeyError::Invalid(_))));
        assert!(matches!(key_between(Some(""), None), Err(KeyError::Invalid(_))));
        assert!(matches!(key_between(Some("b1"), None), Err(KeyError::Invalid(_))));
        assert!(matches!(key_between(Some("a-"), None), Err(KeyError::Invalid(_))));
    }

    #[test]
    fn repeated_inserts_stay_strictly_ordered() {
        // always insert right after the same anchor
        let anchor = "a0".to_string();
        let mut upper = key_between(Some(&anchor), None).unwrap();
        for _ in 0..200 {
            let k = key_between(Some(&anchor), Some(&upper)).unwrap();
            assert!(anchor < k && k < upper, "{} !< {} !< {}", anchor, k, upper);
            upper = k;
        }
        // and always right before the same upper bound
        let mut lower = anchor.clone();
        let fixed = "a1".to_string();
        for _ in 0..200 {
            let k = key_between(Some(&lower), Some(&fixed)).unwrap();
            assert!(lower < k && k < fixed);
            lower = k;
        }
    }

    #[test]
    fn random_keys_stay_inside_their_bounds() {
        let pairs: [(Option<&str>, Option<&str>); 7] = [
            (None, None),
            (Some("a0"), None),
            (None, Some("a0")),
            (Some("a0"), Some("a1")),
            // the plain key is a prefix of the upper bound in these
            (None, Some("a0V")),
            (Some("a0"), Some("a1V")),
            (Some("a0"), Some("a01V")),
        ];
        for (a, b) in pairs {
            for _ in 0..200 {
                let k = random_key_between(a, b).unwrap();
                assert!(a.map_or(true, |a| a < k.as_str()), "{:?} !< {}", a, k);
                assert!(b.map_or(true, |b| k.as_str() < b), "{} !< {:?}", k, b);
                // still a well-formed key
                assert!(key_between(Some(&k), None).is_ok());
            }
        }
    }

    #[test]
    fn random_keys_differ_for_the_same_neighbours() {
        let keys: HashSet<String> = (0..200)
            .map(|_| random_key_between(Some("a0"), Some("a1")).unwrap())
            .collect();
        assert_eq!(keys.len(), 200);
        assert!(keys.iter().all(|k| k.starts_with("a0V") && k.len() == 3 + JITTER_LEN));
    }

    #[test]
    fn random_keys_need_room_for_the_suffix() {
        let tight = format!("a0{}1", "0".repeat(122));
        assert!(key_between(Some("a0"), Some(&tight)).is_ok());
        assert!(matches!(
            random_key_between(Some("a0"), Some(&tight)),
            Err(KeyError::Exhausted(Some(_), Some(_)))
        ));
    }

    #[test]
    fn long_chains_at_the_ends_stay_short() {
        let mut last: Option<String> = None;
        for _ in 0..10_000 {
            let k = key_between(last.as_deref(), None).unwrap();
            if let Some(prev) = &last {
                assert!(prev < &k);
            }
            last = Some(k);
        }
        assert!(last.unwrap().len() <= 4);

        let mut first: Option<String> = None;
        for _ in 0..10_000 {
            let k = key_between(None, first.as_deref()).unwrap();
            if let Some(next) = &first {
                assert!(&k < next);
            }
            first = Some(k);
        }
        assert!(first.unwrap().len() <= 4);
    }

    #[test]
    fn precision_runs_out_between_fixed_neighbours() {
        let lower = "a0".to_string();
        let mut upper = "a1".to_string();
        let mut inserted = 0;
        let err = loop {
            match key_between(Some(&lower), Some(&upper)) {
                Ok(k) => {
                    upper = k;
                    inserted += 1;
                }
                Err(e) => break e,
            }
        };
        assert!(matches!(err, KeyError::Exhausted(..)));
        assert!(inserted > 500, "only {} inserts fit", inserted);
        let engine: EngineError = err.into();
        assert!(matches!(engine, EngineError::SortKeyExhausted { .. }));
    }
}
