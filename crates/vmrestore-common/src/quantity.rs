//! Storage quantity arithmetic
//!
//! Claim sizes are compared in bytes. Only the forms the API server emits
//! for storage are accepted: a plain integer, an integer or decimal with a
//! binary (Ki..Ei) or decimal (k..E) suffix, or an exponent (`1e9`).

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::Error;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parse a quantity into a byte count, rounding fractional bytes up
pub fn to_bytes(qty: &Quantity) -> Result<u128, Error> {
    parse_bytes(&qty.0)
}

fn parse_bytes(raw: &str) -> Result<u128, Error> {
    let s = raw.trim();
    let invalid = || Error::validation(format!("invalid storage quantity '{}'", raw));

    if s.is_empty() {
        return Err(invalid());
    }

    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return scale(number, 1024u128.pow(power)).ok_or_else(invalid);
        }
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return scale(number, 1000u128.pow(power)).ok_or_else(invalid);
        }
    }
    if let Some((mantissa, exp)) = s.split_once(['e', 'E']) {
        let exp: u32 = exp.parse().ok().filter(|e| *e <= 18).ok_or_else(invalid)?;
        return scale(mantissa, 10u128.pow(exp)).ok_or_else(invalid);
    }

    scale(s, 1).ok_or_else(invalid)
}

/// `number * multiplier`, where `number` may carry a decimal fraction
fn scale(number: &str, multiplier: u128) -> Option<u128> {
    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut total = whole.checked_mul(multiplier)?;

    if !frac.is_empty() {
        let denom = 10u128.checked_pow(frac.len() as u32)?;
        let numer: u128 = frac.parse().ok()?;
        let scaled = numer.checked_mul(multiplier)?;
        total = total.checked_add(scaled.div_ceil(denom))?;
    }
    Some(total)
}

/// The larger of two quantities, keeping the original representation
///
/// On a tie `a` wins, so an unchanged size keeps the provider's spelling.
pub fn max(a: &Quantity, b: &Quantity) -> Result<Quantity, Error> {
    if to_bytes(b)? > to_bytes(a)? {
        Ok(b.clone())
    } else {
        Ok(a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn binary_suffixes() {
        assert_eq!(to_bytes(&q("1Ki")).unwrap(), 1024);
        assert_eq!(to_bytes(&q("2Gi")).unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(to_bytes(&q("1.5Gi")).unwrap(), 1536 * 1024 * 1024);
    }

    #[test]
    fn decimal_suffixes_and_plain() {
        assert_eq!(to_bytes(&q("1G")).unwrap(), 1_000_000_000);
        assert_eq!(to_bytes(&q("500M")).unwrap(), 500_000_000);
        assert_eq!(to_bytes(&q("1048576")).unwrap(), 1_048_576);
        assert_eq!(to_bytes(&q("1e9")).unwrap(), 1_000_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(to_bytes(&q("")).is_err());
        assert!(to_bytes(&q("Gi")).is_err());
        assert!(to_bytes(&q("ten")).is_err());
        assert!(to_bytes(&q("-1Gi")).is_err());
    }

    #[test]
    fn max_across_units() {
        assert_eq!(max(&q("2Gi"), &q("1Gi")).unwrap(), q("2Gi"));
        assert_eq!(max(&q("1Gi"), &q("2Gi")).unwrap(), q("2Gi"));
        assert_eq!(max(&q("1G"), &q("1Gi")).unwrap(), q("1Gi"));
        assert_eq!(max(&q("1024Mi"), &q("1Gi")).unwrap(), q("1024Mi"));
    }
}
