//! Integer arithmetic with overflow promotion to arbitrary precision.
//!
//! `IntegerPayload::Small` holds a native `i64` for as long as every
//! operand and result fits; `+`, `-`, and `*` promote to `Big` exactly
//! when the mathematically correct result would leave that range, per
//! §8's boundary-behavior invariant. Every operation attempts to demote
//! its result back to `Small` afterward (`IntegerPayload::demote`), so a
//! `Big` value that returns to the tagged-immediate range doesn't linger
//! as a bignum across further operations.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::RubyError;
use crate::object::IntegerPayload;

fn to_big(p: &IntegerPayload) -> BigInt {
    match p {
        IntegerPayload::Small(n) => BigInt::from(*n),
        IntegerPayload::Big(b) => b.clone(),
    }
}

/// `a + b`, promoting to bignum only on actual overflow.
pub fn add(a: &IntegerPayload, b: &IntegerPayload) -> IntegerPayload {
    if let (IntegerPayload::Small(x), IntegerPayload::Small(y)) = (a, b) {
        if let Some(sum) = x.checked_add(*y) {
            return IntegerPayload::Small(sum).demote();
        }
    }
    IntegerPayload::Big(to_big(a) + to_big(b)).demote()
}

/// `a - b`, promoting to bignum only on actual overflow.
pub fn sub(a: &IntegerPayload, b: &IntegerPayload) -> IntegerPayload {
    if let (IntegerPayload::Small(x), IntegerPayload::Small(y)) = (a, b) {
        if let Some(diff) = x.checked_sub(*y) {
            return IntegerPayload::Small(diff).demote();
        }
    }
    IntegerPayload::Big(to_big(a) - to_big(b)).demote()
}

/// `a * b`, promoting to bignum only on actual overflow.
pub fn mul(a: &IntegerPayload, b: &IntegerPayload) -> IntegerPayload {
    if let (IntegerPayload::Small(x), IntegerPayload::Small(y)) = (a, b) {
        if let Some(prod) = x.checked_mul(*y) {
            return IntegerPayload::Small(prod).demote();
        }
    }
    IntegerPayload::Big(to_big(a) * to_big(b)).demote()
}

/// Ruby's `divmod`: floored division, quotient and a remainder with the
/// same sign as the divisor. Division by zero raises ZeroDivisionError
/// (§8) regardless of which operand triggered bignum promotion.
pub fn divmod(a: &IntegerPayload, b: &IntegerPayload) -> Result<(IntegerPayload, IntegerPayload), RubyError> {
    let bb = to_big(b);
    if bb.is_zero() {
        return Err(RubyError::ZeroDivisionError("divided by 0".into()));
    }
    let ab = to_big(a);
    // `BigInt`'s `div_rem`-style truncating division, then adjust toward
    // Ruby's floored semantics (remainder takes the divisor's sign).
    let mut q = &ab / &bb;
    let mut r = &ab - &q * &bb;
    if !r.is_zero() && (r.is_negative() != bb.is_negative()) {
        q -= 1;
        r += &bb;
    }
    Ok((IntegerPayload::Big(q).demote(), IntegerPayload::Big(r).demote()))
}

pub fn negate(a: &IntegerPayload) -> IntegerPayload {
    match a {
        IntegerPayload::Small(n) => match n.checked_neg() {
            Some(v) => IntegerPayload::Small(v),
            None => IntegerPayload::Big(-BigInt::from(*n)),
        },
        IntegerPayload::Big(b) => IntegerPayload::Big(-b.clone()).demote(),
    }
}

pub fn to_f64(a: &IntegerPayload) -> f64 {
    match a {
        IntegerPayload::Small(n) => *n as f64,
        IntegerPayload::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
    }
}

pub fn eq(a: &IntegerPayload, b: &IntegerPayload) -> bool {
    to_big(a) == to_big(b)
}

pub fn cmp(a: &IntegerPayload, b: &IntegerPayload) -> std::cmp::Ordering {
    to_big(a).cmp(&to_big(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_promotes_exactly_at_overflow() {
        let near_max = IntegerPayload::Small(i64::MAX);
        let one = IntegerPayload::Small(1);
        match add(&near_max, &one) {
            IntegerPayload::Big(_) => {}
            other => panic!("expected promotion to Big, got {other:?}"),
        }
    }

    #[test]
    fn add_stays_small_below_overflow() {
        let a = IntegerPayload::Small(10);
        let b = IntegerPayload::Small(20);
        match add(&a, &b) {
            IntegerPayload::Small(30) => {}
            other => panic!("expected Small(30), got {other:?}"),
        }
    }

    #[test]
    fn big_result_demotes_back_to_small() {
        let big = IntegerPayload::Big(BigInt::from(i64::MAX) + 1);
        let neg_big = IntegerPayload::Big(-BigInt::from(1));
        match add(&big, &neg_big) {
            IntegerPayload::Small(n) => assert_eq!(n, i64::MAX),
            other => panic!("expected demotion to Small, got {other:?}"),
        }
    }

    #[test]
    fn divmod_by_zero_raises() {
        let a = IntegerPayload::Small(10);
        let z = IntegerPayload::Small(0);
        assert!(divmod(&a, &z).is_err());
    }

    #[test]
    fn divmod_floors_toward_negative_infinity() {
        let a = IntegerPayload::Small(-7);
        let b = IntegerPayload::Small(2);
        let (q, r) = divmod(&a, &b).unwrap();
        assert_eq!(q, IntegerPayload::Small(-4));
        assert_eq!(r, IntegerPayload::Small(1));
    }
}
