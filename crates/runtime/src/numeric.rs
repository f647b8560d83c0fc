//! Float arithmetic and Integer/Float coercion at the dispatch boundary.
//!
//! Integers below the 44-bit tagged range never touch the heap at all:
//! `Value::from_int`/`as_int` carry them directly in the NaN-boxed word,
//! so there is no "synthesize a transient receiver, then promote it to a
//! heap `Object` if it escapes" dance to perform here the way a boxed
//! object model would need. `box_for_identity` below is the one place
//! that dance still happens: an immediate only needs a heap `Object`
//! once something asks for its identity (`object_id`, `freeze`,
//! `singleton_class`), at which point it is boxed on demand.

use rbcore::error::RubyError;
use rbcore::object::{IntegerPayload, Object, ObjectPayload};
use rbcore::value::Value;
use rbcore::{integer, Heap};

use crate::error::{RResult, RaisedException};

/// Either half of a binary numeric operand, after unwrapping a `Value`
/// that is known to be int-or-float (the dispatcher checks `is_int`/
/// `is_float`/boxed-Integer-payload before calling into here).
#[derive(Debug, Clone)]
pub enum Num {
    Int(IntegerPayload),
    Float(f64),
}

impl Num {
    pub fn to_f64(&self) -> f64 {
        match self {
            Num::Int(p) => integer::to_f64(p),
            Num::Float(f) => *f,
        }
    }

    /// Reads an immediate `Value` as a `Num`, for the fast path where
    /// neither operand is a boxed bignum.
    pub fn from_immediate(v: Value) -> Option<Num> {
        if let Some(n) = v.as_int() {
            Some(Num::Int(IntegerPayload::Small(n)))
        } else if let Some(f) = v.as_float() {
            Some(Num::Float(f))
        } else {
            None
        }
    }
}

fn raise(e: RubyError) -> RaisedException {
    RaisedException {
        error: e,
        exception: None,
        backtrace: Vec::new(),
    }
}

/// `a + b` with the usual Ruby coercion: Integer+Integer stays Integer
/// (promoting to bignum on overflow), anything touching a Float becomes
/// a Float.
pub fn add(a: Num, b: Num) -> Num {
    binop(a, b, integer::add, |x, y| x + y)
}

pub fn sub(a: Num, b: Num) -> Num {
    binop(a, b, integer::sub, |x, y| x - y)
}

pub fn mul(a: Num, b: Num) -> Num {
    binop(a, b, integer::mul, |x, y| x * y)
}

fn binop(
    a: Num,
    b: Num,
    int_op: impl Fn(&IntegerPayload, &IntegerPayload) -> IntegerPayload,
    float_op: impl Fn(f64, f64) -> f64,
) -> Num {
    match (&a, &b) {
        (Num::Int(x), Num::Int(y)) => Num::Int(int_op(x, y)),
        _ => Num::Float(float_op(a.to_f64(), b.to_f64())),
    }
}

/// `a / b`. Integer division by zero raises `ZeroDivisionError`; float
/// division by zero produces `Infinity`/`NaN` per IEEE 754 and does not
/// raise (only `divmod` on a float does, see [`float_divmod`]).
pub fn div(a: Num, b: Num) -> RResult<Num> {
    match (&a, &b) {
        (Num::Int(x), Num::Int(y)) => {
            let (q, _) = integer::divmod(x, y).map_err(raise)?;
            Ok(Num::Int(q))
        }
        _ => Ok(Num::Float(a.to_f64() / b.to_f64())),
    }
}

/// `a.divmod(b)`. Integer and float divisors share the zero-divisor
/// check; floats additionally reject a NaN or infinite operand with
/// `FloatDomainError` since no finite (quotient, remainder) pair exists.
pub fn divmod(a: Num, b: Num) -> RResult<(Num, Num)> {
    match (&a, &b) {
        (Num::Int(x), Num::Int(y)) => {
            let (q, r) = integer::divmod(x, y).map_err(raise)?;
            Ok((Num::Int(q), Num::Int(r)))
        }
        _ => {
            let (q, r) = float_divmod(a.to_f64(), b.to_f64())?;
            Ok((Num::Float(q), Num::Float(r)))
        }
    }
}

pub fn float_divmod(a: f64, b: f64) -> RResult<(f64, f64)> {
    if b == 0.0 {
        return Err(raise(RubyError::ZeroDivisionError("divided by 0".into())));
    }
    if a.is_nan() || b.is_nan() {
        return Err(raise(RubyError::FloatDomainError("NaN".into())));
    }
    if a.is_infinite() || b.is_infinite() {
        return Err(raise(RubyError::FloatDomainError("Infinity".into())));
    }
    let q = (a / b).floor();
    let r = a - q * b;
    Ok((q, r))
}

pub fn eq(a: &Num, b: &Num) -> bool {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => integer::eq(x, y),
        _ => a.to_f64() == b.to_f64(),
    }
}

pub fn cmp(a: &Num, b: &Num) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Some(integer::cmp(x, y)),
        _ => a.to_f64().partial_cmp(&b.to_f64()),
    }
}

fn box_payload(heap: &mut Heap, class: *mut Object, payload: ObjectPayload) -> Value {
    let ptr = heap.allocate(Object::new(class, payload), &[]);
    unsafe { Value::from_object_ptr(ptr) }
}

/// Boxes an immediate into a heap `Object` so it can carry an identity
/// (`object_id`, `freeze`, a singleton class). Immediates that already
/// demote back to the tagged range after arithmetic never go through
/// here; only explicit identity requests do.
pub fn box_for_identity(heap: &mut Heap, class: *mut Object, num: &Num) -> Value {
    let payload = match num {
        Num::Int(p) => ObjectPayload::Integer(p.clone()),
        Num::Float(f) => ObjectPayload::Float(*f),
    };
    box_payload(heap, class, payload)
}

/// Converts an arithmetic result back into the `Value` the dispatcher
/// hands back to the caller. A `Float` always fits the NaN-boxed word
/// directly. A `Small` integer fits immediate only while it stays
/// within the tagged 44-bit payload (see `rbcore::value::MAX_TAGGED_INT`);
/// an `i64` result wider than that — but not yet wide enough to need a
/// `BigInt` — still has to escape to a heap `Integer` Object, because
/// the tag space is narrower than `i64`, not because it's a bignum. A
/// `Big` result is always boxed. `integer_class` is the receiver's
/// `Integer` class, needed only on the boxing path.
pub fn into_value(heap: &mut Heap, integer_class: *mut Object, num: Num) -> Value {
    match num {
        Num::Float(f) => Value::from_float(f),
        Num::Int(IntegerPayload::Small(n)) => {
            Value::from_int(n).unwrap_or_else(|| box_payload(heap, integer_class, ObjectPayload::Integer(IntegerPayload::Small(n))))
        }
        Num::Int(big @ IntegerPayload::Big(_)) => box_payload(heap, integer_class, ObjectPayload::Integer(big)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_plus_int_stays_int() {
        let a = Num::Int(IntegerPayload::Small(2));
        let b = Num::Int(IntegerPayload::Small(3));
        match add(a, b) {
            Num::Int(IntegerPayload::Small(5)) => {}
            other => panic!("expected Small(5), got {other:?}"),
        }
    }

    #[test]
    fn int_plus_float_coerces_to_float() {
        let a = Num::Int(IntegerPayload::Small(2));
        let b = Num::Float(0.5);
        match add(a, b) {
            Num::Float(f) => assert_eq!(f, 2.5),
            other => panic!("expected Float(2.5), got {other:?}"),
        }
    }

    #[test]
    fn int_div_by_zero_raises() {
        let a = Num::Int(IntegerPayload::Small(1));
        let b = Num::Int(IntegerPayload::Small(0));
        let err = div(a, b).unwrap_err();
        assert!(matches!(err.error, RubyError::ZeroDivisionError(_)));
    }

    #[test]
    fn float_divmod_by_zero_raises_zero_division() {
        let err = float_divmod(1.0, 0.0).unwrap_err();
        assert!(matches!(err.error, RubyError::ZeroDivisionError(_)));
    }

    #[test]
    fn float_divmod_of_nan_raises_float_domain() {
        let err = float_divmod(f64::NAN, 1.0).unwrap_err();
        assert!(matches!(err.error, RubyError::FloatDomainError(_)));
    }

    #[test]
    fn float_divmod_matches_floored_semantics() {
        let (q, r) = float_divmod(-7.0, 2.0).unwrap();
        assert_eq!(q, -4.0);
        assert_eq!(r, 1.0);
    }

    #[test]
    fn from_immediate_reads_tagged_int_and_float() {
        let v = Value::from_int(7).unwrap();
        assert!(matches!(Num::from_immediate(v), Some(Num::Int(IntegerPayload::Small(7)))));
        let f = Value::from_float(1.5);
        assert!(matches!(Num::from_immediate(f), Some(Num::Float(_))));
    }

    #[test]
    fn into_value_keeps_small_results_immediate() {
        let mut heap = Heap::new();
        let v = into_value(&mut heap, std::ptr::null_mut(), Num::Int(IntegerPayload::Small(5)));
        assert!(v.is_int());
        assert_eq!(v.as_int(), Some(5));
    }

    #[test]
    fn into_value_boxes_results_past_the_tagged_range() {
        let mut heap = Heap::new();
        let class = heap.allocate(
            Object::new(std::ptr::null_mut(), ObjectPayload::Plain),
            &[],
        );
        let wide = rbcore::value::MAX_TAGGED_INT + 1;
        let v = into_value(&mut heap, class, Num::Int(IntegerPayload::Small(wide)));
        assert!(v.is_object());
        let obj = unsafe { &*v.as_object_ptr().unwrap() };
        match &obj.payload {
            ObjectPayload::Integer(IntegerPayload::Small(n)) => assert_eq!(*n, wide),
            other => panic!("expected boxed Small integer, got {other:?}"),
        }
    }

    #[test]
    fn into_value_boxes_bignum_results() {
        let mut heap = Heap::new();
        let class = heap.allocate(
            Object::new(std::ptr::null_mut(), ObjectPayload::Plain),
            &[],
        );
        let big = num_bigint::BigInt::from(i64::MAX) * 2;
        let v = into_value(&mut heap, class, Num::Int(IntegerPayload::Big(big.clone())));
        assert!(v.is_object());
        let obj = unsafe { &*v.as_object_ptr().unwrap() };
        match &obj.payload {
            ObjectPayload::Integer(IntegerPayload::Big(b)) => assert_eq!(*b, big),
            other => panic!("expected boxed Big integer, got {other:?}"),
        }
    }
}
