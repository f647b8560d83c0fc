//! The heap-allocated `Object`: base record for every non-immediate value.

use std::collections::HashMap;

use num_bigint::BigInt;

use crate::error::RubyError;
use crate::heap::Heap;
use crate::module::ModuleData;
use crate::symbol::Symbol;
use crate::value::Value;

/// A minimal hand-rolled bitflags type: the corpus reaches for the real
/// `bitflags` crate for this shape, but the core crate's dependency list
/// has no other use for it, so a few dozen lines of the same API surface
/// (`contains`/`insert`/`remove`/`bits`) are inlined instead of pulling
/// in a crate for one struct.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn bits(self) -> $ty {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Per-object flags, packed into a single word.
    pub struct ObjectFlags: u32 {
        const FROZEN      = 1 << 0;
        const TAINTED     = 1 << 1;
        const MAIN_OBJECT = 1 << 2;
        /// Set on a block's result wrapper while a `break` unwinds through
        /// an enclosing iteration; cleared once the iterator observes it.
        const BREAK_MARKER = 1 << 3;
        /// Marks objects synthesized by the dispatcher for an optimized
        /// immediate-receiver call (see `rbruntime::dispatch`); such an
        /// object must be promoted (duplicated onto the heap under a
        /// fresh, non-synthetic identity) before it is allowed to escape.
        const SYNTHETIC = 1 << 4;
    }
}

/// Integer payload: a native `i64` until an arithmetic result overflows
/// the 44-bit immediate range (see `crate::value::MAX_TAGGED_INT`) or is
/// built directly from a literal too large to tag, at which point it is
/// promoted to an arbitrary-precision `BigInt`. Operations attempt to
/// demote a `Big` result back to `Small` whenever it re-fits.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegerPayload {
    Small(i64),
    Big(BigInt),
}

impl IntegerPayload {
    pub fn demote(self) -> IntegerPayload {
        match self {
            IntegerPayload::Big(ref b) => match i64::try_from(b) {
                Ok(n) if (crate::value::MIN_TAGGED_INT..=crate::value::MAX_TAGGED_INT).contains(&n) => {
                    IntegerPayload::Small(n)
                }
                _ => self,
            },
            small => small,
        }
    }
}

/// Ordered-insertion hash table backing `Hash` objects: a parallel `Vec`
/// of entries plus an index map, so iteration order matches insertion
/// order the way Ruby's `Hash` guarantees while lookup stays O(1).
#[derive(Debug, Clone, Default)]
pub struct RubyHash {
    entries: Vec<(Value, Value)>,
    index: HashMap<u64, usize>,
}

impl RubyHash {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_bits(key: Value) -> u64 {
        key.raw_bits()
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        self.index
            .get(&Self::key_bits(key))
            .map(|&i| self.entries[i].1)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        if let Some(&i) = self.index.get(&Self::key_bits(key)) {
            self.entries[i].1 = value;
        } else {
            self.index.insert(Self::key_bits(key), self.entries.len());
            self.entries.push((key, value));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone)]
pub struct RangeData {
    pub start: Value,
    pub end: Value,
    pub exclusive: bool,
}

#[derive(Debug, Clone)]
pub struct ExceptionData {
    pub message: String,
    pub backtrace: Vec<String>,
}

/// An opaque native pointer with an optional finalizer, the escape hatch
/// collaborator extensions use to attach a foreign resource to a Ruby
/// object's lifetime.
pub struct VoidPtrData {
    pub ptr: *mut std::ffi::c_void,
    pub finalize: Option<fn(*mut std::ffi::c_void)>,
}

impl std::fmt::Debug for VoidPtrData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VoidPtrData({:p})", self.ptr)
    }
}

impl Drop for VoidPtrData {
    fn drop(&mut self) {
        if let Some(finalize) = self.finalize {
            finalize(self.ptr);
        }
    }
}

/// The type-specific payload of an `Object`. `Module`/`Class` objects
/// store their method/constant/class-variable tables in `ModuleData`,
/// defined alongside the dispatch-facing linearization logic in
/// `crate::module`.
#[derive(Debug)]
pub enum ObjectPayload {
    Plain,
    Integer(IntegerPayload),
    Float(f64),
    String { bytes: Vec<u8>, encoding: Symbol },
    SymbolValue(Symbol),
    Array(Vec<Value>),
    Hash(RubyHash),
    Range(RangeData),
    Exception(ExceptionData),
    VoidPtr(VoidPtrData),
    Module(ModuleData),
}

/// Base heap record for every managed, non-immediate value.
#[derive(Debug)]
pub struct Object {
    pub class: *mut Object,
    pub singleton_class: Option<*mut Object>,
    pub owner: Option<*mut Object>,
    pub flags: ObjectFlags,
    pub ivars: HashMap<Symbol, Value>,
    pub payload: ObjectPayload,
}

impl Object {
    pub fn new(class: *mut Object, payload: ObjectPayload) -> Object {
        Object {
            class,
            singleton_class: None,
            owner: None,
            flags: ObjectFlags::empty(),
            ivars: HashMap::new(),
            payload,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.flags.contains(ObjectFlags::FROZEN)
    }

    pub fn freeze(&mut self) {
        self.flags.insert(ObjectFlags::FROZEN);
    }

    pub fn ivar_get(&self, name: Symbol) -> Value {
        self.ivars.get(&name).copied().unwrap_or_else(Value::nil)
    }

    /// Returns `Err` if the receiver is frozen; the caller is expected to
    /// turn that into a `RubyError::FrozenError` at the dispatch boundary.
    pub fn ivar_set(&mut self, name: Symbol, value: Value) -> Result<(), ()> {
        if self.is_frozen() {
            return Err(());
        }
        self.ivars.insert(name, value);
        Ok(())
    }

    /// Return this object's singleton class, allocating one on first
    /// request. The singleton class is interposed between the object and
    /// its current class so existing is-a relations are preserved: its
    /// superclass is set to the class the object had before this call.
    /// Frozen objects refuse singleton-class creation (§4.2).
    ///
    /// `self_ptr` must be the heap address of `self`; it becomes the
    /// singleton class's sole instance for `is_singleton`-aware callers
    /// (the dispatcher substitutes it for the receiver's immediate class
    /// without needing a back-pointer on `Object` itself).
    pub fn singleton_class(&mut self, self_ptr: *mut Object, heap: &mut Heap) -> Result<*mut Object, RubyError> {
        if self.is_frozen() {
            return Err(RubyError::FrozenError(
                "can't define singleton method on frozen object".into(),
            ));
        }
        if let Some(sc) = self.singleton_class {
            return Ok(sc);
        }
        let original_class = self.class;
        let mut data = ModuleData::new(Some(original_class));
        data.is_singleton = true;
        data.name = Some(format!("#<Class:#{:p}>", self_ptr));
        // The singleton class is itself an instance of whatever class the
        // original class belonged to (ordinarily `Class`).
        let meta = if original_class.is_null() {
            original_class
        } else {
            unsafe { (*original_class).class }
        };
        let sc_obj = Object::new(meta, ObjectPayload::Module(data));
        let sc_ptr = heap.allocate(sc_obj, &[]);
        self.singleton_class = Some(sc_ptr);
        self.class = sc_ptr;
        Ok(sc_ptr)
    }

    pub fn as_module(&self) -> Option<&ModuleData> {
        match &self.payload {
            ObjectPayload::Module(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_module_mut(&mut self) -> Option<&mut ModuleData> {
        match &mut self.payload {
            ObjectPayload::Module(m) => Some(m),
            _ => None,
        }
    }
}

// `Object` is reachable only through GC-managed pointers that are never
// shared across OS threads in this single-threaded runtime; the raw
// pointer fields exist purely for intra-heap linkage.
unsafe impl Send for Object {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_rejects_ivar_write() {
        let mut obj = Object::new(std::ptr::null_mut(), ObjectPayload::Plain);
        obj.freeze();
        assert!(obj.ivar_set(crate::symbol::intern("@x"), Value::nil()).is_err());
    }

    #[test]
    fn unset_ivar_reads_as_nil() {
        let obj = Object::new(std::ptr::null_mut(), ObjectPayload::Plain);
        let v = obj.ivar_get(crate::symbol::intern("@never_set"));
        assert!(v.is_nil());
    }

    #[test]
    fn singleton_class_preserves_is_a_and_is_idempotent() {
        let mut heap = crate::heap::Heap::new();
        let original_class = heap.allocate(
            Object::new(std::ptr::null_mut(), ObjectPayload::Module(ModuleData::new(None))),
            &[],
        );
        let obj_ptr = heap.allocate(Object::new(original_class, ObjectPayload::Plain), &[]);
        let first = unsafe { (*obj_ptr).singleton_class(obj_ptr, &mut heap).unwrap() };
        unsafe {
            let data = (*first).as_module().unwrap();
            assert_eq!(data.superclass, Some(original_class));
            assert!(data.is_singleton);
        }
        let second = unsafe { (*obj_ptr).singleton_class(obj_ptr, &mut heap).unwrap() };
        assert_eq!(first, second);
    }

    #[test]
    fn frozen_object_refuses_singleton_class() {
        let mut heap = crate::heap::Heap::new();
        let mut obj = Object::new(std::ptr::null_mut(), ObjectPayload::Plain);
        obj.freeze();
        assert!(obj.singleton_class(std::ptr::null_mut(), &mut heap).is_err());
    }

    #[test]
    fn bignum_demotes_when_it_refits() {
        let big = IntegerPayload::Big(BigInt::from(10));
        match big.demote() {
            IntegerPayload::Small(10) => {}
            other => panic!("expected demotion to Small(10), got {other:?}"),
        }
    }

    #[test]
    fn ruby_hash_preserves_insertion_order() {
        let mut h = RubyHash::new();
        h.insert(Value::from_int(1).unwrap(), Value::from_int(10).unwrap());
        h.insert(Value::from_int(2).unwrap(), Value::from_int(20).unwrap());
        h.insert(Value::from_int(1).unwrap(), Value::from_int(99).unwrap());
        let collected: Vec<_> = h.iter().map(|(k, _)| k.as_int().unwrap()).collect();
        assert_eq!(collected, vec![1, 2]);
        assert_eq!(h.get(Value::from_int(1).unwrap()).unwrap().as_int(), Some(99));
    }
}
