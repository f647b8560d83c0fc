//! Module/Class data: method tables, constant tables, class variables,
//! and ancestor linearization.
//!
//! A `Module` (or `Class`) is an ordinary [`crate::object::Object`] whose
//! payload is `ObjectPayload::Module(ModuleData)`. The dispatcher (in the
//! `rbruntime` crate) walks `ModuleData` to resolve a method or constant;
//! this module owns the data structures and the linearization algorithm,
//! not the calling convention used to invoke what it finds.

use std::collections::HashMap;
use std::ffi::c_void;

use crate::symbol::Symbol;
use crate::value::Value;

/// Calling convention for a native (Rust-implemented) method: the same
/// shape as an extension's entry point, so built-in and user-extension
/// methods share one representation. `env`/`block` are opaque here —
/// `rbruntime` defines their concrete layout and casts accordingly.
pub type NativeFn = extern "C" fn(
    env: *mut c_void,
    self_value: Value,
    argc: usize,
    argv: *const Value,
    block: *mut c_void,
) -> Value;

/// Arity bounds, Ruby convention: `max == None` means unlimited (a rest
/// parameter is present).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub required: u32,
    pub max: Option<u32>,
}

impl Arity {
    pub const fn fixed(n: u32) -> Arity {
        Arity {
            required: n,
            max: Some(n),
        }
    }

    pub const fn at_least(n: u32) -> Arity {
        Arity {
            required: n,
            max: None,
        }
    }

    pub fn accepts(self, argc: usize) -> bool {
        let argc = argc as u32;
        argc >= self.required && self.max.is_none_or(|max| argc <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// A callable: a native function pointer or an opaque pointer to a
/// `rbruntime::dispatch::Block` (a captured closure over an Env and AST
/// body). The `Ruby` variant is only ever constructed and interpreted by
/// `rbruntime`; `rbcore` just stores and copies the pointer.
#[derive(Debug, Clone, Copy)]
pub enum MethodBody {
    Native(NativeFn),
    Ruby(*mut c_void),
    /// Explicitly undefined: found during lookup, terminates the search
    /// with NoMethodError even if an ancestor defines the same name.
    Undefined,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: Symbol,
    pub owner: *mut crate::object::Object,
    pub visibility: Visibility,
    pub arity: Arity,
    pub body: MethodBody,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// For `alias`: the method this one was aliased from, preserved so
    /// redefining the original name doesn't change what the alias calls.
    pub alias_of: Option<Box<Method>>,
}

#[derive(Debug, Clone)]
pub enum ConstantValue {
    Resolved(Value),
    /// Not yet loaded; `loader` is invoked once on first read.
    Autoload { path: String },
}

#[derive(Debug, Clone)]
pub struct Constant {
    pub value: ConstantValue,
    pub private: bool,
    pub deprecated: bool,
}

/// Global, monotonically increasing method-cache version. Bumped by any
/// mutation that can change resolution results; a cached lookup is valid
/// iff its stamped version still equals this one.
static METHOD_CACHE_VERSION: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

pub fn current_method_cache_version() -> u64 {
    METHOD_CACHE_VERSION.load(std::sync::atomic::Ordering::Acquire)
}

pub fn invalidate_method_cache() -> u64 {
    METHOD_CACHE_VERSION.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    method: Option<*const Method>,
    version: u64,
}

/// Module/Class-specific fields, carried in `ObjectPayload::Module`.
#[derive(Debug)]
pub struct ModuleData {
    pub name: Option<String>,
    pub superclass: Option<*mut crate::object::Object>,
    /// Modules included via `include`, in include order (searched after
    /// this module's own methods).
    pub included: Vec<*mut crate::object::Object>,
    /// Modules included via `prepend`, in prepend order (searched before
    /// this module's own methods).
    pub prepended: Vec<*mut crate::object::Object>,
    pub methods: HashMap<Symbol, Method>,
    pub constants: HashMap<Symbol, Constant>,
    pub class_vars: HashMap<Symbol, Value>,
    pub is_singleton: bool,
    method_cache: HashMap<Symbol, CacheEntry>,
}

impl ModuleData {
    pub fn new(superclass: Option<*mut crate::object::Object>) -> ModuleData {
        ModuleData {
            name: None,
            superclass,
            included: Vec::new(),
            prepended: Vec::new(),
            methods: HashMap::new(),
            constants: HashMap::new(),
            class_vars: HashMap::new(),
            is_singleton: false,
            method_cache: HashMap::new(),
        }
    }

    /// `include`: appends unless `module` is already present anywhere in
    /// `included` (Ruby's re-include-is-a-no-op rule).
    pub fn include(&mut self, module: *mut crate::object::Object) {
        if !self.included.contains(&module) {
            self.included.push(module);
            invalidate_method_cache();
        }
    }

    /// `prepend`: inserted before this module's own methods.
    pub fn prepend(&mut self, module: *mut crate::object::Object) {
        if !self.prepended.contains(&module) {
            self.prepended.push(module);
            invalidate_method_cache();
        }
    }

    pub fn define_method(&mut self, method: Method) {
        self.methods.insert(method.name, method);
        invalidate_method_cache();
    }

    pub fn undef_method(&mut self, name: Symbol, owner: *mut crate::object::Object) {
        self.methods.insert(
            name,
            Method {
                name,
                owner,
                visibility: Visibility::Public,
                arity: Arity::at_least(0),
                body: MethodBody::Undefined,
                file: None,
                line: None,
                alias_of: None,
            },
        );
        invalidate_method_cache();
    }

    pub fn remove_method(&mut self, name: Symbol) {
        self.methods.remove(&name);
        invalidate_method_cache();
    }

    /// Cached lookup within this module only (no ancestor walk). Returns
    /// `None` on a cache miss or stale entry; the caller performs the
    /// real linearization search and calls `cache_store`.
    fn cache_lookup(&self, name: Symbol) -> Option<Option<*const Method>> {
        let entry = self.method_cache.get(&name)?;
        if entry.version == current_method_cache_version() {
            Some(entry.method)
        } else {
            None
        }
    }

    fn cache_store(&mut self, name: Symbol, method: Option<*const Method>) {
        self.method_cache.insert(
            name,
            CacheEntry {
                method,
                version: current_method_cache_version(),
            },
        );
    }
}

/// Ancestor order per §4.2: self → prepended (prepend order) → self's own
/// methods (implicit, not a separate node) → included (include order) →
/// superclass's own linearization. Cycles can't occur because
/// `include`/`prepend` refuse to insert a module already present.
pub fn linearize(module: *mut crate::object::Object) -> Vec<*mut crate::object::Object> {
    let mut chain = Vec::new();
    let mut cur = Some(module);
    while let Some(m) = cur {
        // Safety: callers hold the module alive for the duration of
        // dispatch; the object model itself is single-threaded.
        let data = unsafe { (*m).as_module() };
        let Some(data) = data else { break };
        for &p in data.prepended.iter().rev() {
            chain.push(p);
        }
        chain.push(m);
        for &inc in data.included.iter().rev() {
            chain.push(inc);
        }
        cur = data.superclass;
    }
    chain
}

/// Resolve `name` against `receiver_class`'s linearization, consulting
/// and maintaining each module's local method cache.
pub fn resolve_method(receiver_class: *mut crate::object::Object, name: Symbol) -> Option<*const Method> {
    for module in linearize(receiver_class) {
        let data = unsafe { (*module).as_module() }?;
        if let Some(cached) = data.cache_lookup(name) {
            if let Some(m) = cached {
                return Some(m);
            }
            continue; // cached negative result for this module
        }
        let found = data.methods.get(&name).map(|m| m as *const Method);
        let resolved = match found {
            Some(m) => {
                let body_is_undefined = unsafe { matches!((*m).body, MethodBody::Undefined) };
                if body_is_undefined {
                    // explicit undef terminates the whole search
                    unsafe { (*module).as_module_mut() }.unwrap().cache_store(name, None);
                    return None;
                }
                Some(m)
            }
            None => None,
        };
        unsafe { (*module).as_module_mut() }.unwrap().cache_store(name, resolved);
        if resolved.is_some() {
            return resolved;
        }
    }
    None
}

/// Find the module that owns class variable `name` reachable from
/// `start`: `start` itself, its included modules, then up the
/// superclass chain (and each ancestor's included modules in turn).
fn cvar_owner(start: *mut crate::object::Object, name: Symbol) -> Option<*mut crate::object::Object> {
    let mut cur = Some(start);
    while let Some(m) = cur {
        let data = unsafe { (*m).as_module() }?;
        if data.class_vars.contains_key(&name) {
            return Some(m);
        }
        for &inc in data.included.iter().rev() {
            let idata = unsafe { (*inc).as_module() }?;
            if idata.class_vars.contains_key(&name) {
                return Some(inc);
            }
        }
        cur = data.superclass;
    }
    None
}

/// Class-variable read: searched up the superclass chain and included
/// modules (§4.2); `nil` if never assigned.
pub fn cvar_get(start: *mut crate::object::Object, name: Symbol) -> Value {
    cvar_owner(start, name)
        .map(|owner| unsafe { (*owner).as_module().unwrap().class_vars[&name] })
        .unwrap_or_else(Value::nil)
}

/// Class-variable write: updates the nearest module in the chain that
/// already defines `name`; if none does, installs it on `start` itself
/// (§4.2 — this is also the target when assignment happens lexically
/// inside a `class_eval`/`module_eval` block opened on `start`).
pub fn cvar_set(start: *mut crate::object::Object, name: Symbol, value: Value) {
    let target = cvar_owner(start, name).unwrap_or(start);
    unsafe {
        (*target).as_module_mut().unwrap().class_vars.insert(name, value);
    }
}
