//! Constant resolution.
//!
//! Lookup proceeds in the four phases §4.2 specifies: a strict search of
//! the starting module only, a walk of lexically-enclosing modules (each
//! `Object`'s `owner` field, per the data model's "lexical owner used
//! for constant resolution") excluding the root namespace, a walk of the
//! starting module's ancestor chain, and finally the root namespace
//! itself. Privacy and deprecation are checked at the point a candidate
//! is found, not before the search reaches it.

use rbcore::module::{Constant, ConstantValue};
use rbcore::object::Object;
use rbcore::{RubyError, Symbol, Value, module};

/// How a constant reference was written, controlling whether the lookup
/// may leave `start` in search of an enclosing definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// `Foo` with no receiver: the full four-phase search.
    Unqualified,
    /// `Foo::Bar`: strict search of `Foo` only, no lexical or root fallback.
    Qualified,
}

/// A loader for an autoload constant, invoked once on first read. Owned
/// by the collaborator (the require/load subsystem) that registered it;
/// `rbruntime` only calls through the function pointer.
pub type AutoloadFn = fn(path: &str) -> Result<Value, RubyError>;

fn module_name(m: *mut Object) -> String {
    unsafe {
        (*m).as_module()
            .and_then(|d| d.name.clone())
            .unwrap_or_else(|| "#<Module>".to_string())
    }
}

fn resolve_in(module: *mut Object, name: Symbol, accessed_from_owner: bool) -> Option<Result<Value, RubyError>> {
    let data = unsafe { (*module).as_module() }?;
    let constant = data.constants.get(&name)?;
    if constant.private && !accessed_from_owner {
        return Some(Err(RubyError::NameError(format!(
            "private constant {}::{} referenced",
            module_name(module),
            name
        ))));
    }
    if constant.deprecated {
        tracing::warn!(constant = %name, owner = %module_name(module), "deprecated constant referenced");
    }
    Some(materialize(constant))
}

fn materialize(constant: &Constant) -> Result<Value, RubyError> {
    match &constant.value {
        ConstantValue::Resolved(v) => Ok(*v),
        ConstantValue::Autoload { path } => Err(RubyError::NameError(format!(
            "uninitialized constant (autoload path {path} was never resolved by the loader)"
        ))),
    }
}

/// Run the autoload initializer for `name` on `module` if it is still
/// pending, replacing the slot with the resolved value. The loader is a
/// collaborator concern (§6); this just enforces "invoked once".
pub fn resolve_autoload(module: *mut Object, name: Symbol, loader: AutoloadFn) -> Result<Value, RubyError> {
    let data = unsafe { (*module).as_module_mut() }
        .ok_or_else(|| RubyError::TypeError("autoload target is not a module".into()))?;
    let path = match data.constants.get(&name) {
        Some(Constant {
            value: ConstantValue::Autoload { path },
            ..
        }) => path.clone(),
        Some(Constant {
            value: ConstantValue::Resolved(v),
            ..
        }) => return Ok(*v),
        None => return Err(RubyError::NameError(format!("uninitialized constant {name}"))),
    };
    let resolved = loader(&path)?;
    let data = unsafe { (*module).as_module_mut() }.unwrap();
    if let Some(c) = data.constants.get_mut(&name) {
        c.value = ConstantValue::Resolved(resolved);
    }
    Ok(resolved)
}

/// Walk `start`'s lexical owner chain (§3's "owner module" field),
/// stopping before `root` — phase (b) of §4.2's algorithm.
fn lexical_owners(start: *mut Object, root: *mut Object) -> Vec<*mut Object> {
    let mut out = Vec::new();
    let mut cur = unsafe { (*start).owner };
    while let Some(owner) = cur {
        if owner == root {
            break;
        }
        out.push(owner);
        cur = unsafe { (*owner).owner };
    }
    out
}

/// Resolve `name` per §4.2's four-phase algorithm: strict search of
/// `start`, `start`'s lexical owner chain, `start`'s ancestor chain, then
/// the root namespace `root` (ordinarily the `Object` class).
pub fn resolve(start: *mut Object, name: Symbol, mode: Lookup, root: *mut Object) -> Result<Value, RubyError> {
    // Phase (a): strict search of `start` only.
    if let Some(result) = resolve_in(start, name, true) {
        return result;
    }
    if mode == Lookup::Qualified {
        return Err(RubyError::NameError(format!(
            "uninitialized constant {}::{}",
            module_name(start),
            name
        )));
    }

    // Phase (b): lexically-enclosing modules, excluding the root namespace.
    for owner in lexical_owners(start, root) {
        if let Some(result) = resolve_in(owner, name, owner == start) {
            return result;
        }
    }

    // Phase (c): the ancestor chain (included modules + superclasses).
    for ancestor in module::linearize(start) {
        if ancestor == start {
            continue; // already tried in phase (a)
        }
        if let Some(result) = resolve_in(ancestor, name, false) {
            return result;
        }
    }

    // Phase (d): root namespace.
    if let Some(result) = resolve_in(root, name, false) {
        return result;
    }

    Err(RubyError::NameError(format!("uninitialized constant {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbcore::module::ModuleData;
    use rbcore::object::ObjectPayload;

    fn make_module(superclass: Option<*mut Object>) -> *mut Object {
        Box::into_raw(Box::new(Object::new(
            std::ptr::null_mut(),
            ObjectPayload::Module(ModuleData::new(superclass)),
        )))
    }

    fn define_const(m: *mut Object, name: Symbol, value: Value, private: bool) {
        unsafe {
            (*m).as_module_mut().unwrap().constants.insert(
                name,
                Constant {
                    value: ConstantValue::Resolved(value),
                    private,
                    deprecated: false,
                },
            );
        }
    }

    #[test]
    fn strict_lookup_finds_own_constant() {
        let root = make_module(None);
        let m = make_module(None);
        let name = rbcore::intern("FOO");
        define_const(m, name, Value::from_int(1).unwrap(), false);
        let result = resolve(m, name, Lookup::Qualified, root);
        assert_eq!(result.unwrap().as_int(), Some(1));
    }

    #[test]
    fn private_constant_rejected_from_outside() {
        let root = make_module(None);
        let m = make_module(None);
        let name = rbcore::intern("SECRET");
        define_const(m, name, Value::from_int(1).unwrap(), true);
        assert!(resolve(m, name, Lookup::Qualified, root).is_err());
    }

    #[test]
    fn ancestor_chain_is_searched_when_unqualified() {
        let root = make_module(None);
        let base = make_module(None);
        let klass = make_module(Some(base));
        let name = rbcore::intern("INHERITED");
        define_const(base, name, Value::from_int(7).unwrap(), false);
        let result = resolve(klass, name, Lookup::Unqualified, root);
        assert_eq!(result.unwrap().as_int(), Some(7));
    }

    #[test]
    fn lexical_owner_is_checked_before_ancestors() {
        let root = make_module(None);
        let outer = make_module(None);
        let inner = make_module(None);
        unsafe {
            (*inner).owner = Some(outer);
        }
        let name = rbcore::intern("NESTED");
        define_const(outer, name, Value::from_int(5).unwrap(), false);
        let result = resolve(inner, name, Lookup::Unqualified, root);
        assert_eq!(result.unwrap().as_int(), Some(5));
    }

    #[test]
    fn root_namespace_is_last_resort() {
        let root = make_module(None);
        let klass = make_module(None);
        let name = rbcore::intern("String");
        define_const(root, name, Value::from_int(99).unwrap(), false);
        let result = resolve(klass, name, Lookup::Unqualified, root);
        assert_eq!(result.unwrap().as_int(), Some(99));
    }
}
