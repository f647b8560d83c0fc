//! Method resolution and invocation.

use std::ffi::c_void;

use rbcore::module::{self, MethodBody, Visibility};
use rbcore::object::Object;
use rbcore::{RubyError, Symbol, Value};

use crate::args::Args;
use crate::error::{RResult, raise};
use crate::env::Env;

/// How a call was made, controlling visibility checks: `send`-style
/// calls (`CallMode::Send`) may call private/protected methods;
/// ordinary dotted calls with an explicit receiver (`CallMode::Explicit`)
/// may not call private methods, and may call protected ones only if
/// the caller's `self` is_a? the receiver's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// No explicit receiver (`foo` inside a method body): private is fine.
    Implicit,
    /// `obj.foo`: private is rejected, protected requires a same-hierarchy caller.
    Explicit,
    /// `obj.send(:foo)` / `__send__`: visibility is bypassed entirely.
    Send,
}

fn is_a(class: *mut Object, ancestor: *mut Object) -> bool {
    module::linearize(class).contains(&ancestor)
}

fn check_visibility(
    method: &module::Method,
    mode: CallMode,
    caller_self_class: Option<*mut Object>,
) -> Result<(), RubyError> {
    match (method.visibility, mode) {
        (_, CallMode::Send) => Ok(()),
        (Visibility::Public, _) => Ok(()),
        (Visibility::Private, CallMode::Explicit) => Err(RubyError::NoMethodError(format!(
            "private method '{}' called",
            method.name
        ))),
        (Visibility::Private, CallMode::Implicit) => Ok(()),
        (Visibility::Protected, _) => {
            let ok = caller_self_class.is_some_and(|c| is_a(c, method.owner));
            if ok {
                Ok(())
            } else {
                Err(RubyError::NoMethodError(format!(
                    "protected method '{}' called",
                    method.name
                )))
            }
        }
    }
}

/// Resolve and invoke `name` on `receiver` (whose immediate class is
/// `receiver_class`, already accounting for a singleton class if one
/// exists). `env`/`block` are passed through to a native method
/// unchanged; an AST method body is invoked via `rbruntime::block`
/// machinery elsewhere and is out of scope for this entry point.
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    env: &Env,
    receiver: Value,
    receiver_class: *mut Object,
    name: Symbol,
    args: Args,
    block: *mut c_void,
    mode: CallMode,
    caller_self_class: Option<*mut Object>,
) -> RResult<Value> {
    let method_ptr = module::resolve_method(receiver_class, name).ok_or_else(|| {
        raise(
            env,
            RubyError::NoMethodError(format!(
                "undefined method '{name}' for an instance of {}",
                class_name(receiver_class)
            )),
        )
    })?;

    // Safety: the method table outlives any single dispatch; nothing
    // mutates `*method_ptr` for the duration of this call in the
    // single-threaded cooperative model.
    let method = unsafe { &*method_ptr };

    check_visibility(method, mode, caller_self_class).map_err(|e| raise(env, e))?;

    match method.body {
        MethodBody::Native(f) => Ok(f(
            env as *const Env as *mut c_void,
            receiver,
            args.positional().len(),
            args.positional().as_ptr(),
            block,
        )),
        MethodBody::Ruby(_ast) => {
            // AST method bodies are interpreted by the compiler
            // collaborator's block-call machinery (`crate::block`); the
            // dispatcher's job ends at finding and authorizing the method.
            Err(raise(
                env,
                RubyError::RuntimeError(
                    "AST method invocation requires a compiler-provided interpreter".into(),
                ),
            ))
        }
        MethodBody::Undefined => unreachable!("resolve_method never returns an Undefined body"),
    }
}

/// Re-enter resolution for `super`: starts searching the linearization
/// immediately after `current_owner`, rather than from the receiver's
/// own class.
pub fn resolve_super(
    receiver_class: *mut Object,
    current_owner: *mut Object,
    name: Symbol,
) -> Option<*const module::Method> {
    let chain = module::linearize(receiver_class);
    let start = chain.iter().position(|&m| m == current_owner)? + 1;
    for &module_ptr in &chain[start..] {
        let data = unsafe { (*module_ptr).as_module() }?;
        if let Some(m) = data.methods.get(&name) {
            if !matches!(m.body, MethodBody::Undefined) {
                return Some(m as *const module::Method);
            }
            return None;
        }
    }
    None
}

fn class_name(class: *mut Object) -> String {
    unsafe {
        (*class)
            .as_module()
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| "#<Class>".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbcore::module::{Arity, Method, ModuleData};
    use rbcore::object::ObjectPayload;

    fn make_class(superclass: Option<*mut Object>) -> *mut Object {
        Box::into_raw(Box::new(Object::new(
            std::ptr::null_mut(),
            ObjectPayload::Module(ModuleData::new(superclass)),
        )))
    }

    extern "C" fn answer(_env: *mut c_void, _self: Value, _argc: usize, _argv: *const Value, _block: *mut c_void) -> Value {
        Value::from_int(42).unwrap()
    }

    #[test]
    fn undefined_method_raises_no_method_error() {
        let klass = make_class(None);
        let mut locals: [Value; 0] = [];
        let env = Env::new_root(&mut locals, "t.rb", 1);
        let result = dispatch(
            &env,
            Value::nil(),
            klass,
            rbcore::intern("missing"),
            Args::new(&[], false),
            std::ptr::null_mut(),
            CallMode::Explicit,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn private_method_rejects_explicit_receiver() {
        let klass = make_class(None);
        let name = rbcore::intern("secret");
        unsafe {
            (*klass).as_module_mut().unwrap().define_method(Method {
                name,
                owner: klass,
                visibility: Visibility::Private,
                arity: Arity::fixed(0),
                body: MethodBody::Native(answer),
                file: None,
                line: None,
                alias_of: None,
            });
        }
        let mut locals: [Value; 0] = [];
        let env = Env::new_root(&mut locals, "t.rb", 1);
        let explicit = dispatch(
            &env,
            Value::nil(),
            klass,
            name,
            Args::new(&[], false),
            std::ptr::null_mut(),
            CallMode::Explicit,
            None,
        );
        assert!(explicit.is_err());
        let implicit = dispatch(
            &env,
            Value::nil(),
            klass,
            name,
            Args::new(&[], false),
            std::ptr::null_mut(),
            CallMode::Implicit,
            None,
        );
        assert_eq!(implicit.unwrap().as_int(), Some(42));
    }

    #[test]
    fn super_starts_after_current_owner() {
        let base = make_class(None);
        let mid = make_class(Some(base));
        let klass = make_class(Some(mid));
        let name = rbcore::intern("greet_super_test");
        unsafe {
            (*base).as_module_mut().unwrap().define_method(Method {
                name,
                owner: base,
                visibility: Visibility::Public,
                arity: Arity::fixed(0),
                body: MethodBody::Native(answer),
                file: None,
                line: None,
                alias_of: None,
            });
        }
        let found = resolve_super(klass, mid, name);
        assert!(found.is_some());
    }
}
