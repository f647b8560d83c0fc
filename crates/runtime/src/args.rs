//! Argument views and parameter binding.

use rbcore::{RubyError, Value};

/// A non-owning view over a positional argument buffer, with a flag
/// marking whether the trailing value is a keyword hash. This is the
/// `Args` half of the native calling convention named in `rbcore::module::NativeFn`.
#[derive(Clone, Copy)]
pub struct Args<'a> {
    values: &'a [Value],
    trailing_is_kwargs: bool,
}

impl<'a> Args<'a> {
    pub fn new(values: &'a [Value], trailing_is_kwargs: bool) -> Args<'a> {
        Args {
            values,
            trailing_is_kwargs,
        }
    }

    pub fn positional_len(&self) -> usize {
        if self.trailing_is_kwargs {
            self.values.len().saturating_sub(1)
        } else {
            self.values.len()
        }
    }

    pub fn positional(&self) -> &'a [Value] {
        &self.values[..self.positional_len()]
    }

    pub fn kwargs_hash(&self) -> Option<Value> {
        self.trailing_is_kwargs.then(|| *self.values.last().unwrap())
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.positional().get(index).copied()
    }
}

/// A method's declared parameter shape: required positionals, optionals
/// (each paired with a default-value slot index evaluated in the new
/// frame), an optional rest parameter, post-required positionals after
/// the rest, named keyword parameters, an optional keyword-rest, and
/// whether a block parameter is declared.
#[derive(Debug, Clone, Default)]
pub struct ParamSpec {
    pub required: usize,
    pub optional: usize,
    pub has_rest: bool,
    pub post: usize,
    pub keywords: Vec<(rbcore::Symbol, bool)>, // (name, required)
    pub has_kwrest: bool,
    pub has_block: bool,
}

impl ParamSpec {
    fn min_positional(&self) -> usize {
        self.required + self.post
    }

    fn max_positional(&self) -> Option<usize> {
        if self.has_rest {
            None
        } else {
            Some(self.required + self.optional + self.post)
        }
    }

    /// The canonical "wrong number of arguments (given N, expected M)"
    /// message Ruby raises on arity mismatch.
    fn arity_message(&self, given: usize) -> String {
        let min = self.min_positional();
        let expected = match self.max_positional() {
            Some(max) if max == min => format!("{min}"),
            Some(max) => format!("{min}..{max}"),
            None => format!("{min}+"),
        };
        format!("wrong number of arguments (given {given}, expected {expected})")
    }

    pub fn check_arity(&self, given: usize) -> Result<(), RubyError> {
        let min = self.min_positional();
        let fits_max = self.max_positional().is_none_or(|max| given <= max);
        if given < min || !fits_max {
            return Err(RubyError::ArgumentError(self.arity_message(given)));
        }
        Ok(())
    }
}

/// Bound positional slots, ready to be written into an `Env`'s locals in
/// declaration order: required, optional (with `None` meaning "use the
/// default expression"), rest (as a Ruby Array Value built by the
/// caller), post.
pub struct BoundArgs {
    pub required: Vec<Value>,
    pub optional: Vec<Option<Value>>,
    pub rest: Vec<Value>,
    pub post: Vec<Value>,
}

/// Bind `positional` against `spec`, splitting into required/optional/
/// rest/post groups. Arity is assumed already checked via
/// `ParamSpec::check_arity`.
pub fn bind_positional(spec: &ParamSpec, positional: &[Value]) -> BoundArgs {
    let mut idx = 0;
    let required: Vec<Value> = positional[idx..idx + spec.required].to_vec();
    idx += spec.required;

    let remaining_after_required = positional.len() - idx;
    let available_for_rest_and_optional = remaining_after_required.saturating_sub(spec.post);

    let optional_fill = spec.optional.min(available_for_rest_and_optional);
    let mut optional = Vec::with_capacity(spec.optional);
    for i in 0..spec.optional {
        if i < optional_fill {
            optional.push(Some(positional[idx]));
            idx += 1;
        } else {
            optional.push(None);
        }
    }

    let rest_len = available_for_rest_and_optional - optional_fill;
    let rest = if spec.has_rest {
        let r = positional[idx..idx + rest_len].to_vec();
        idx += rest_len;
        r
    } else {
        Vec::new()
    };

    let post = positional[idx..idx + spec.post].to_vec();

    BoundArgs {
        required,
        optional,
        rest,
        post,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: i64) -> Value {
        Value::from_int(n).unwrap()
    }

    #[test]
    fn exact_arity_matches() {
        let spec = ParamSpec {
            required: 2,
            ..Default::default()
        };
        assert!(spec.check_arity(2).is_ok());
        let err = spec.check_arity(1).unwrap_err();
        assert_eq!(
            err.message(),
            "wrong number of arguments (given 1, expected 2)"
        );
    }

    #[test]
    fn rest_allows_unbounded_extra() {
        let spec = ParamSpec {
            required: 1,
            has_rest: true,
            ..Default::default()
        };
        assert!(spec.check_arity(1).is_ok());
        assert!(spec.check_arity(50).is_ok());
        assert!(spec.check_arity(0).is_err());
    }

    #[test]
    fn optional_and_post_binding() {
        let spec = ParamSpec {
            required: 1,
            optional: 2,
            post: 1,
            ..Default::default()
        };
        let args = [v(1), v(2), v(3)];
        let bound = bind_positional(&spec, &args);
        assert_eq!(bound.required, vec![v(1)]);
        assert_eq!(bound.optional, vec![Some(v(2)), None]);
        assert_eq!(bound.post, vec![v(3)]);
    }

    #[test]
    fn rest_soaks_up_middle_values() {
        let spec = ParamSpec {
            required: 1,
            has_rest: true,
            post: 1,
            ..Default::default()
        };
        let args = [v(1), v(2), v(3), v(4)];
        let bound = bind_positional(&spec, &args);
        assert_eq!(bound.required, vec![v(1)]);
        assert_eq!(bound.rest, vec![v(2), v(3)]);
        assert_eq!(bound.post, vec![v(4)]);
    }
}
