// Copyright (c) 2025 knix
// All rights reserved.

use log::trace;

use crate::names::{At, Name};
use crate::types::TypeId;
use crate::values::{Callable, CallableId, ErrorKind, EvalResult, Runtime, Value, is_binding_failure};
use crate::{bugf, failf};

impl Runtime {
    /// Dotted invocation. Plain instances resolve with a leaf lookup in
    /// their flattened per-instance table; construction already folded the
    /// whole inheritance lattice in, so no walk happens here. As-if wrapped
    /// values instead search the asserted type's transitive-extends list,
    /// first hit wins.
    pub fn invoke_method(
        &mut self,
        receiver: &Value,
        method: Name,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        let found = match receiver {
            Value::Object(oid) => {
                let env = self.objects.get(*oid).env;
                match self.envs.get_leaf_value(env, method) {
                    Some(v) => Some(v),
                    None => self
                        .envs
                        .parent(env)
                        .and_then(|methods| self.envs.get_leaf_value(methods, method)),
                }
            }
            Value::AsIf { as_type, .. } => {
                let mut hit = None;
                for t in self.types.transitive_extends(*as_type) {
                    let Some(&menv) = self.members.get(&t) else { continue };
                    if let Some(v) = self.envs.get_leaf_value(menv, method) {
                        trace!(
                            "as-if lookup of `{}` landed on {}",
                            self.names.str(method),
                            self.types.display(t, &self.names)
                        );
                        hit = Some(v);
                        break;
                    }
                }
                hit
            }
            other => {
                return failf!(
                    ErrorKind::UnexpectedValue,
                    at,
                    "cannot invoke `{}` on a {}",
                    self.names.str(method),
                    other.kind_name()
                );
            }
        };
        match found {
            Some(Value::Fn(f)) => self.dispatch_dotted(f, receiver, args, at),
            Some(other) => {
                let shown = self.display_value_type(receiver);
                failf!(
                    ErrorKind::UnexpectedValue,
                    at,
                    "`{}` on {} is a {}, not a method",
                    self.names.str(method),
                    shown,
                    other.kind_name()
                )
            }
            None => {
                let shown = self.display_value_type(receiver);
                failf!(
                    ErrorKind::NoSuchMethod,
                    at,
                    "no method `{}` on {}",
                    self.names.str(method),
                    shown
                )
            }
        }
    }

    fn dispatch_dotted(
        &mut self,
        f: CallableId,
        receiver: &Value,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        match self.callables.get(f) {
            Callable::Overloaded(_) => {
                let winner = self.best_match(f, args, at)?;
                self.apply_method(winner, receiver, args, at)
            }
            Callable::Generic(_) => {
                let key = self.arg_types(args);
                let type_args = self.infer_instantiation(f, &key, at)?;
                let inst = self.instantiate(f, &type_args, at)?;
                self.apply_method(inst, receiver, args, at)
            }
            _ => self.apply_method(f, receiver, args, at),
        }
    }

    /// Run one method body with the receiver supplied. A functional method
    /// reached through a dotted call gets the receiver spliced back into its
    /// declared positional slot first. Same tuple-splat protocol as plain
    /// application.
    pub(crate) fn apply_method(
        &mut self,
        f: CallableId,
        self_value: &Value,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        let self_index = match self.callables.get(f) {
            Callable::Method(m) => m.self_index,
            Callable::Ctor(_) => return self.apply_constructor(f, args, at),
            _ => None,
        };
        let spliced: Vec<Value>;
        let args = match self_index {
            Some(i) if (i as usize) <= args.len() => {
                let i = i as usize;
                let mut v = Vec::with_capacity(args.len() + 1);
                v.extend_from_slice(&args[..i]);
                v.push(self_value.clone());
                v.extend_from_slice(&args[i..]);
                spliced = v;
                &spliced[..]
            }
            Some(i) => {
                return failf!(
                    ErrorKind::Arity,
                    at,
                    "`{}` places self at position {} but only {} arguments were given",
                    self.names.str(self.as_method_name(f)),
                    i + 1,
                    args.len()
                );
            }
            None => args,
        };
        if args.len() == 1 {
            if let Value::Tuple(elems) = &args[0] {
                let splatted: Vec<Value> = elems.iter().cloned().collect();
                return match self.apply_single(f, &splatted, at, Some(self_value)) {
                    Ok(v) => Ok(v),
                    Err(first) if is_binding_failure(first.kind) => {
                        match self.apply_single(f, args, at, Some(self_value)) {
                            Ok(v) => Ok(v),
                            Err(_) => Err(first),
                        }
                    }
                    Err(e) => Err(e),
                };
            }
        }
        self.apply_single(f, args, at, Some(self_value))
    }

    /// Functional methods resolve twice. The value-level overload already
    /// picked `winner`; now the self argument's concrete runtime type gets a
    /// say, so an override in the receiving object's table supersedes the
    /// trait-level body that won the first round.
    pub(crate) fn apply_functional(
        &mut self,
        winner: CallableId,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        let (self_index, name) = match self.callables.get(winner) {
            Callable::Method(m) => (m.self_index, m.def.name),
            other => return bugf!(at, "apply_functional on a {}", other.kind_name()),
        };
        let Some(i) = self_index else {
            return bugf!(
                at,
                "`{}` dispatched functionally but has no self slot",
                self.names.str(name)
            );
        };
        let i = i as usize;
        if i >= args.len() {
            return failf!(
                ErrorKind::Arity,
                at,
                "`{}` places self at position {} but only {} arguments were given",
                self.names.str(name),
                i + 1,
                args.len()
            );
        }
        // An asserted-supertype wrapper is shed here: the receiver really is
        // an instance of its concrete type, and the override picked below
        // declares its self parameter at that type
        let unwrapped: Vec<Value>;
        let args: &[Value] = match &args[i] {
            Value::AsIf { object, .. } => {
                let mut v = args.to_vec();
                v[i] = Value::Object(*object);
                unwrapped = v;
                &unwrapped
            }
            _ => args,
        };
        let self_val = args[i].clone();
        let concrete = match &self_val {
            Value::Object(oid) => Some(self.objects.get(*oid).ty),
            _ => None,
        };
        let resolved = match concrete {
            Some(ty) => self.resolve_in_table(ty, name, args, at)?.unwrap_or(winner),
            None => winner,
        };
        self.apply_single(resolved, args, at, Some(&self_val))
    }

    /// Leaf lookup of `name` in a type's flattened method table, resolving
    /// per-name overload sets against the full argument list.
    fn resolve_in_table(
        &mut self,
        ty: TypeId,
        name: Name,
        args: &[Value],
        at: At,
    ) -> EvalResult<Option<CallableId>> {
        let Some(&ctor) = self.ctor_of.get(&ty) else {
            return Ok(None);
        };
        let table = self.ensure_method_table(ctor, at)?;
        let Some(entry) = table.lookup(name) else {
            return Ok(None);
        };
        match self.callables.get(entry) {
            Callable::Overloaded(_) => Ok(Some(self.best_match(entry, args, at)?)),
            Callable::Generic(_) => {
                let key = self.arg_types(args);
                let type_args = self.infer_instantiation(entry, &key, at)?;
                Ok(Some(self.instantiate(entry, &type_args, at)?))
            }
            _ => Ok(Some(entry)),
        }
    }

    fn display_value_type(&mut self, v: &Value) -> String {
        let ty = self.value_type(v);
        self.types.display(ty, &self.names)
    }
}
