// Copyright (c) 2025 knix
// All rights reserved.

use std::collections::hash_map::Entry;

use ahash::HashMapExt;
use fxhash::FxHashMap;
use itertools::Itertools;
use log::{debug, trace};

use crate::env::EnvId;
use crate::names::{At, Name};
use crate::types::{SymbolicType, Type, TypeId};
use crate::values::{
    Callable, CallableId, ClosureFn, ErrorKind, EvalResult, GenericDef, MethodFn, Runtime,
    StaticParam, StaticParamKind, TypeExpr,
};
use crate::{SV4, failf};

impl Runtime {
    /// Specialize a generic under concrete type arguments. Memoized by the
    /// exact argument list: repeated instantiation returns the same
    /// CallableId, and dispatch relies on that identity.
    pub fn instantiate(
        &mut self,
        g: CallableId,
        type_args: &[TypeId],
        at: At,
    ) -> EvalResult<CallableId> {
        let (env, underlying, hit) = match self.callables.get(g) {
            Callable::Generic(generic) => {
                (generic.env, generic.underlying.clone(), generic.memo.get(type_args).copied())
            }
            other => {
                return failf!(ErrorKind::Bug, at, "cannot instantiate a {}", other.kind_name());
            }
        };
        if let Some(inst) = hit {
            trace!("instantiation memo hit for `{}`", self.names.str(self.as_method_name(g)));
            return Ok(inst);
        }
        let statics = self.static_params_of(&underlying);
        if type_args.len() != statics.len() {
            return failf!(
                ErrorKind::Arity,
                at,
                "`{}` takes {} static parameters [{}], got {} type arguments [{}]",
                self.names.str(self.as_method_name(g)),
                statics.len(),
                statics.iter().map(|sp| self.names.str(sp.name)).join(", "),
                type_args.len(),
                type_args.iter().map(|&t| self.types.display(t, &self.names)).join(", ")
            );
        }
        let inst_env = self.envs.extend_at(env, at);
        for (sp, &arg) in statics.iter().zip(type_args) {
            self.envs.put_type(inst_env, sp.name, arg);
        }
        // Bounds are checked after all parameters are bound so F-bounded
        // constraints can mention sibling parameters
        for (sp, &arg) in statics.iter().zip(type_args) {
            for bound in &sp.bounds {
                let bound_id = self.resolve_type_expr(inst_env, bound, at)?;
                if !self.types.subtype_of(arg, bound_id) {
                    return failf!(
                        ErrorKind::TypeMismatch,
                        at,
                        "type argument {} for `{}` does not satisfy bound {}",
                        self.types.display(arg, &self.names),
                        self.names.str(sp.name),
                        self.types.display(bound_id, &self.names)
                    );
                }
            }
        }
        let inst = self.build_instance(&underlying, inst_env, type_args, at)?;
        self.counters.instantiations_computed += 1;
        debug!(
            "instantiated `{}` with [{}]",
            self.names.str(self.as_method_name(g)),
            type_args.iter().map(|&t| self.types.display(t, &self.names)).join(", ")
        );
        // Publish if absent: a re-entrant instantiation during construction
        // may have gotten there first, in which case ours is discarded
        let Callable::Generic(generic) = self.callables.get_mut(g) else {
            return failf!(ErrorKind::Bug, at, "generic changed kind mid-instantiation");
        };
        match generic.memo.entry(type_args.to_vec()) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(v) => {
                v.insert(inst);
                Ok(inst)
            }
        }
    }

    fn static_params_of(&self, underlying: &GenericDef) -> Vec<StaticParam> {
        match underlying {
            GenericDef::Fn { def, .. } => def.static_params.clone(),
            GenericDef::Object(decl) => decl.static_params.clone(),
        }
    }

    fn build_instance(
        &mut self,
        underlying: &GenericDef,
        inst_env: EnvId,
        type_args: &[TypeId],
        at: At,
    ) -> EvalResult<CallableId> {
        match underlying {
            GenericDef::Fn { def, method: None } => {
                let id = self.callables.add(Callable::Closure(ClosureFn {
                    env: inst_env,
                    def: def.clone(),
                    inst_args: Some(type_args.to_vec()),
                    sig: None,
                }));
                self.finish_initializing(id, at)?;
                Ok(id)
            }
            GenericDef::Fn { def, method: Some(info) } => {
                let id = self.callables.add(Callable::Method(MethodFn {
                    env: inst_env,
                    def: def.clone(),
                    definer: info.definer,
                    self_index: info.self_index,
                    inst_args: Some(type_args.to_vec()),
                    sig: None,
                }));
                self.finish_initializing(id, at)?;
                Ok(id)
            }
            GenericDef::Object(decl) => {
                self.instantiate_object(decl.clone(), inst_env, Some(type_args.to_vec()), at)
            }
        }
    }

    /// The placeholder-typed instance used by the overload consistency
    /// checker. Placeholders live in a disposable env layered over the
    /// generic's own scope and are created fresh per generic, so two
    /// generics' type variables can never observe each other.
    pub fn symbolic_instantiation(&mut self, g: CallableId, at: At) -> EvalResult<CallableId> {
        let (env, underlying, cached) = match self.callables.get(g) {
            Callable::Generic(generic) => {
                (generic.env, generic.underlying.clone(), generic.symbolic)
            }
            other => {
                return failf!(
                    ErrorKind::Bug,
                    at,
                    "symbolic instantiation of a {}",
                    other.kind_name()
                );
            }
        };
        if let Some(s) = cached {
            return Ok(s);
        }
        let statics = self.static_params_of(&underlying);
        let inst_env = self.envs.extend_at(env, at);
        let mut args = Vec::with_capacity(statics.len());
        for sp in &statics {
            let tid = self.make_placeholder(inst_env, sp, g.as_u32(), at)?;
            self.envs.put_type(inst_env, sp.name, tid);
            args.push(tid);
        }
        let inst = self.build_instance(&underlying, inst_env, &args, at)?;
        let Callable::Generic(generic) = self.callables.get_mut(g) else {
            return failf!(ErrorKind::Bug, at, "generic changed kind mid-instantiation");
        };
        match generic.symbolic {
            Some(existing) => Ok(existing),
            None => {
                generic.symbolic = Some(inst);
                Ok(inst)
            }
        }
    }

    /// Symbolic instantiation against a per-name shared placeholder table.
    /// Object construction groups same-named generic methods this way so
    /// their domains are comparable during overload checking. The result is
    /// disposable and never enters the generic's memo.
    pub(crate) fn symbolic_instantiation_shared(
        &mut self,
        g: CallableId,
        shared_env: EnvId,
        placeholders: &mut FxHashMap<Name, TypeId>,
        owner: u32,
        at: At,
    ) -> EvalResult<CallableId> {
        let underlying = match self.callables.get(g) {
            Callable::Generic(generic) => generic.underlying.clone(),
            other => {
                return failf!(
                    ErrorKind::Bug,
                    at,
                    "symbolic instantiation of a {}",
                    other.kind_name()
                );
            }
        };
        let statics = self.static_params_of(&underlying);
        let inst_env = self.envs.extend_at(shared_env, at);
        let mut args = Vec::with_capacity(statics.len());
        for sp in &statics {
            let tid = match placeholders.get(&sp.name) {
                Some(&t) => t,
                None => {
                    let t = self.make_placeholder(inst_env, sp, owner, at)?;
                    placeholders.insert(sp.name, t);
                    t
                }
            };
            self.envs.put_type(inst_env, sp.name, tid);
            args.push(tid);
        }
        self.build_instance(&underlying, inst_env, &args, at)
    }

    fn make_placeholder(
        &mut self,
        inst_env: EnvId,
        sp: &StaticParam,
        owner: u32,
        at: At,
    ) -> EvalResult<TypeId> {
        match sp.kind {
            StaticParamKind::Type => {
                let mut bounds: SV4<TypeId> = SV4::new();
                for b in &sp.bounds {
                    bounds.push(self.resolve_type_expr(inst_env, b, at)?);
                }
                Ok(self.types.add(Type::Symbolic(SymbolicType { name: sp.name, bounds, owner })))
            }
            StaticParamKind::Nat => Ok(self.types.add(Type::SymNat(sp.name))),
            StaticParamKind::Bool => Ok(self.types.add(Type::SymBool(sp.name))),
            StaticParamKind::Op => Ok(self.types.add(Type::SymOp(sp.name))),
        }
    }

    /// Derive concrete type arguments from the runtime types of a call's
    /// actual arguments. Failure is UnificationFailure, which dispatch
    /// treats as "this candidate does not apply".
    pub fn infer_instantiation(
        &mut self,
        g: CallableId,
        arg_types: &[TypeId],
        at: At,
    ) -> EvalResult<Vec<TypeId>> {
        let (env, underlying) = match self.callables.get(g) {
            Callable::Generic(generic) => (generic.env, generic.underlying.clone()),
            other => {
                return failf!(ErrorKind::Bug, at, "cannot infer against a {}", other.kind_name());
            }
        };
        let GenericDef::Fn { def, .. } = &underlying else {
            return failf!(
                ErrorKind::UnificationFailure,
                at,
                "generic object `{}` requires explicit type arguments",
                self.names.str(self.as_method_name(g))
            );
        };
        let def = def.clone();
        let has_rest = matches!(def.params.last().map(|p| &p.ty), Some(TypeExpr::Rest(_)));
        let fixed = def.params.len() - has_rest as usize;
        if !has_rest && arg_types.len() != def.params.len() {
            return failf!(
                ErrorKind::UnificationFailure,
                at,
                "`{}` takes {} arguments, got {}",
                self.names.str(def.name),
                def.params.len(),
                arg_types.len()
            );
        }
        if has_rest && arg_types.len() < fixed {
            return failf!(
                ErrorKind::UnificationFailure,
                at,
                "`{}` takes at least {} arguments, got {}",
                self.names.str(def.name),
                fixed,
                arg_types.len()
            );
        }
        let static_names: SV4<Name> = def.static_params.iter().map(|sp| sp.name).collect();
        let mut subst: FxHashMap<Name, TypeId> = FxHashMap::new();
        for (i, &actual) in arg_types.iter().enumerate() {
            let pe = if i < fixed {
                &def.params[i].ty
            } else {
                let TypeExpr::Rest(inner) = &def.params[fixed].ty else {
                    return failf!(ErrorKind::Bug, at, "rest parameter lost its marker");
                };
                inner.as_ref()
            };
            self.unify(env, pe, actual, &static_names, &mut subst, at)?;
        }
        let mut out = Vec::with_capacity(def.static_params.len());
        for sp in &def.static_params {
            match subst.get(&sp.name) {
                Some(&t) => out.push(t),
                None => {
                    return failf!(
                        ErrorKind::UnificationFailure,
                        at,
                        "could not infer static parameter `{}` of `{}` from argument types",
                        self.names.str(sp.name),
                        self.names.str(def.name)
                    );
                }
            }
        }
        Ok(out)
    }

    fn unify(
        &mut self,
        env: EnvId,
        pe: &TypeExpr,
        actual: TypeId,
        statics: &SV4<Name>,
        subst: &mut FxHashMap<Name, TypeId>,
        at: At,
    ) -> EvalResult<()> {
        match pe {
            TypeExpr::Named(n) if statics.contains(n) => match subst.get(n) {
                None => {
                    subst.insert(*n, actual);
                    Ok(())
                }
                Some(&prev) if prev == actual || self.types.subtype_of(actual, prev) => Ok(()),
                Some(&prev) if self.types.subtype_of(prev, actual) => {
                    // Widen to the join of the observed argument types
                    subst.insert(*n, actual);
                    Ok(())
                }
                Some(&prev) => failf!(
                    ErrorKind::UnificationFailure,
                    at,
                    "conflicting bindings for `{}`: {} vs {}",
                    self.names.str(*n),
                    self.types.display(prev, &self.names),
                    self.types.display(actual, &self.names)
                ),
            },
            TypeExpr::Named(_) | TypeExpr::Concrete(_) => {
                let formal = self.resolve_type_expr(env, pe, at)?;
                if self.types.type_match(actual, formal) {
                    Ok(())
                } else {
                    failf!(
                        ErrorKind::UnificationFailure,
                        at,
                        "argument type {} does not match {}",
                        self.types.display(actual, &self.names),
                        self.types.display(formal, &self.names)
                    )
                }
            }
            TypeExpr::Tuple(elems) => match self.types.get(actual) {
                Type::Tuple(xs) if xs.len() == elems.len() => {
                    let xs = xs.clone();
                    for (e, &x) in elems.iter().zip(xs.iter()) {
                        self.unify(env, e, x, statics, subst, at)?;
                    }
                    Ok(())
                }
                _ => failf!(
                    ErrorKind::UnificationFailure,
                    at,
                    "expected a {}-tuple, got {}",
                    elems.len(),
                    self.types.display(actual, &self.names)
                ),
            },
            TypeExpr::Rest(inner) => self.unify(env, inner, actual, statics, subst, at),
        }
    }
}
