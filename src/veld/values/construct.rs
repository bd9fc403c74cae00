// Copyright (c) 2025 knix
// All rights reserved.

use std::collections::hash_map::Entry;
use std::rc::Rc;

use ahash::HashMapExt;
use fxhash::FxHashMap;
use log::{debug, trace};
use smallvec::smallvec;

use crate::env::EnvId;
use crate::names::{At, Name};
use crate::types::{NominalKind, TypeId};
use crate::values::{
    Body, Callable, CallableId, ErrorKind, EvalResult, FnDef, GenericDef, GenericFn, MethodTable,
    ObjectCtor, ObjectDecl, ObjectInstance, Runtime, TraitDecl, Value, is_binding_failure,
};
use crate::{SV4, bugf, failf};

/// One surviving (signature, declarer) entry of the linearization walk.
struct Recorded {
    declarer: TypeId,
    /// What gets bound into the table: the original member, generic or not
    bind: CallableId,
    is_abstract: bool,
}

impl Runtime {
    pub fn declare_trait(&mut self, decl: TraitDecl) -> EvalResult<TypeId> {
        let at = decl.at;
        let global = self.envs.global;
        let mut extends: SV4<TypeId> = smallvec![];
        for te in &decl.extends {
            extends.push(self.resolve_type_expr(global, te, at)?);
        }
        let mut excludes: SV4<TypeId> = smallvec![];
        for te in &decl.excludes {
            excludes.push(self.resolve_type_expr(global, te, at)?);
        }
        let tid = self.types.add_nominal(decl.name, NominalKind::Trait, extends, excludes, None);
        self.envs.put_type(global, decl.name, tid);
        self.declare_members(tid, &decl.methods, global, at)?;
        Ok(tid)
    }

    /// Evaluate a type's locally-declared methods into its member frame.
    /// Functional methods (explicit positional self) are additionally bound
    /// by bare name in the enclosing scope so value-level overload dispatch
    /// can see them.
    fn declare_members(
        &mut self,
        definer: TypeId,
        methods: &[Rc<FnDef>],
        lexical: EnvId,
        at: At,
    ) -> EvalResult<EnvId> {
        let member_env = self.envs.extend_at(lexical, at);
        self.members.insert(definer, member_env);
        for def in methods {
            let self_index = def
                .params
                .iter()
                .position(|p| p.name == self.names.b.self_)
                .map(|i| i as u32);
            let f = self.new_method(member_env, def.clone(), definer, self_index)?;
            self.bind_callable(member_env, def.name, f, def.at)?;
            if self_index.is_some() {
                self.bind_callable(lexical, def.name, f, def.at)?;
            }
        }
        Ok(member_env)
    }

    /// Top-level object declaration. Generic objects become generic
    /// callables whose instantiation produces a concrete type and ctor.
    pub fn declare_object(&mut self, decl: ObjectDecl) -> EvalResult<CallableId> {
        let at = decl.at;
        let global = self.envs.global;
        let decl = Rc::new(decl);
        if !decl.static_params.is_empty() {
            let name = decl.name;
            let g = self.callables.add(Callable::Generic(GenericFn {
                env: global,
                underlying: GenericDef::Object(decl),
                memo: FxHashMap::new(),
                symbolic: None,
            }));
            self.envs.put_value(global, name, Value::Fn(g));
            return Ok(g);
        }
        let name = decl.name;
        let ctor = self.instantiate_object(decl, global, None, at)?;
        self.envs.put_value(global, name, Value::Fn(ctor));
        Ok(ctor)
    }

    /// Create the concrete type and constructor for an object declaration,
    /// in the given (possibly generic-instantiation) environment.
    pub(crate) fn instantiate_object(
        &mut self,
        decl: Rc<ObjectDecl>,
        env: EnvId,
        inst_args: Option<Vec<TypeId>>,
        at: At,
    ) -> EvalResult<CallableId> {
        let mut extends: SV4<TypeId> = smallvec![];
        for te in &decl.extends {
            extends.push(self.resolve_type_expr(env, te, at)?);
        }
        let mut excludes: SV4<TypeId> = smallvec![];
        for te in &decl.excludes {
            excludes.push(self.resolve_type_expr(env, te, at)?);
        }
        let tid = self.types.add_nominal(
            decl.name,
            NominalKind::Object,
            extends,
            excludes,
            inst_args.clone(),
        );
        self.envs.put_type(env, decl.name, tid);
        self.declare_members(tid, &decl.methods, env, at)?;
        let ctor = self.callables.add(Callable::Ctor(ObjectCtor {
            env,
            self_type: tid,
            decl,
            inst_args,
            table: None,
            init_error: None,
            sig: None,
        }));
        self.finish_initializing(ctor, at)?;
        self.ctor_of.insert(tid, ctor);
        Ok(ctor)
    }

    pub fn ctor_self_type(&self, ctor: CallableId) -> Option<TypeId> {
        match self.callables.get(ctor) {
            Callable::Ctor(c) => Some(c.self_type),
            _ => None,
        }
    }

    /// The per-type method table, built on first demand and shared by every
    /// instance afterwards. Failures are permanent: the first error is
    /// stored and replayed on every retry.
    pub(crate) fn ensure_method_table(
        &mut self,
        ctor: CallableId,
        at: At,
    ) -> EvalResult<MethodTable> {
        let (self_type, env) = match self.callables.get(ctor) {
            Callable::Ctor(c) => {
                if let Some(t) = &c.table {
                    return Ok(t.clone());
                }
                if let Some(e) = &c.init_error {
                    return Err(e.clone());
                }
                (c.self_type, c.env)
            }
            other => return bugf!(at, "ensure_method_table on a {}", other.kind_name()),
        };
        let result = self.build_method_table(self_type, env, at);
        let Callable::Ctor(c) = self.callables.get_mut(ctor) else {
            return bugf!(at, "constructor changed kind mid-build");
        };
        match result {
            Ok(table) => {
                c.table = Some(table.clone());
                Ok(table)
            }
            Err(e) => {
                c.init_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn build_method_table(
        &mut self,
        self_type: TypeId,
        lexical_env: EnvId,
        at: At,
    ) -> EvalResult<MethodTable> {
        let lin = self.types.transitive_extends(self_type);
        debug!(
            "building method table for {} ({} types in linearization)",
            self.types.display(self_type, &self.names),
            lin.len()
        );

        // Same-named generic methods get one shared symbolic instantiation
        // so the overloading checks below can compare their domains.
        // Accumulated over the lattice in reverse topological order.
        let shared_env = self.envs.extend_at(lexical_env, at);
        let mut shared_placeholders: FxHashMap<Name, FxHashMap<Name, TypeId>> = FxHashMap::new();
        let mut symbolic_of: FxHashMap<CallableId, CallableId> = FxHashMap::new();
        for &t in lin.iter().rev() {
            let Some(&menv) = self.members.get(&t) else { continue };
            for name in self.envs.youngest_names(menv) {
                let Some(Value::Fn(f)) = self.envs.get_leaf_value(menv, name) else { continue };
                for member in self.explode_member(f) {
                    if !matches!(self.callables.get(member), Callable::Generic(_)) {
                        continue;
                    }
                    if symbolic_of.contains_key(&member) {
                        continue;
                    }
                    let placeholders = shared_placeholders.entry(name).or_default();
                    let mut ph = std::mem::take(placeholders);
                    let s = self.symbolic_instantiation_shared(
                        member,
                        shared_env,
                        &mut ph,
                        member.as_u32(),
                        at,
                    )?;
                    *shared_placeholders.entry(name).or_default() = ph;
                    symbolic_of.insert(member, s);
                }
            }
        }

        // Walk the linearization object-first; the first definition of a
        // signature wins, so a subtype's override suppresses its supertrait's
        let mut sig_owner: FxHashMap<(Name, Vec<TypeId>), Recorded> = FxHashMap::new();
        let mut order: Vec<(Name, Vec<TypeId>)> = Vec::new();
        for &t in lin.iter() {
            let Some(&menv) = self.members.get(&t) else { continue };
            for name in self.envs.youngest_names(menv) {
                let Some(Value::Fn(f)) = self.envs.get_leaf_value(menv, name) else { continue };
                for member in self.explode_member(f) {
                    let compare = match symbolic_of.get(&member) {
                        Some(&s) => s,
                        None => member,
                    };
                    let mut domain = self.get_domain(compare, at)?;
                    // A self slot never distinguishes an override; fold it to
                    // the constructed type so `m(self: Sub)` suppresses
                    // `m(self: Super)`
                    if let Some(i) = self.self_index_of(compare) {
                        let i = i as usize;
                        if i < domain.len() {
                            domain[i] = self_type;
                        }
                    }
                    let is_abstract = self.callable_is_abstract(member);
                    let key = (name, domain);
                    match sig_owner.entry(key) {
                        Entry::Occupied(_) => {
                            trace!(
                                "`{}` from {} overridden closer to {}",
                                self.names.str(name),
                                self.types.display(t, &self.names),
                                self.types.display(self_type, &self.names)
                            );
                        }
                        Entry::Vacant(v) => {
                            order.push(v.key().clone());
                            v.insert(Recorded { declarer: t, bind: member, is_abstract });
                        }
                    }
                }
            }
        }

        // Abstract completeness. A surviving abstract entry means no
        // same-signature concrete definition exists anywhere closer.
        for key in &order {
            let rec = &sig_owner[key];
            if !rec.is_abstract {
                continue;
            }
            let method = self.names.str(key.0).to_string();
            let object = self.types.display(self_type, &self.names);
            let declarer = self.types.display(rec.declarer, &self.names);
            let wanted = self.types.display_domain(&key.1, &self.names);
            let near_miss = order
                .iter()
                .find(|k| k.0 == key.0 && !sig_owner[*k].is_abstract)
                .map(|k| k.1.clone());
            return match near_miss {
                Some(found) => failf!(
                    ErrorKind::MissingAbstractMethod,
                    at,
                    "object {object} implements `{method}` only with non-matching signature {}; abstract method declared by {declarer} requires {wanted}",
                    self.types.display_domain(&found, &self.names)
                ),
                None => failf!(
                    ErrorKind::MissingAbstractMethod,
                    at,
                    "object {object} does not implement abstract method `{method}` declared by {declarer}"
                ),
            };
        }

        // Regroup survivors per name; multi-signature names become overload
        // sets finalized inside the object's own namespace
        let mut group_order: Vec<Name> = Vec::new();
        let mut groups: FxHashMap<Name, Vec<CallableId>> = FxHashMap::new();
        for key in &order {
            let rec = &sig_owner[key];
            let group = groups.entry(key.0).or_default();
            if group.is_empty() {
                group_order.push(key.0);
            }
            if !group.contains(&rec.bind) {
                group.push(rec.bind);
            }
        }
        let methods_env = self.envs.extend_at(lexical_env, at);
        let mut bindings: Vec<(Name, CallableId)> = Vec::with_capacity(group_order.len());
        for name in group_order {
            let items = &groups[&name];
            let bound = if items.len() == 1 {
                items[0]
            } else {
                let set = self.new_overload_set(name, at);
                for &item in items.iter() {
                    self.add_overload(set, item, at)?;
                }
                self.finalize_overloads(set, at)?;
                set
            };
            self.envs.put_value(methods_env, name, Value::Fn(bound));
            bindings.push((name, bound));
        }
        bindings.sort_by_key(|(n, _)| *n);
        self.envs.bless(methods_env);
        Ok(MethodTable { methods_env, bindings })
    }

    fn self_index_of(&self, f: CallableId) -> Option<u32> {
        match self.callables.get(f) {
            Callable::Method(m) => m.self_index,
            Callable::Generic(g) => match &g.underlying {
                GenericDef::Fn { method: Some(info), .. } => info.self_index,
                _ => None,
            },
            _ => None,
        }
    }

    fn explode_member(&self, f: CallableId) -> SV4<CallableId> {
        match self.callables.get(f) {
            Callable::Overloaded(o) => o.members.iter().copied().collect(),
            _ => smallvec![f],
        }
    }

    fn callable_is_abstract(&self, f: CallableId) -> bool {
        let def = match self.callables.get(f) {
            Callable::Closure(c) => &c.def,
            Callable::Method(m) => &m.def,
            Callable::Generic(g) => match &g.underlying {
                GenericDef::Fn { def, .. } => def,
                GenericDef::Object(_) => return false,
            },
            _ => return false,
        };
        matches!(def.body, Body::Abstract)
    }

    /// Construct an instance: cached method table, fresh field frame, secret
    /// self binding injected before field initializers run in definition
    /// order. Forward references among initializers fail at runtime.
    pub(crate) fn apply_constructor(
        &mut self,
        ctor: CallableId,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        let table = self.ensure_method_table(ctor, at)?;
        if args.len() == 1 {
            if let Value::Tuple(elems) = &args[0] {
                let splatted: Vec<Value> = elems.iter().cloned().collect();
                return match self.construct_instance(ctor, &table, &splatted, at) {
                    Ok(v) => Ok(v),
                    Err(first) if is_binding_failure(first.kind) => {
                        match self.construct_instance(ctor, &table, args, at) {
                            Ok(v) => Ok(v),
                            Err(_) => Err(first),
                        }
                    }
                    Err(e) => Err(e),
                };
            }
        }
        self.construct_instance(ctor, &table, args, at)
    }

    fn construct_instance(
        &mut self,
        ctor: CallableId,
        table: &MethodTable,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        let (sig, decl, self_type, lexical) = match self.callables.get(ctor) {
            Callable::Ctor(c) => match &c.sig {
                Some(sig) => (sig.clone(), c.decl.clone(), c.self_type, c.env),
                None => {
                    return bugf!(
                        at,
                        "constructor `{}` invoked before initialization finished",
                        self.names.str(c.decl.name)
                    );
                }
            },
            other => return bugf!(at, "apply_constructor on a {}", other.kind_name()),
        };
        let bound = self.bind_args(&sig, args, at)?;
        let fields_env = self.envs.extend_at(table.methods_env, at);
        let oid = self.objects.add(ObjectInstance { ty: self_type, env: fields_env });
        let self_val = Value::Object(oid);
        self.envs.put_value_raw(fields_env, self.names.b.self_, self_val.clone());
        // An enclosing object's self, if any, stays reachable as `parent`
        if let Some(enclosing) = self.envs.get_value(lexical, self.names.b.self_) {
            self.envs.put_value_raw(fields_env, self.names.b.parent, enclosing);
        }
        for (param, v) in sig.params.iter().zip(bound) {
            self.envs.put_value_typed(fields_env, param.name, v, param.ty);
        }
        for fd in &decl.fields {
            let declared = self.resolve_type_expr(fields_env, &fd.ty, at)?;
            let v = self.eval_expr(fields_env, &fd.init, at)?;
            let actual = self.value_type(&v);
            if !self.types.type_match(actual, declared) {
                return failf!(
                    ErrorKind::TypeMismatch,
                    at,
                    "field `{}` of {} initialized with {}, declared {}",
                    self.names.str(fd.name),
                    self.types.display(self_type, &self.names),
                    self.types.display(actual, &self.names),
                    self.types.display(declared, &self.names)
                );
            }
            self.envs.put_value_typed(fields_env, fd.name, v, declared);
        }
        self.envs.bless(fields_env);
        Ok(self_val)
    }
}
