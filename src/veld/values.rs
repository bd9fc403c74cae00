// Copyright (c) 2025 knix
// All rights reserved.

use std::num::NonZeroU32;
use std::rc::Rc;

use ahash::HashMapExt;
use ecow::{EcoString, EcoVec};
use fxhash::FxHashMap;
use itertools::Itertools;
use log::trace;

use crate::env::{EnvId, Envs};
use crate::names::{At, Name, NamePool};
use crate::pool::Pool;
use crate::types::{
    ANY_TYPE_ID, BOOL_TYPE_ID, CHAR_TYPE_ID, RR64_TYPE_ID, STRING_TYPE_ID, TypeId, Types,
    UNIT_TYPE_ID, ZZ32_TYPE_ID, ZZ64_TYPE_ID,
};
use crate::{SV8, nz_u32_id};

pub mod construct;
pub mod dispatch;
pub mod generics;
pub mod overloads;

#[cfg(test)]
mod testkit;

#[cfg(test)]
mod overloads_test;

nz_u32_id!(CallableId);
nz_u32_id!(ObjectId);

//
// Errors
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Argument count fits no candidate signature
    Arity,
    /// An argument's runtime type fails the match against a formal
    TypeMismatch,
    /// Definition-time: two overloads cannot be ordered and no meet exists
    AmbiguousOverload,
    /// Definition-time: a declared abstract method has no concrete realizer
    MissingAbstractMethod,
    /// Internal invariant violation; indicates an earlier-phase defect
    Bug,
    /// Generic inference from argument types failed
    UnificationFailure,
    NoSuchMethod,
    UnexpectedValue,
    /// No overload member matched the actual argument types
    DispatchFailure,
    UnboundName,
}

#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
    pub at: At,
    pub kind: ErrorKind,
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "eval error ({:?}) at {}: {}", self.kind, self.at, self.message)
    }
}

impl std::error::Error for EvalError {}

pub type EvalResult<A> = Result<A, EvalError>;

pub fn make_error(kind: ErrorKind, message: impl AsRef<str>, at: At) -> EvalError {
    EvalError { message: message.as_ref().to_owned(), at, kind }
}

pub fn make_fail<A>(kind: ErrorKind, message: impl AsRef<str>, at: At) -> EvalResult<A> {
    Err(make_error(kind, message, at))
}

#[macro_export]
macro_rules! errf {
    ($kind:expr, $at:expr, $($format_args:expr),* $(,)?) => {
        {
            let s: String = format!($($format_args),*);
            $crate::values::make_error($kind, &s, $at)
        }
    };
}

#[macro_export]
macro_rules! failf {
    ($kind:expr, $at:expr, $($format_args:expr),* $(,)?) => {
        {
            let s: String = format!($($format_args),*);
            $crate::values::make_fail($kind, &s, $at)
        }
    };
}

/// Invariant violations: these mean the engine itself is wrong, never the
/// evaluated program. They propagate and abort, never recover.
#[macro_export]
macro_rules! bugf {
    ($at:expr, $($format_args:expr),* $(,)?) => {
        {
            let s: String = format!($($format_args),*);
            $crate::values::make_fail($crate::values::ErrorKind::Bug, &s, $at)
        }
    };
}

pub fn write_error(w: &mut impl std::io::Write, e: &EvalError) -> std::io::Result<()> {
    use colored::Colorize;
    let kind = format!("{:?}", e.kind);
    writeln!(w, "{} [{}] at {}: {}", "error".red().bold(), kind.yellow(), e.at, e.message)
}

//
// Runtime values
//

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Char(char),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Str(EcoString),
    Tuple(EcoVec<Value>),
    Object(ObjectId),
    /// A value carried at an asserted supertype; dispatch walks the
    /// asserted type's extends chain instead of the leaf table
    AsIf { object: ObjectId, as_type: TypeId },
    Fn(CallableId),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "boolean",
            Value::Char(_) => "char",
            Value::Int32(_) => "ZZ32",
            Value::Int64(_) => "ZZ64",
            Value::Float64(_) => "RR64",
            Value::Str(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::Object(_) => "object",
            Value::AsIf { .. } => "object",
            Value::Fn(_) => "fn",
        }
    }
}

pub struct ObjectInstance {
    pub ty: TypeId,
    pub env: EnvId,
}

//
// Parameters and signatures
//

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Name,
    pub ty: TypeId,
    pub mutable: bool,
}

/// The latch payload: bound exactly once by finish_initializing, immutable
/// after.
#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<Param>,
    pub return_type: TypeId,
}

impl Signature {
    pub fn domain(&self) -> Vec<TypeId> {
        self.params.iter().map(|p| p.ty).collect()
    }
}

//
// Definitions (produced by the excluded front end)
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticParamKind {
    Type,
    Nat,
    Bool,
    Op,
}

#[derive(Debug, Clone)]
pub struct StaticParam {
    pub name: Name,
    pub kind: StaticParamKind,
    pub bounds: Vec<TypeExpr>,
}

#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: Name,
    pub ty: TypeExpr,
    pub mutable: bool,
}

/// Unresolved type syntax. Resolution against an environment happens at
/// finish-initializing time; that is what lets instantiation rewrite a
/// generic's signature by rebinding the static parameter names.
#[derive(Debug, Clone)]
pub enum TypeExpr {
    Concrete(TypeId),
    Named(Name),
    Tuple(Vec<TypeExpr>),
    Rest(Box<TypeExpr>),
}

pub type NativeImpl = fn(&mut Runtime, &[Value], At) -> EvalResult<Value>;

#[derive(Debug, Clone)]
pub enum Body {
    Expr(Rc<Expr>),
    Native(NativeImpl),
    Abstract,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Value),
    Var(Name),
    Tuple(Vec<Expr>),
    Call { callee: Box<Expr>, args: Vec<Expr> },
    MethodCall { receiver: Box<Expr>, method: Name, args: Vec<Expr> },
}

#[derive(Debug, Clone)]
pub struct FnDef {
    pub name: Name,
    pub static_params: Vec<StaticParam>,
    pub params: Vec<ParamDecl>,
    pub return_type: TypeExpr,
    pub body: Body,
    pub at: At,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: Name,
    pub ty: TypeExpr,
    pub init: Rc<Expr>,
}

#[derive(Debug, Clone)]
pub struct TraitDecl {
    pub name: Name,
    pub extends: Vec<TypeExpr>,
    pub excludes: Vec<TypeExpr>,
    pub methods: Vec<Rc<FnDef>>,
    pub at: At,
}

#[derive(Debug, Clone)]
pub struct ObjectDecl {
    pub name: Name,
    pub static_params: Vec<StaticParam>,
    pub extends: Vec<TypeExpr>,
    pub excludes: Vec<TypeExpr>,
    /// Constructor value parameters; bound as fields from the call's args
    pub params: Vec<ParamDecl>,
    /// Initialized fields, evaluated in definition order
    pub fields: Vec<FieldDef>,
    pub methods: Vec<Rc<FnDef>>,
    pub at: At,
}

//
// Callables
//

#[derive(Debug, Clone)]
pub struct ClosureFn {
    pub env: EnvId,
    pub def: Rc<FnDef>,
    /// Non-None only for instances born of generic instantiation
    pub inst_args: Option<Vec<TypeId>>,
    pub sig: Option<Signature>,
}

#[derive(Debug, Clone)]
pub struct MethodFn {
    pub env: EnvId,
    pub def: Rc<FnDef>,
    /// The trait or object that declared this method
    pub definer: TypeId,
    /// None for dotted methods; Some(i) when self occupies positional
    /// slot i (a functional method)
    pub self_index: Option<u32>,
    pub inst_args: Option<Vec<TypeId>>,
    pub sig: Option<Signature>,
}

#[derive(Debug, Clone)]
pub struct NativeFn {
    pub env: EnvId,
    pub def: Rc<FnDef>,
    pub sig: Option<Signature>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub definer: TypeId,
    pub self_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum GenericDef {
    Fn { def: Rc<FnDef>, method: Option<MethodInfo> },
    Object(Rc<ObjectDecl>),
}

#[derive(Debug)]
pub struct GenericFn {
    pub env: EnvId,
    pub underlying: GenericDef,
    /// Keyed by structural equality of the type-argument list; hits return
    /// the same CallableId, which is the identity sharing dispatch relies on
    pub memo: FxHashMap<Vec<TypeId>, CallableId>,
    /// Placeholder-typed instance used only for consistency checking
    pub symbolic: Option<CallableId>,
}

impl GenericFn {
    pub fn static_params(&self) -> &[StaticParam] {
        match &self.underlying {
            GenericDef::Fn { def, .. } => &def.static_params,
            GenericDef::Object(decl) => &decl.static_params,
        }
    }

    pub fn name(&self) -> Name {
        match &self.underlying {
            GenericDef::Fn { def, .. } => def.name,
            GenericDef::Object(decl) => decl.name,
        }
    }
}

/// Consistency-check snapshot of one accepted overload member. For generic
/// members the domain comes from the symbolic instantiation.
#[derive(Debug, Clone)]
pub struct Overload {
    pub member: CallableId,
    pub single: CallableId,
    pub domain: Vec<TypeId>,
    pub return_type: TypeId,
    pub self_index: Option<u32>,
    pub symbolic: bool,
}

#[derive(Debug)]
pub struct OverloadSet {
    pub name: Name,
    pub at: At,
    pub members: Vec<CallableId>,
    /// How many of `members` have passed pairwise checking
    pub validated: usize,
    pub checked: Vec<Overload>,
    /// Correct by construction; the pairwise checker is skipped entirely
    pub blessed: bool,
    pub cache: FxHashMap<SV8<TypeId>, CallableId>,
}

impl OverloadSet {
    pub fn is_finished(&self) -> bool {
        self.blessed || self.validated == self.members.len()
    }
}

#[derive(Debug, Clone)]
pub struct MethodTable {
    /// Blessed after construction; shared by every instance of the type
    pub methods_env: EnvId,
    pub bindings: Vec<(Name, CallableId)>,
}

impl MethodTable {
    pub fn lookup(&self, name: Name) -> Option<CallableId> {
        self.bindings.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
    }
}

#[derive(Debug)]
pub struct ObjectCtor {
    pub env: EnvId,
    pub self_type: TypeId,
    pub decl: Rc<ObjectDecl>,
    pub inst_args: Option<Vec<TypeId>>,
    /// Built on first construction, then shared forever
    pub table: Option<MethodTable>,
    /// Construction failures are permanent; replayed on every retry
    pub init_error: Option<EvalError>,
    pub sig: Option<Signature>,
}

pub enum Callable {
    Closure(ClosureFn),
    Method(MethodFn),
    Native(NativeFn),
    Generic(GenericFn),
    Overloaded(OverloadSet),
    Ctor(ObjectCtor),
}

impl Callable {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Callable::Closure(_) => "closure",
            Callable::Method(_) => "method",
            Callable::Native(_) => "native",
            Callable::Generic(_) => "generic",
            Callable::Overloaded(_) => "overload set",
            Callable::Ctor(_) => "constructor",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    /// Full candidate scans performed by overload dispatch (cache misses)
    pub dispatch_scans: u64,
    /// Generic instantiations actually computed (memo misses)
    pub instantiations_computed: u64,
}

//
// Runtime
//

pub struct Runtime {
    pub names: NamePool,
    pub types: Types,
    pub envs: Envs,
    pub callables: Pool<Callable, CallableId>,
    pub objects: Pool<ObjectInstance, ObjectId>,
    /// Declared member frame per trait/object type
    pub members: FxHashMap<TypeId, EnvId>,
    pub ctor_of: FxHashMap<TypeId, CallableId>,
    pub(crate) finalize_depth: u32,
    pub counters: Counters,
}

impl Runtime {
    pub fn make() -> Runtime {
        let names = NamePool::make();
        let types = Types::make(&names);
        let envs = Envs::make();
        let global = envs.global;
        let mut rt = Runtime {
            names,
            types,
            envs,
            callables: Pool::make_with_hint("callables", 256),
            objects: Pool::make_with_hint("objects", 256),
            members: FxHashMap::new(),
            ctor_of: FxHashMap::new(),
            finalize_depth: 0,
            counters: Counters::default(),
        };
        rt.seed_builtin_types(global);
        rt
    }

    fn seed_builtin_types(&mut self, env: EnvId) {
        let b = &self.names.b;
        let pairs = [
            (b.Any, ANY_TYPE_ID),
            (b.Unit, UNIT_TYPE_ID),
            (b.Boolean, BOOL_TYPE_ID),
            (b.Char, CHAR_TYPE_ID),
            (b.String, STRING_TYPE_ID),
            (b.Number, crate::types::NUMBER_TYPE_ID),
            (b.ZZ64, ZZ64_TYPE_ID),
            (b.ZZ32, ZZ32_TYPE_ID),
            (b.RR64, RR64_TYPE_ID),
        ];
        for (name, ty) in pairs {
            self.envs.put_type(env, name, ty);
        }
    }

    pub fn global_env(&self) -> EnvId {
        self.envs.global
    }

    //
    // Value typing
    //

    pub fn value_type(&mut self, v: &Value) -> TypeId {
        match v {
            Value::Unit => UNIT_TYPE_ID,
            Value::Bool(_) => BOOL_TYPE_ID,
            Value::Char(_) => CHAR_TYPE_ID,
            Value::Int32(_) => ZZ32_TYPE_ID,
            Value::Int64(_) => ZZ64_TYPE_ID,
            Value::Float64(_) => RR64_TYPE_ID,
            Value::Str(_) => STRING_TYPE_ID,
            Value::Tuple(elems) => {
                let elems = elems.clone();
                let mut ts = Vec::with_capacity(elems.len());
                for e in elems.iter() {
                    ts.push(self.value_type(e));
                }
                self.types.tuple(&ts)
            }
            Value::Object(oid) => self.objects.get(*oid).ty,
            Value::AsIf { as_type, .. } => *as_type,
            Value::Fn(id) => match self.signature_of(*id) {
                Some(sig) => {
                    let domain = sig.domain();
                    let ret = sig.return_type;
                    self.types.arrow(domain, ret)
                }
                None => ANY_TYPE_ID,
            },
        }
    }

    pub(crate) fn arg_types(&mut self, args: &[Value]) -> SV8<TypeId> {
        let mut out = SV8::new();
        for a in args {
            out.push(self.value_type(a));
        }
        out
    }

    pub(crate) fn signature_of(&self, f: CallableId) -> Option<&Signature> {
        match self.callables.get(f) {
            Callable::Closure(c) => c.sig.as_ref(),
            Callable::Method(m) => m.sig.as_ref(),
            Callable::Native(n) => n.sig.as_ref(),
            Callable::Ctor(c) => c.sig.as_ref(),
            Callable::Generic(_) | Callable::Overloaded(_) => None,
        }
    }

    pub fn as_method_name(&self, f: CallableId) -> Name {
        match self.callables.get(f) {
            Callable::Closure(c) => c.def.name,
            Callable::Method(m) => m.def.name,
            Callable::Native(n) => n.def.name,
            Callable::Generic(g) => g.name(),
            Callable::Overloaded(o) => o.name,
            Callable::Ctor(c) => c.decl.name,
        }
    }

    pub fn get_domain(&mut self, f: CallableId, at: At) -> EvalResult<Vec<TypeId>> {
        match self.callables.get(f) {
            Callable::Generic(_) => {
                let symbolic = self.symbolic_instantiation(f, at)?;
                self.get_domain(symbolic, at)
            }
            Callable::Overloaded(o) => {
                let name = self.names.str(o.name);
                failf!(ErrorKind::Bug, at, "overload set `{name}` has no single domain")
            }
            _ => match self.signature_of(f) {
                Some(sig) => Ok(sig.domain()),
                None => {
                    let name = self.names.str(self.as_method_name(f));
                    failf!(ErrorKind::Bug, at, "`{name}` queried before initialization finished")
                }
            },
        }
    }

    pub fn get_range(&mut self, f: CallableId, at: At) -> EvalResult<TypeId> {
        match self.callables.get(f) {
            Callable::Generic(_) => {
                let symbolic = self.symbolic_instantiation(f, at)?;
                self.get_range(symbolic, at)
            }
            Callable::Overloaded(o) => {
                let name = self.names.str(o.name);
                failf!(ErrorKind::Bug, at, "overload set `{name}` has no single range")
            }
            _ => match self.signature_of(f) {
                Some(sig) => Ok(sig.return_type),
                None => {
                    let name = self.names.str(self.as_method_name(f));
                    failf!(ErrorKind::Bug, at, "`{name}` queried before initialization finished")
                }
            },
        }
    }

    //
    // Creation and binding of callables
    //

    pub fn new_closure(&mut self, env: EnvId, def: Rc<FnDef>) -> EvalResult<CallableId> {
        if !def.static_params.is_empty() {
            let id = self.callables.add(Callable::Generic(GenericFn {
                env,
                underlying: GenericDef::Fn { def, method: None },
                memo: FxHashMap::new(),
                symbolic: None,
            }));
            return Ok(id);
        }
        let at = def.at;
        let id =
            self.callables.add(Callable::Closure(ClosureFn { env, def, inst_args: None, sig: None }));
        self.finish_initializing(id, at)?;
        Ok(id)
    }

    pub fn new_method(
        &mut self,
        env: EnvId,
        def: Rc<FnDef>,
        definer: TypeId,
        self_index: Option<u32>,
    ) -> EvalResult<CallableId> {
        if !def.static_params.is_empty() {
            let id = self.callables.add(Callable::Generic(GenericFn {
                env,
                underlying: GenericDef::Fn {
                    def,
                    method: Some(MethodInfo { definer, self_index }),
                },
                memo: FxHashMap::new(),
                symbolic: None,
            }));
            return Ok(id);
        }
        let at = def.at;
        let id = self.callables.add(Callable::Method(MethodFn {
            env,
            def,
            definer,
            self_index,
            inst_args: None,
            sig: None,
        }));
        self.finish_initializing(id, at)?;
        Ok(id)
    }

    pub fn new_native(&mut self, env: EnvId, def: Rc<FnDef>) -> EvalResult<CallableId> {
        let at = def.at;
        let id = self.callables.add(Callable::Native(NativeFn { env, def, sig: None }));
        self.finish_initializing(id, at)?;
        Ok(id)
    }

    /// Top-level definition: create the callable and bind it under its name,
    /// growing an overload set when the name is already function-bound.
    pub fn define_fn(&mut self, env: EnvId, def: Rc<FnDef>) -> EvalResult<CallableId> {
        let name = def.name;
        let at = def.at;
        let f = self.new_closure(env, def)?;
        self.bind_callable(env, name, f, at)?;
        Ok(f)
    }

    pub(crate) fn bind_callable(
        &mut self,
        env: EnvId,
        name: Name,
        f: CallableId,
        at: At,
    ) -> EvalResult<CallableId> {
        match self.envs.get_leaf_value(env, name) {
            None => {
                self.envs.put_value(env, name, Value::Fn(f));
                Ok(f)
            }
            Some(Value::Fn(existing)) => {
                let set = if matches!(self.callables.get(existing), Callable::Overloaded(_)) {
                    existing
                } else {
                    let set = self.new_overload_set(name, at);
                    self.add_overload(set, existing, at)?;
                    self.envs.put_value_raw(env, name, Value::Fn(set));
                    set
                };
                self.add_overload(set, f, at)?;
                Ok(set)
            }
            Some(other) => failf!(
                ErrorKind::UnexpectedValue,
                at,
                "`{}` is already bound to a non-function {}",
                self.names.str(name),
                other.kind_name()
            ),
        }
    }

    //
    // Finish-initializing: the one-way signature latch
    //

    pub fn finish_initializing(&mut self, f: CallableId, at: At) -> EvalResult<()> {
        let (env, def) = match self.callables.get(f) {
            Callable::Closure(c) => (c.env, c.def.clone()),
            Callable::Method(m) => (m.env, m.def.clone()),
            Callable::Native(n) => (n.env, n.def.clone()),
            Callable::Ctor(_) => return self.finish_initializing_ctor_sig(f, at),
            // Generics latch per instantiation, overload sets have no latch
            Callable::Generic(_) | Callable::Overloaded(_) => return Ok(()),
        };
        let sig = self.signature_of_def(env, &def, at)?;
        self.set_signature(f, sig, at)
    }

    fn finish_initializing_ctor_sig(&mut self, f: CallableId, at: At) -> EvalResult<()> {
        let (env, decl, self_type) = match self.callables.get(f) {
            Callable::Ctor(c) => (c.env, c.decl.clone(), c.self_type),
            _ => return bugf!(at, "not a constructor"),
        };
        let mut params = Vec::with_capacity(decl.params.len());
        for p in &decl.params {
            let ty = self.resolve_type_expr(env, &p.ty, at)?;
            params.push(Param { name: p.name, ty, mutable: p.mutable });
        }
        self.set_signature(f, Signature { params, return_type: self_type }, at)
    }

    pub(crate) fn signature_of_def(
        &mut self,
        env: EnvId,
        def: &FnDef,
        at: At,
    ) -> EvalResult<Signature> {
        let mut params = Vec::with_capacity(def.params.len());
        for (i, p) in def.params.iter().enumerate() {
            let ty = self.resolve_type_expr(env, &p.ty, at)?;
            if self.types.is_rest(ty) && i + 1 != def.params.len() {
                return bugf!(
                    at,
                    "rest parameter `{}` of `{}` must be last",
                    self.names.str(p.name),
                    self.names.str(def.name)
                );
            }
            params.push(Param { name: p.name, ty, mutable: p.mutable });
        }
        let return_type = self.resolve_type_expr(env, &def.return_type, at)?;
        Ok(Signature { params, return_type })
    }

    pub(crate) fn set_signature(
        &mut self,
        f: CallableId,
        sig: Signature,
        at: At,
    ) -> EvalResult<()> {
        let existing_ret = self.signature_of(f).map(|s| s.return_type);
        match existing_ret {
            Some(prev) if prev == sig.return_type => Ok(()),
            Some(prev) => bugf!(
                at,
                "`{}` already finished with return type {}, refusing to re-set to {}",
                self.names.str(self.as_method_name(f)),
                self.types.display(prev, &self.names),
                self.types.display(sig.return_type, &self.names)
            ),
            None => {
                let slot = match self.callables.get_mut(f) {
                    Callable::Closure(c) => &mut c.sig,
                    Callable::Method(m) => &mut m.sig,
                    Callable::Native(n) => &mut n.sig,
                    Callable::Ctor(c) => &mut c.sig,
                    _ => return bugf!(at, "callable kind has no signature latch"),
                };
                *slot = Some(sig);
                Ok(())
            }
        }
    }

    pub(crate) fn resolve_type_expr(
        &mut self,
        env: EnvId,
        te: &TypeExpr,
        at: At,
    ) -> EvalResult<TypeId> {
        match te {
            TypeExpr::Concrete(id) => Ok(*id),
            TypeExpr::Named(name) => self.envs.get_type(env, *name).ok_or_else(|| {
                errf!(ErrorKind::UnboundName, at, "unknown type `{}`", self.names.str(*name))
            }),
            TypeExpr::Tuple(elems) => {
                let mut ids = Vec::with_capacity(elems.len());
                for e in elems {
                    ids.push(self.resolve_type_expr(env, e, at)?);
                }
                Ok(self.types.tuple(&ids))
            }
            TypeExpr::Rest(inner) => {
                let elem = self.resolve_type_expr(env, inner, at)?;
                Ok(self.types.rest(elem))
            }
        }
    }

    //
    // The call protocol
    //

    pub fn apply_to_args(&mut self, f: CallableId, args: &[Value], at: At) -> EvalResult<Value> {
        match self.callables.get(f) {
            Callable::Closure(_) | Callable::Method(_) | Callable::Native(_) => {
                self.apply_with_splat(f, args, at)
            }
            Callable::Generic(_) => {
                let key = self.arg_types(args);
                let type_args = self.infer_instantiation(f, &key, at)?;
                let inst = self.instantiate(f, &type_args, at)?;
                self.apply_to_args(inst, args, at)
            }
            Callable::Overloaded(_) => self.apply_overloaded(f, args, at),
            Callable::Ctor(_) => self.apply_constructor(f, args, at),
        }
    }

    /// A single tuple argument passed where N parameters are expected is
    /// tried splatted first, then as-is; the first failure wins when both
    /// attempts fail. The protocol is definitional, not an optimization.
    fn apply_with_splat(&mut self, f: CallableId, args: &[Value], at: At) -> EvalResult<Value> {
        if args.len() == 1 {
            if let Value::Tuple(elems) = &args[0] {
                let splatted: Vec<Value> = elems.iter().cloned().collect();
                return match self.apply_single(f, &splatted, at, None) {
                    Ok(v) => Ok(v),
                    Err(first) if is_binding_failure(first.kind) => {
                        trace!("splatted call failed, retrying with raw tuple argument");
                        match self.apply_single(f, args, at, None) {
                            Ok(v) => Ok(v),
                            Err(_) => Err(first),
                        }
                    }
                    Err(e) => Err(e),
                };
            }
        }
        self.apply_single(f, args, at, None)
    }

    /// Invoke one leaf callable: bind arguments against the latched
    /// signature and run the body. `self_value` supplies the receiver for
    /// method invocations; its instance env becomes the body's base scope.
    pub(crate) fn apply_single(
        &mut self,
        f: CallableId,
        args: &[Value],
        at: At,
        self_value: Option<&Value>,
    ) -> EvalResult<Value> {
        let (sig, captured_env, def) = match self.callables.get(f) {
            Callable::Closure(c) => (c.sig.clone(), c.env, c.def.clone()),
            Callable::Method(m) => (m.sig.clone(), m.env, m.def.clone()),
            Callable::Native(n) => (n.sig.clone(), n.env, n.def.clone()),
            other => {
                return bugf!(at, "apply_single on a {}", other.kind_name());
            }
        };
        let Some(sig) = sig else {
            return bugf!(
                at,
                "`{}` invoked before initialization finished",
                self.names.str(def.name)
            );
        };
        let bound = self.bind_args(&sig, args, at)?;
        match &def.body {
            Body::Native(native) => native(self, &bound, at),
            Body::Abstract => {
                bugf!(at, "abstract method `{}` invoked directly", self.names.str(def.name))
            }
            Body::Expr(body) => {
                let base = match self_value {
                    Some(Value::Object(oid)) => self.objects.get(*oid).env,
                    Some(Value::AsIf { object, .. }) => self.objects.get(*object).env,
                    _ => captured_env,
                };
                let call_env = self.envs.extend_at(base, at);
                for (param, v) in sig.params.iter().zip(bound) {
                    self.envs.put_value_typed(call_env, param.name, v, param.ty);
                }
                if let Some(sv) = self_value {
                    self.envs.put_value_raw(call_env, self.names.b.self_, sv.clone());
                }
                let body = body.clone();
                let result = self.eval_expr(call_env, &body, at)?;
                let result_ty = self.value_type(&result);
                if !self.types.type_match(result_ty, sig.return_type) {
                    return failf!(
                        ErrorKind::TypeMismatch,
                        at,
                        "`{}` returned {}, declared {}",
                        self.names.str(def.name),
                        self.types.display(result_ty, &self.names),
                        self.types.display(sig.return_type, &self.names)
                    );
                }
                Ok(result)
            }
        }
    }

    /// Arity fixup plus per-position type checking. Trailing arguments past
    /// a rest marker are collapsed into one tuple value.
    pub(crate) fn bind_args(
        &mut self,
        sig: &Signature,
        args: &[Value],
        at: At,
    ) -> EvalResult<Vec<Value>> {
        let domain = sig.domain();
        let has_rest = self.types.domain_has_rest(&domain);
        let fixed = domain.len() - has_rest as usize;
        if !has_rest && args.len() != domain.len() {
            return failf!(
                ErrorKind::Arity,
                at,
                "expected {} arguments, got {}",
                domain.len(),
                args.len()
            );
        }
        if has_rest && args.len() < fixed {
            return failf!(
                ErrorKind::Arity,
                at,
                "expected at least {} arguments, got {}",
                fixed,
                args.len()
            );
        }
        let mut bound = Vec::with_capacity(domain.len());
        for i in 0..fixed {
            let actual = self.value_type(&args[i]);
            if !self.types.type_match(actual, domain[i]) {
                return failf!(
                    ErrorKind::TypeMismatch,
                    at,
                    "argument {} has type {}, expected {}",
                    i + 1,
                    self.types.display(actual, &self.names),
                    self.types.display(domain[i], &self.names)
                );
            }
            bound.push(args[i].clone());
        }
        if has_rest {
            let Some(elem) = self.types.rest_elem(domain[fixed]) else {
                return bugf!(at, "malformed rest marker in domain");
            };
            let mut tail = EcoVec::with_capacity(args.len() - fixed);
            for (i, a) in args[fixed..].iter().enumerate() {
                let actual = self.value_type(a);
                if !self.types.type_match(actual, elem) {
                    return failf!(
                        ErrorKind::TypeMismatch,
                        at,
                        "rest argument {} has type {}, expected {}",
                        fixed + i + 1,
                        self.types.display(actual, &self.names),
                        self.types.display(elem, &self.names)
                    );
                }
                tail.push(a.clone());
            }
            bound.push(Value::Tuple(tail));
        }
        Ok(bound)
    }

    /// Candidate-skip variant of the arity/type check used by dispatch.
    pub(crate) fn args_match_domain(&self, domain: &[TypeId], arg_types: &[TypeId]) -> bool {
        let has_rest = self.types.domain_has_rest(domain);
        let fixed = domain.len() - has_rest as usize;
        if !has_rest && arg_types.len() != domain.len() {
            return false;
        }
        if has_rest && arg_types.len() < fixed {
            return false;
        }
        arg_types.iter().enumerate().all(|(i, &actual)| match self.types.clamped(domain, i) {
            Some(formal) => self.types.type_match(actual, formal),
            None => false,
        })
    }

    //
    // The body language
    //

    pub fn eval_expr(&mut self, env: EnvId, expr: &Expr, at: At) -> EvalResult<Value> {
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Var(name) => self.envs.get_value(env, *name).ok_or_else(|| {
                errf!(ErrorKind::UnboundName, at, "unbound name `{}`", self.names.str(*name))
            }),
            Expr::Tuple(elems) => {
                let mut out = EcoVec::with_capacity(elems.len());
                for e in elems {
                    out.push(self.eval_expr(env, e, at)?);
                }
                Ok(Value::Tuple(out))
            }
            Expr::Call { callee, args } => {
                let f = self.eval_expr(env, callee, at)?;
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.eval_expr(env, a, at)?);
                }
                match f {
                    Value::Fn(id) => self.apply_to_args(id, &vals, at),
                    other => failf!(
                        ErrorKind::UnexpectedValue,
                        at,
                        "cannot call a non-function {}",
                        other.kind_name()
                    ),
                }
            }
            Expr::MethodCall { receiver, method, args } => {
                let r = self.eval_expr(env, receiver, at)?;
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.eval_expr(env, a, at)?);
                }
                self.invoke_method(&r, *method, &vals, at)
            }
        }
    }

    //
    // Type application
    //

    pub fn type_apply(
        &mut self,
        f: CallableId,
        type_args: &[TypeId],
        at: At,
    ) -> EvalResult<CallableId> {
        match self.callables.get(f) {
            Callable::Generic(_) => self.instantiate(f, type_args, at),
            other => {
                let name = self.names.str(self.as_method_name(f)).to_string();
                failf!(
                    ErrorKind::TypeMismatch,
                    at,
                    "`{name}` is a {}, not a generic; cannot apply type arguments [{}]",
                    other.kind_name(),
                    type_args.iter().map(|&t| self.types.display(t, &self.names)).join(", ")
                )
            }
        }
    }
}

pub(crate) fn is_binding_failure(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Arity | ErrorKind::TypeMismatch | ErrorKind::UnificationFailure)
}
