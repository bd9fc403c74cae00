// Copyright (c) 2025 knix
// All rights reserved.

//! Shared builders for the evaluator tests. Everything here constructs the
//! front-end-shaped inputs (FnDef, TraitDecl, ObjectDecl) by hand.

use std::rc::Rc;

use ecow::EcoString;

use crate::names::{At, Name};
use crate::types::TypeId;
use crate::values::{
    Body, CallableId, Expr, FieldDef, FnDef, ObjectDecl, ParamDecl, Runtime, StaticParam,
    StaticParamKind, TraitDecl, TypeExpr, Value,
};

pub const HERE: At = At(7);

pub fn rt() -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::make()
}

pub fn pd(rt: &mut Runtime, name: &str, ty: TypeExpr) -> ParamDecl {
    ParamDecl { name: rt.names.intern(name), ty, mutable: false }
}

/// Parameter whose type is a by-name reference (a static parameter, usually).
pub fn pdn(rt: &mut Runtime, name: &str, ty_name: &str) -> ParamDecl {
    let ty = named(rt, ty_name);
    pd(rt, name, ty)
}

pub fn concrete(t: TypeId) -> TypeExpr {
    TypeExpr::Concrete(t)
}

pub fn named(rt: &mut Runtime, n: &str) -> TypeExpr {
    TypeExpr::Named(rt.names.intern(n))
}

pub fn rest_of(t: TypeId) -> TypeExpr {
    TypeExpr::Rest(Box::new(TypeExpr::Concrete(t)))
}

pub fn lit(v: Value) -> Body {
    Body::Expr(Rc::new(Expr::Lit(v)))
}

pub fn var(rt: &mut Runtime, name: &str) -> Body {
    Body::Expr(Rc::new(Expr::Var(rt.names.intern(name))))
}

pub fn fd(
    rt: &mut Runtime,
    name: &str,
    params: Vec<ParamDecl>,
    ret: TypeExpr,
    body: Body,
) -> Rc<FnDef> {
    Rc::new(FnDef {
        name: rt.names.intern(name),
        static_params: vec![],
        params,
        return_type: ret,
        body,
        at: HERE,
    })
}

pub fn gfd(
    rt: &mut Runtime,
    name: &str,
    static_params: Vec<StaticParam>,
    params: Vec<ParamDecl>,
    ret: TypeExpr,
    body: Body,
) -> Rc<FnDef> {
    Rc::new(FnDef {
        name: rt.names.intern(name),
        static_params,
        params,
        return_type: ret,
        body,
        at: HERE,
    })
}

pub fn type_param(rt: &mut Runtime, name: &str, bounds: Vec<TypeExpr>) -> StaticParam {
    StaticParam { name: rt.names.intern(name), kind: StaticParamKind::Type, bounds }
}

pub fn field(rt: &mut Runtime, name: &str, ty: TypeExpr, init: Expr) -> FieldDef {
    FieldDef { name: rt.names.intern(name), ty, init: Rc::new(init) }
}

pub fn trait_decl(
    rt: &mut Runtime,
    name: &str,
    extends: Vec<TypeExpr>,
    methods: Vec<Rc<FnDef>>,
) -> TraitDecl {
    TraitDecl { name: rt.names.intern(name), extends, excludes: vec![], methods, at: HERE }
}

pub fn object_decl(
    rt: &mut Runtime,
    name: &str,
    extends: Vec<TypeExpr>,
    params: Vec<ParamDecl>,
    fields: Vec<FieldDef>,
    methods: Vec<Rc<FnDef>>,
) -> ObjectDecl {
    ObjectDecl {
        name: rt.names.intern(name),
        static_params: vec![],
        extends,
        excludes: vec![],
        params,
        fields,
        methods,
        at: HERE,
    }
}

pub fn define(rt: &mut Runtime, def: Rc<FnDef>) -> CallableId {
    let global = rt.global_env();
    rt.define_fn(global, def).unwrap()
}

/// The global binding for a name, after any overload-set growth.
pub fn lookup_fn(rt: &Runtime, name: Name) -> CallableId {
    match rt.envs.get_value(rt.envs.global, name) {
        Some(Value::Fn(f)) => f,
        other => panic!("expected a function binding, got {other:?}"),
    }
}

pub fn str_val(s: &str) -> Value {
    Value::Str(EcoString::from(s))
}

pub fn tup(elems: Vec<Value>) -> Value {
    Value::Tuple(elems.into_iter().collect())
}
