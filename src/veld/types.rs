// Copyright (c) 2025 knix
// All rights reserved.

use std::num::NonZeroU32;

use ahash::HashMapExt;
use fxhash::FxHashMap;
use itertools::Itertools;
use smallvec::smallvec;

use crate::names::{Name, NamePool};
use crate::pool::Pool;
use crate::{SV4, SV8, nz_u32_id};

nz_u32_id!(TypeId);

pub const ANY_TYPE_ID: TypeId = TypeId::from_u32(1).unwrap();
pub const BOTTOM_TYPE_ID: TypeId = TypeId::from_u32(2).unwrap();
pub const UNIT_TYPE_ID: TypeId = TypeId::from_u32(3).unwrap();
pub const BOOL_TYPE_ID: TypeId = TypeId::from_u32(4).unwrap();
pub const CHAR_TYPE_ID: TypeId = TypeId::from_u32(5).unwrap();
pub const STRING_TYPE_ID: TypeId = TypeId::from_u32(6).unwrap();
pub const NUMBER_TYPE_ID: TypeId = TypeId::from_u32(7).unwrap();
pub const ZZ64_TYPE_ID: TypeId = TypeId::from_u32(8).unwrap();
pub const ZZ32_TYPE_ID: TypeId = TypeId::from_u32(9).unwrap();
pub const RR64_TYPE_ID: TypeId = TypeId::from_u32(10).unwrap();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominalKind {
    Trait,
    Object,
    /// Builtin scalar leaf; behaves like an object type for exclusion purposes
    Builtin,
}

impl NominalKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NominalKind::Object | NominalKind::Builtin)
    }
}

#[derive(Debug, Clone)]
pub struct NominalType {
    pub name: Name,
    pub kind: NominalKind,
    pub extends: SV4<TypeId>,
    pub excludes: SV4<TypeId>,
    /// Populated for types produced by generic instantiation, e.g. List[ZZ32]
    pub inst_args: Option<Vec<TypeId>>,
}

/// A placeholder type parameter, alive only inside one generic's
/// disposable instantiation environment. Never interned: every `add`
/// yields a distinct TypeId, which is exactly the identity we want.
#[derive(Debug, Clone)]
pub struct SymbolicType {
    pub name: Name,
    pub bounds: SV4<TypeId>,
    /// The generic (or shared per-name group) this placeholder belongs to
    pub owner: u32,
}

#[derive(Debug, Clone)]
pub struct ArrowType {
    pub params: Vec<TypeId>,
    pub ret: TypeId,
}

#[derive(Debug, Clone)]
pub enum Type {
    Any,
    Bottom,
    Nominal(NominalType),
    Tuple(Vec<TypeId>),
    /// Variadic tail marker; legal only as the last entry of a domain
    Rest(TypeId),
    Arrow(ArrowType),
    Symbolic(SymbolicType),
    SymNat(Name),
    SymBool(Name),
    SymOp(Name),
}

pub struct Types {
    pool: Pool<Type, TypeId>,
    tuples: FxHashMap<Vec<TypeId>, TypeId>,
    rests: FxHashMap<TypeId, TypeId>,
    arrows: FxHashMap<(Vec<TypeId>, TypeId), TypeId>,
}

impl Types {
    pub fn make(names: &NamePool) -> Types {
        let mut types = Types {
            pool: Pool::make_with_hint("types", 256),
            tuples: FxHashMap::new(),
            rests: FxHashMap::new(),
            arrows: FxHashMap::new(),
        };
        let any = types.pool.add(Type::Any);
        let bottom = types.pool.add(Type::Bottom);
        debug_assert_eq!(any, ANY_TYPE_ID);
        debug_assert_eq!(bottom, BOTTOM_TYPE_ID);
        let mut builtin = |name: Name, kind: NominalKind, extends: SV4<TypeId>| {
            types.pool.add(Type::Nominal(NominalType {
                name,
                kind,
                extends,
                excludes: smallvec![],
                inst_args: None,
            }))
        };
        let b = &names.b;
        let unit = builtin(b.Unit, NominalKind::Builtin, smallvec![]);
        builtin(b.Boolean, NominalKind::Builtin, smallvec![]);
        builtin(b.Char, NominalKind::Builtin, smallvec![]);
        builtin(b.String, NominalKind::Builtin, smallvec![]);
        let number = builtin(b.Number, NominalKind::Trait, smallvec![]);
        let zz64 = builtin(b.ZZ64, NominalKind::Builtin, smallvec![number]);
        let zz32 = builtin(b.ZZ32, NominalKind::Builtin, smallvec![zz64]);
        let rr64 = builtin(b.RR64, NominalKind::Builtin, smallvec![number]);
        debug_assert_eq!(unit, UNIT_TYPE_ID);
        debug_assert_eq!(zz32, ZZ32_TYPE_ID);
        debug_assert_eq!(rr64, RR64_TYPE_ID);
        types
    }

    pub fn get(&self, id: TypeId) -> &Type {
        self.pool.get(id)
    }

    pub fn add(&mut self, t: Type) -> TypeId {
        self.pool.add(t)
    }

    pub fn add_nominal(
        &mut self,
        name: Name,
        kind: NominalKind,
        extends: SV4<TypeId>,
        excludes: SV4<TypeId>,
        inst_args: Option<Vec<TypeId>>,
    ) -> TypeId {
        self.pool.add(Type::Nominal(NominalType { name, kind, extends, excludes, inst_args }))
    }

    /// Declare a mutual exclusion after the fact; used when the right-hand
    /// side was not yet defined at the left-hand side's declaration.
    pub fn add_exclusion(&mut self, a: TypeId, b: TypeId) {
        if let Type::Nominal(n) = self.pool.get_mut(a) {
            if !n.excludes.contains(&b) {
                n.excludes.push(b);
            }
        }
    }

    /// Tuples are interned so that structurally equal domains compare by id.
    pub fn tuple(&mut self, elems: &[TypeId]) -> TypeId {
        if let Some(&id) = self.tuples.get(elems) {
            return id;
        }
        let id = self.pool.add(Type::Tuple(elems.to_vec()));
        self.tuples.insert(elems.to_vec(), id);
        id
    }

    pub fn rest(&mut self, elem: TypeId) -> TypeId {
        if let Some(&id) = self.rests.get(&elem) {
            return id;
        }
        let id = self.pool.add(Type::Rest(elem));
        self.rests.insert(elem, id);
        id
    }

    pub fn arrow(&mut self, params: Vec<TypeId>, ret: TypeId) -> TypeId {
        let key = (params, ret);
        if let Some(&id) = self.arrows.get(&key) {
            return id;
        }
        let id = self.pool.add(Type::Arrow(ArrowType { params: key.0.clone(), ret }));
        self.arrows.insert(key, id);
        id
    }

    pub fn is_rest(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Rest(_))
    }

    pub fn rest_elem(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Rest(e) => Some(*e),
            _ => None,
        }
    }

    pub fn is_symbolic(&self, id: TypeId) -> bool {
        match self.get(id) {
            Type::Symbolic(_) | Type::SymNat(_) | Type::SymBool(_) | Type::SymOp(_) => true,
            Type::Tuple(elems) => elems.iter().any(|&e| self.is_symbolic(e)),
            Type::Rest(e) => self.is_symbolic(*e),
            Type::Arrow(a) => {
                a.params.iter().any(|&p| self.is_symbolic(p)) || self.is_symbolic(a.ret)
            }
            _ => false,
        }
    }

    pub fn subtype_of(&self, a: TypeId, b: TypeId) -> bool {
        if a == b || b == ANY_TYPE_ID || a == BOTTOM_TYPE_ID {
            return true;
        }
        if a == ANY_TYPE_ID {
            return false;
        }
        match (self.get(a), self.get(b)) {
            (Type::Nominal(n), _) => n.extends.iter().any(|&e| self.subtype_of(e, b)),
            (Type::Symbolic(s), _) => s.bounds.iter().any(|&e| self.subtype_of(e, b)),
            (Type::Tuple(xs), Type::Tuple(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().zip(ys.iter()).all(|(&x, &y)| self.subtype_of(x, y))
            }
            (Type::Rest(x), Type::Rest(y)) => self.subtype_of(*x, *y),
            (Type::Arrow(f), Type::Arrow(g)) => {
                f.params.len() == g.params.len()
                    && g.params.iter().zip(f.params.iter()).all(|(&gp, &fp)| self.subtype_of(gp, fp))
                    && self.subtype_of(f.ret, g.ret)
            }
            _ => false,
        }
    }

    /// True when no runtime value can inhabit both types.
    pub fn excludes_other(&self, a: TypeId, b: TypeId) -> bool {
        if a == b || a == ANY_TYPE_ID || b == ANY_TYPE_ID {
            return false;
        }
        if a == BOTTOM_TYPE_ID || b == BOTTOM_TYPE_ID {
            return false;
        }
        if self.subtype_of(a, b) || self.subtype_of(b, a) {
            return false;
        }
        if self.declared_excludes(a, b) || self.declared_excludes(b, a) {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Type::Symbolic(_), _) | (_, Type::Symbolic(_)) => false,
            (Type::SymNat(_), _) | (_, Type::SymNat(_)) => false,
            (Type::SymBool(_), _) | (_, Type::SymBool(_)) => false,
            (Type::SymOp(_), _) | (_, Type::SymOp(_)) => false,
            (Type::Tuple(xs), Type::Tuple(ys)) => {
                xs.len() != ys.len()
                    || xs.iter().zip(ys.iter()).any(|(&x, &y)| self.excludes_other(x, y))
            }
            (Type::Tuple(_), _) | (_, Type::Tuple(_)) => true,
            // A leaf's instances have exactly that type, so anything not
            // subtype-related to it is uninhabitable alongside it
            (Type::Nominal(na), Type::Nominal(nb)) => na.kind.is_leaf() || nb.kind.is_leaf(),
            _ => false,
        }
    }

    fn declared_excludes(&self, a: TypeId, b: TypeId) -> bool {
        self.transitive_extends(a).iter().any(|&sa| match self.get(sa) {
            Type::Nominal(n) => n.excludes.iter().any(|&x| self.subtype_of(b, x)),
            _ => false,
        })
    }

    /// Does a value of runtime type `actual` satisfy the formal type?
    pub fn type_match(&self, actual: TypeId, formal: TypeId) -> bool {
        formal == ANY_TYPE_ID || self.subtype_of(actual, formal)
    }

    /// The type plus every trait it extends, self first, supertypes in
    /// declaration pre-order, deduplicated.
    pub fn transitive_extends(&self, t: TypeId) -> SV8<TypeId> {
        let mut out: SV8<TypeId> = smallvec![];
        self.visit_extends(t, &mut out);
        out
    }

    fn visit_extends(&self, t: TypeId, out: &mut SV8<TypeId>) {
        if out.contains(&t) {
            return;
        }
        out.push(t);
        if let Type::Nominal(n) = self.get(t) {
            for &e in &n.extends {
                self.visit_extends(e, out);
            }
        }
    }

    /// Pointwise greatest lower bound of two equal-length parameter lists.
    /// None when some position has no directional ordering.
    pub fn tuple_meet(&self, a: &[TypeId], b: &[TypeId]) -> Option<Vec<TypeId>> {
        if a.len() != b.len() {
            return None;
        }
        let mut out = Vec::with_capacity(a.len());
        for (&x, &y) in a.iter().zip(b.iter()) {
            if self.subtype_of(x, y) {
                out.push(x);
            } else if self.subtype_of(y, x) {
                out.push(y);
            } else {
                return None;
            }
        }
        Some(out)
    }

    /// Domain position lookup that sees through a trailing Rest marker.
    /// None means the domain cannot cover position i at all.
    pub fn clamped(&self, domain: &[TypeId], i: usize) -> Option<TypeId> {
        match domain.last() {
            Some(&last) if self.is_rest(last) => {
                if i + 1 < domain.len() {
                    Some(domain[i])
                } else {
                    self.rest_elem(last)
                }
            }
            _ => domain.get(i).copied(),
        }
    }

    pub fn domain_has_rest(&self, domain: &[TypeId]) -> bool {
        domain.last().is_some_and(|&last| self.is_rest(last))
    }

    pub fn display(&self, id: TypeId, names: &NamePool) -> String {
        match self.get(id) {
            Type::Any => "Any".to_string(),
            Type::Bottom => "Bottom".to_string(),
            Type::Nominal(n) => match &n.inst_args {
                None => names.str(n.name).to_string(),
                Some(args) => format!(
                    "{}[{}]",
                    names.str(n.name),
                    args.iter().map(|&a| self.display(a, names)).join(", ")
                ),
            },
            Type::Tuple(elems) => {
                format!("({})", elems.iter().map(|&e| self.display(e, names)).join(", "))
            }
            Type::Rest(e) => format!("{}...", self.display(*e, names)),
            Type::Arrow(a) => format!(
                "({}) -> {}",
                a.params.iter().map(|&p| self.display(p, names)).join(", "),
                self.display(a.ret, names)
            ),
            Type::Symbolic(s) => format!("'{}", names.str(s.name)),
            Type::SymNat(n) => format!("nat '{}", names.str(*n)),
            Type::SymBool(n) => format!("bool '{}", names.str(*n)),
            Type::SymOp(n) => format!("op '{}", names.str(*n)),
        }
    }

    pub fn display_domain(&self, domain: &[TypeId], names: &NamePool) -> String {
        format!("({})", domain.iter().map(|&t| self.display(t, names)).join(", "))
    }
}

#[cfg(test)]
mod test {
    use smallvec::smallvec;

    use super::*;
    use crate::names::NamePool;

    fn setup() -> (NamePool, Types) {
        let names = NamePool::make();
        let types = Types::make(&names);
        (names, types)
    }

    #[test]
    fn numeric_tower_subtyping() {
        let (_names, types) = setup();
        assert!(types.subtype_of(ZZ32_TYPE_ID, ZZ64_TYPE_ID));
        assert!(types.subtype_of(ZZ32_TYPE_ID, NUMBER_TYPE_ID));
        assert!(types.subtype_of(RR64_TYPE_ID, NUMBER_TYPE_ID));
        assert!(!types.subtype_of(ZZ64_TYPE_ID, ZZ32_TYPE_ID));
        assert!(!types.subtype_of(RR64_TYPE_ID, ZZ64_TYPE_ID));
    }

    #[test]
    fn leaf_exclusion() {
        let (_names, types) = setup();
        assert!(types.excludes_other(ZZ32_TYPE_ID, STRING_TYPE_ID));
        assert!(types.excludes_other(ZZ64_TYPE_ID, RR64_TYPE_ID));
        assert!(!types.excludes_other(ZZ32_TYPE_ID, ZZ64_TYPE_ID));
        assert!(!types.excludes_other(ZZ32_TYPE_ID, NUMBER_TYPE_ID));
    }

    #[test]
    fn declared_exclusion_is_symmetric_and_inherited() {
        let (mut names, mut types) = setup();
        let hot = names.intern("Hot");
        let cold = names.intern("Cold");
        let ember = names.intern("Ember");
        let hot_id = types.add_nominal(hot, NominalKind::Trait, smallvec![], smallvec![], None);
        let cold_id =
            types.add_nominal(cold, NominalKind::Trait, smallvec![], smallvec![hot_id], None);
        let ember_id =
            types.add_nominal(ember, NominalKind::Object, smallvec![hot_id], smallvec![], None);
        assert!(types.excludes_other(hot_id, cold_id));
        assert!(types.excludes_other(cold_id, hot_id));
        assert!(types.excludes_other(ember_id, cold_id));
    }

    #[test]
    fn tuples_intern_structurally() {
        let (_names, mut types) = setup();
        let a = types.tuple(&[ZZ32_TYPE_ID, STRING_TYPE_ID]);
        let b = types.tuple(&[ZZ32_TYPE_ID, STRING_TYPE_ID]);
        let c = types.tuple(&[STRING_TYPE_ID, ZZ32_TYPE_ID]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tuple_arity_excludes() {
        let (_names, mut types) = setup();
        let two = types.tuple(&[ZZ32_TYPE_ID, ZZ32_TYPE_ID]);
        let three = types.tuple(&[ZZ32_TYPE_ID, ZZ32_TYPE_ID, ZZ32_TYPE_ID]);
        assert!(types.excludes_other(two, three));
        assert!(types.excludes_other(two, ZZ32_TYPE_ID));
    }

    #[test]
    fn clamped_repeats_rest_elem() {
        let (_names, mut types) = setup();
        let rest = types.rest(ZZ32_TYPE_ID);
        let domain = [STRING_TYPE_ID, rest];
        assert_eq!(types.clamped(&domain, 0), Some(STRING_TYPE_ID));
        assert_eq!(types.clamped(&domain, 1), Some(ZZ32_TYPE_ID));
        assert_eq!(types.clamped(&domain, 7), Some(ZZ32_TYPE_ID));
        let fixed = [STRING_TYPE_ID];
        assert_eq!(types.clamped(&fixed, 1), None);
    }

    #[test]
    fn meet_picks_lower_bound_pointwise() {
        let (_names, types) = setup();
        let meet = types.tuple_meet(&[ZZ32_TYPE_ID, NUMBER_TYPE_ID], &[ZZ64_TYPE_ID, RR64_TYPE_ID]);
        assert_eq!(meet, Some(vec![ZZ32_TYPE_ID, RR64_TYPE_ID]));
        let none = types.tuple_meet(&[ZZ32_TYPE_ID], &[STRING_TYPE_ID]);
        assert_eq!(none, None);
    }

    #[test]
    fn transitive_extends_self_first() {
        let (_names, types) = setup();
        let chain = types.transitive_extends(ZZ32_TYPE_ID);
        assert_eq!(chain.as_slice(), &[ZZ32_TYPE_ID, ZZ64_TYPE_ID, NUMBER_TYPE_ID]);
    }
}
