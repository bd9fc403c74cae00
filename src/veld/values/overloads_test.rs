// Copyright (c) 2025 knix
// All rights reserved.

use crate::types::{RR64_TYPE_ID, STRING_TYPE_ID, TypeId, ZZ32_TYPE_ID, ZZ64_TYPE_ID};
use crate::values::testkit::*;
use crate::values::{Callable, ErrorKind, Runtime, TraitDecl, Value};

fn two_member_set(rt: &mut Runtime) -> crate::values::CallableId {
    let p1 = vec![pd(rt, "n", concrete(ZZ32_TYPE_ID))];
    let b1 = var(rt, "n");
    let d1 = fd(rt, "f", p1, concrete(ZZ32_TYPE_ID), b1);
    define(rt, d1);
    let p2 = vec![pd(rt, "s", concrete(STRING_TYPE_ID))];
    let b2 = var(rt, "s");
    let d2 = fd(rt, "f", p2, concrete(STRING_TYPE_ID), b2);
    define(rt, d2);
    lookup_fn(rt, rt.names.get("f").unwrap())
}

fn members_of(rt: &Runtime, set: crate::values::CallableId) -> usize {
    match rt.callables.get(set) {
        Callable::Overloaded(o) => o.members.len(),
        _ => panic!("not an overload set"),
    }
}

#[test]
fn dispatch_picks_the_matching_member() {
    let mut rt = rt();
    let set = two_member_set(&mut rt);
    assert_eq!(rt.apply_to_args(set, &[Value::Int32(3)], HERE).unwrap(), Value::Int32(3));
    assert_eq!(rt.apply_to_args(set, &[str_val("hi")], HERE).unwrap(), str_val("hi"));
}

#[test]
fn dispatch_failure_reports_types_and_members() {
    let mut rt = rt();
    let set = two_member_set(&mut rt);
    let err = rt.apply_to_args(set, &[Value::Float64(1.5)], HERE).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DispatchFailure);
    assert!(err.message.contains("RR64"), "{}", err.message);
    assert!(err.message.contains("ZZ32") && err.message.contains("String"), "{}", err.message);
}

#[test]
fn dispatch_cache_skips_repeat_scans() {
    let mut rt = rt();
    let set = two_member_set(&mut rt);
    rt.apply_to_args(set, &[Value::Int32(1)], HERE).unwrap();
    assert_eq!(rt.counters.dispatch_scans, 1);
    rt.apply_to_args(set, &[Value::Int32(2)], HERE).unwrap();
    assert_eq!(rt.counters.dispatch_scans, 1, "same argument types must hit the cache");
    rt.apply_to_args(set, &[str_val("x")], HERE).unwrap();
    assert_eq!(rt.counters.dispatch_scans, 2);
}

#[test]
fn finalize_is_idempotent() {
    let mut rt = rt();
    let set = two_member_set(&mut rt);
    rt.finalize_overloads(set, HERE).unwrap();
    rt.finalize_overloads(set, HERE).unwrap();
    assert_eq!(members_of(&rt, set), 2);
    assert_eq!(rt.apply_to_args(set, &[Value::Int32(3)], HERE).unwrap(), Value::Int32(3));
}

#[test]
fn adding_a_member_reopens_the_set() {
    let mut rt = rt();
    let set = two_member_set(&mut rt);
    rt.apply_to_args(set, &[Value::Int32(1)], HERE).unwrap();
    let p = vec![pd(&mut rt, "r", concrete(RR64_TYPE_ID))];
    let b = var(&mut rt, "r");
    let d = fd(&mut rt, "f", p, concrete(RR64_TYPE_ID), b);
    define(&mut rt, d);
    assert_eq!(lookup_fn(&rt, rt.names.get("f").unwrap()), set);
    assert_eq!(rt.apply_to_args(set, &[Value::Float64(2.5)], HERE).unwrap(), Value::Float64(2.5));
}

#[test]
fn identical_duplicate_is_silently_dropped() {
    let mut rt = rt();
    for _ in 0..2 {
        let p = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID))];
        let b = var(&mut rt, "n");
        let d = fd(&mut rt, "dup", p, concrete(ZZ32_TYPE_ID), b);
        define(&mut rt, d);
    }
    let set = lookup_fn(&rt, rt.names.get("dup").unwrap());
    rt.finalize_overloads(set, HERE).unwrap();
    assert_eq!(members_of(&rt, set), 1);
    assert_eq!(rt.apply_to_args(set, &[Value::Int32(8)], HERE).unwrap(), Value::Int32(8));
}

#[test]
fn identical_domain_with_different_returns_is_rejected() {
    let mut rt = rt();
    let p1 = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID))];
    let d1 = fd(&mut rt, "g", p1, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
    define(&mut rt, d1);
    let p2 = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID))];
    let d2 = fd(&mut rt, "g", p2, concrete(STRING_TYPE_ID), lit(str_val("1")));
    define(&mut rt, d2);
    let set = lookup_fn(&rt, rt.names.get("g").unwrap());
    let err = rt.finalize_overloads(set, HERE).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AmbiguousOverload);
    assert!(err.message.contains("return types"), "{}", err.message);
}

#[test]
fn more_specific_arguments_demand_comparable_returns() {
    let mut rt = rt();
    let p1 = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID))];
    let d1 = fd(&mut rt, "g", p1, concrete(RR64_TYPE_ID), lit(Value::Float64(1.0)));
    define(&mut rt, d1);
    let p2 = vec![pd(&mut rt, "n", concrete(ZZ64_TYPE_ID))];
    let d2 = fd(&mut rt, "g", p2, concrete(ZZ64_TYPE_ID), lit(Value::Int64(1)));
    define(&mut rt, d2);
    let set = lookup_fn(&rt, rt.names.get("g").unwrap());
    let err = rt.apply_to_args(set, &[Value::Int32(1)], HERE).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AmbiguousOverload);
    assert!(err.message.contains("result"), "{}", err.message);
}

#[test]
fn nested_subtype_domains_dispatch_most_specific_regardless_of_order() {
    for flipped in [false, true] {
        let mut rt = rt();
        let mut defs = vec![
            (ZZ32_TYPE_ID, Value::Int32(32)),
            (ZZ64_TYPE_ID, Value::Int32(64)),
        ];
        if flipped {
            defs.reverse();
        }
        for (ty, out) in defs {
            let p = vec![pd(&mut rt, "n", concrete(ty))];
            let d = fd(&mut rt, "h", p, concrete(ty), lit(out));
            define(&mut rt, d);
        }
        let set = lookup_fn(&rt, rt.names.get("h").unwrap());
        let winner = rt.best_match(set, &[Value::Int32(1)], HERE).unwrap();
        assert_eq!(rt.get_domain(winner, HERE).unwrap(), vec![ZZ32_TYPE_ID]);
    }
}

#[test]
fn exact_arity_beats_a_rest_signature_it_ties_with() {
    let mut rt = rt();
    let p1 = vec![pd(&mut rt, "a", concrete(ZZ32_TYPE_ID)), pd(&mut rt, "xs", rest_of(ZZ32_TYPE_ID))];
    let d1 = fd(&mut rt, "v", p1, concrete(ZZ32_TYPE_ID), lit(Value::Int32(100)));
    define(&mut rt, d1);
    let p2 = vec![pd(&mut rt, "a", concrete(ZZ32_TYPE_ID)), pd(&mut rt, "b", concrete(ZZ32_TYPE_ID))];
    let d2 = fd(&mut rt, "v", p2, concrete(ZZ32_TYPE_ID), lit(Value::Int32(200)));
    define(&mut rt, d2);
    let set = lookup_fn(&rt, rt.names.get("v").unwrap());
    let two = rt.apply_to_args(set, &[Value::Int32(1), Value::Int32(2)], HERE).unwrap();
    assert_eq!(two, Value::Int32(200));
    let three = rt.apply_to_args(set, &[Value::Int32(1), Value::Int32(2), Value::Int32(3)], HERE).unwrap();
    assert_eq!(three, Value::Int32(100));
}

fn declare_plain_trait(rt: &mut Runtime, name: &str, extends: Vec<&str>) -> TypeId {
    let extends = extends.iter().map(|e| named(rt, e)).collect();
    let decl = trait_decl(rt, name, extends, vec![]);
    rt.declare_trait(decl).unwrap()
}

fn declare_excluding_trait(rt: &mut Runtime, name: &str, excludes: &str) -> TypeId {
    let excludes = vec![named(rt, excludes)];
    let decl = TraitDecl {
        name: rt.names.intern(name),
        extends: vec![],
        excludes,
        methods: vec![],
        at: HERE,
    };
    rt.declare_trait(decl).unwrap()
}

#[test]
fn declared_exclusion_permits_unrelated_returns() {
    let mut rt = rt();
    let x = declare_plain_trait(&mut rt, "Xa", vec![]);
    let y = declare_excluding_trait(&mut rt, "Ya", "Xa");
    let p1 = vec![pd(&mut rt, "x", concrete(x))];
    let d1 = fd(&mut rt, "e", p1, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
    define(&mut rt, d1);
    let p2 = vec![pd(&mut rt, "y", concrete(y))];
    let d2 = fd(&mut rt, "e", p2, concrete(STRING_TYPE_ID), lit(str_val("y")));
    define(&mut rt, d2);
    let set = lookup_fn(&rt, rt.names.get("e").unwrap());
    rt.finalize_overloads(set, HERE).unwrap();

    let ext = vec![named(&mut rt, "Xa")];
    let od = object_decl(&mut rt, "OX", ext, vec![], vec![], vec![]);
    let ctor = rt.declare_object(od).unwrap();
    let obj = rt.apply_to_args(ctor, &[], HERE).unwrap();
    assert_eq!(rt.apply_to_args(set, &[obj], HERE).unwrap(), Value::Int32(1));
}

#[test]
fn unordered_domains_without_a_meet_are_rejected() {
    let mut rt = rt();
    let a = declare_plain_trait(&mut rt, "Aa", vec![]);
    let b = declare_plain_trait(&mut rt, "Bb", vec![]);
    let p1 = vec![pd(&mut rt, "a", concrete(a))];
    let d1 = fd(&mut rt, "m", p1, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
    define(&mut rt, d1);
    let p2 = vec![pd(&mut rt, "b", concrete(b))];
    let d2 = fd(&mut rt, "m", p2, concrete(ZZ32_TYPE_ID), lit(Value::Int32(2)));
    define(&mut rt, d2);
    let set = lookup_fn(&rt, rt.names.get("m").unwrap());
    let err = rt.finalize_overloads(set, HERE).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AmbiguousOverload);
    assert!(err.message.contains("meet"), "{}", err.message);
}

#[test]
fn split_specificity_needs_the_meet_as_a_member() {
    // A1 < A2, B1 < B2; f(A2,B1) and f(A1,B2) split specificity and are
    // legal only when f(A1,B1) is itself a member
    for with_meet in [true, false] {
        let mut rt = rt();
        let a2 = declare_plain_trait(&mut rt, "A2", vec![]);
        let a1 = declare_plain_trait(&mut rt, "A1", vec!["A2"]);
        let b2 = declare_plain_trait(&mut rt, "B2", vec![]);
        let b1 = declare_plain_trait(&mut rt, "B1", vec!["B2"]);
        let mut domains = vec![vec![a2, b1], vec![a1, b2]];
        if with_meet {
            domains.insert(0, vec![a1, b1]);
        }
        for domain in domains {
            let params = vec![
                pd(&mut rt, "p", concrete(domain[0])),
                pd(&mut rt, "q", concrete(domain[1])),
            ];
            let d = fd(&mut rt, "s", params, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
            define(&mut rt, d);
        }
        let set = lookup_fn(&rt, rt.names.get("s").unwrap());
        let result = rt.finalize_overloads(set, HERE);
        if with_meet {
            result.unwrap();
        } else {
            let err = result.unwrap_err();
            assert_eq!(err.kind, ErrorKind::AmbiguousOverload);
            assert!(err.message.contains("define the meet"), "{}", err.message);
        }
    }
}

#[test]
fn meet_defined_after_the_split_pair_still_counts() {
    // Definition order must not matter: the meet member satisfies the
    // split pair even when it is the last one added
    let mut rt = rt();
    let a2 = declare_plain_trait(&mut rt, "A2", vec![]);
    let a1 = declare_plain_trait(&mut rt, "A1", vec!["A2"]);
    let b2 = declare_plain_trait(&mut rt, "B2", vec![]);
    let b1 = declare_plain_trait(&mut rt, "B1", vec!["B2"]);
    for domain in [vec![a2, b1], vec![a1, b2], vec![a1, b1]] {
        let params = vec![
            pd(&mut rt, "p", concrete(domain[0])),
            pd(&mut rt, "q", concrete(domain[1])),
        ];
        let d = fd(&mut rt, "s", params, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
        define(&mut rt, d);
    }
    let set = lookup_fn(&rt, rt.names.get("s").unwrap());
    rt.finalize_overloads(set, HERE).unwrap();
}

#[test]
fn generic_overlap_needs_an_excluding_pair() {
    let mut rt = rt();
    let t = type_param(&mut rt, "T", vec![]);
    let gp = vec![pdn(&mut rt, "x", "T")];
    let gr = named(&mut rt, "T");
    let gb = var(&mut rt, "x");
    let gd = gfd(&mut rt, "w", vec![t], gp, gr, gb);
    define(&mut rt, gd);
    let p = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID))];
    let d = fd(&mut rt, "w", p, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
    define(&mut rt, d);
    let set = lookup_fn(&rt, rt.names.get("w").unwrap());
    let err = rt.finalize_overloads(set, HERE).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AmbiguousOverload);
    assert!(err.message.contains("excluding"), "{}", err.message);
}

#[test]
fn generic_overlap_with_an_excluding_pair_is_fine() {
    let mut rt = rt();
    let x = declare_plain_trait(&mut rt, "Tag1", vec![]);
    let y = declare_excluding_trait(&mut rt, "Tag2", "Tag1");
    let t = type_param(&mut rt, "T", vec![]);
    let gp = vec![pdn(&mut rt, "v", "T"), pd(&mut rt, "tag", concrete(x))];
    let gr = named(&mut rt, "T");
    let gb = var(&mut rt, "v");
    let gd = gfd(&mut rt, "w", vec![t], gp, gr, gb);
    define(&mut rt, gd);
    let p = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID)), pd(&mut rt, "tag", concrete(y))];
    let d = fd(&mut rt, "w", p, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
    define(&mut rt, d);
    let set = lookup_fn(&rt, rt.names.get("w").unwrap());
    rt.finalize_overloads(set, HERE).unwrap();
}

#[test]
fn blessed_sets_skip_the_checker() {
    let mut rt = rt();
    // These two would fail the identical-domain check if it ran
    let p1 = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID))];
    let f1def = fd(&mut rt, "b1", p1, concrete(ZZ32_TYPE_ID), lit(Value::Int32(1)));
    let f1 = define(&mut rt, f1def);
    let p2 = vec![pd(&mut rt, "n", concrete(ZZ32_TYPE_ID))];
    let f2def = fd(&mut rt, "b2", p2, concrete(STRING_TYPE_ID), lit(str_val("x")));
    let f2 = define(&mut rt, f2def);
    let name = rt.names.intern("blessed");
    let set = rt.new_overload_set(name, HERE);
    rt.add_overload(set, f1, HERE).unwrap();
    rt.add_overload(set, f2, HERE).unwrap();
    rt.bless_overloads(set, HERE).unwrap();
    rt.finalize_overloads(set, HERE).unwrap();
    assert_eq!(rt.apply_to_args(set, &[Value::Int32(4)], HERE).unwrap(), Value::Int32(1));
}

#[test]
fn generic_member_participates_in_dispatch() {
    let mut rt = rt();
    let t = type_param(&mut rt, "T", vec![]);
    let gp = vec![
        pdn(&mut rt, "x", "T"),
        pd(&mut rt, "tag", concrete(STRING_TYPE_ID)),
    ];
    let gr = named(&mut rt, "T");
    let gb = var(&mut rt, "x");
    let gd = gfd(&mut rt, "pick", vec![t], gp, gr, gb);
    define(&mut rt, gd);
    let p = vec![
        pd(&mut rt, "x", concrete(ZZ32_TYPE_ID)),
        pd(&mut rt, "tag", concrete(ZZ32_TYPE_ID)),
    ];
    let d = fd(&mut rt, "pick", p, concrete(ZZ32_TYPE_ID), lit(Value::Int32(-1)));
    define(&mut rt, d);
    let set = lookup_fn(&rt, rt.names.get("pick").unwrap());
    // String excludes ZZ32 (both leaves), so the pair is consistent
    let via_generic = rt.apply_to_args(set, &[Value::Float64(2.5), str_val("t")], HERE).unwrap();
    assert_eq!(via_generic, Value::Float64(2.5));
    let via_plain = rt.apply_to_args(set, &[Value::Int32(9), Value::Int32(0)], HERE).unwrap();
    assert_eq!(via_plain, Value::Int32(-1));
}
