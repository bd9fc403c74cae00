// Copyright (c) 2025 knix
// All rights reserved.

use ahash::HashMapExt;
use fxhash::FxHashMap;
use itertools::Itertools;
use log::{debug, trace};

use crate::names::{At, Name};
use crate::types::TypeId;
use crate::values::{
    Callable, CallableId, ErrorKind, EvalResult, Overload, OverloadSet, Runtime, Value,
};
use crate::{bugf, failf};

enum Verdict {
    Keep,
    /// Structurally identical to an accepted member: a re-imported
    /// definition, silently dropped
    DropDuplicate,
}

enum PairOutcome {
    Compatible,
    Duplicate,
}

impl Runtime {
    pub fn new_overload_set(&mut self, name: Name, at: At) -> CallableId {
        self.callables.add(Callable::Overloaded(OverloadSet {
            name,
            at,
            members: Vec::new(),
            validated: 0,
            checked: Vec::new(),
            blessed: false,
            cache: FxHashMap::new(),
        }))
    }

    /// Re-opens the set: the next dispatch will re-finalize.
    pub fn add_overload(&mut self, set: CallableId, member: CallableId, at: At) -> EvalResult<()> {
        match self.callables.get_mut(set) {
            Callable::Overloaded(o) => {
                o.members.push(member);
                o.blessed = false;
                o.cache.clear();
                Ok(())
            }
            other => bugf!(at, "add_overload on a {}", other.kind_name()),
        }
    }

    /// Mark a set correct by construction; the pairwise checker never runs.
    /// Object construction uses this for per-name method groups it has
    /// already vetted.
    pub fn bless_overloads(&mut self, set: CallableId, at: At) -> EvalResult<()> {
        match self.callables.get_mut(set) {
            Callable::Overloaded(o) => {
                o.blessed = true;
                Ok(())
            }
            other => bugf!(at, "bless_overloads on a {}", other.kind_name()),
        }
    }

    /// Pairwise consistency checking of every not-yet-validated member
    /// against all accepted members. Idempotent when nothing was added.
    /// Validating a generic member symbolically instantiates it, which can
    /// re-enter and append further members; the loop runs to a fixpoint of
    /// no pending members, with a depth counter restored on every exit path.
    pub fn finalize_overloads(&mut self, set: CallableId, at: At) -> EvalResult<()> {
        self.finalize_depth += 1;
        let depth = self.finalize_depth;
        let mut rt = scopeguard::guard(self, |rt| rt.finalize_depth -= 1);
        loop {
            let (blessed, validated, total, name) = match rt.callables.get(set) {
                Callable::Overloaded(o) => (o.blessed, o.validated, o.members.len(), o.name),
                other => return bugf!(at, "finalize_overloads on a {}", other.kind_name()),
            };
            if blessed || validated == total {
                if validated == total && total > 0 {
                    trace!(
                        "overload set `{}` finalized with {} members (depth {depth})",
                        rt.names.str(name),
                        total
                    );
                }
                return Ok(());
            }
            let member = match rt.callables.get(set) {
                Callable::Overloaded(o) => o.members[validated],
                _ => return bugf!(at, "overload set changed kind"),
            };
            let info = rt.overload_info(member, at)?;
            match rt.check_member(set, &info, at)? {
                Verdict::Keep => {
                    let Callable::Overloaded(o) = rt.callables.get_mut(set) else {
                        return bugf!(at, "overload set changed kind");
                    };
                    o.checked.push(info);
                    o.validated += 1;
                    o.cache.clear();
                }
                Verdict::DropDuplicate => {
                    debug!(
                        "dropping duplicate overload of `{}` at member index {validated}",
                        rt.names.str(name)
                    );
                    let Callable::Overloaded(o) = rt.callables.get_mut(set) else {
                        return bugf!(at, "overload set changed kind");
                    };
                    o.members.remove(validated);
                }
            }
        }
    }

    /// Consistency-check snapshot: generics contribute the domain of their
    /// symbolic instantiation.
    fn overload_info(&mut self, member: CallableId, at: At) -> EvalResult<Overload> {
        let (single, is_generic) = match self.callables.get(member) {
            Callable::Generic(_) => (self.symbolic_instantiation(member, at)?, true),
            Callable::Overloaded(_) => {
                return bugf!(at, "overload sets cannot be members of overload sets");
            }
            _ => (member, false),
        };
        let Some(sig) = self.signature_of(single) else {
            return bugf!(
                at,
                "overload member `{}` was never finish-initialized",
                self.names.str(self.as_method_name(single))
            );
        };
        let domain = sig.domain();
        let return_type = sig.return_type;
        let self_index = match self.callables.get(single) {
            Callable::Method(m) => m.self_index,
            _ => None,
        };
        let symbolic = is_generic || domain.iter().any(|&t| self.types.is_symbolic(t));
        Ok(Overload { member, single, domain, return_type, self_index, symbolic })
    }

    fn check_member(&mut self, set: CallableId, info: &Overload, at: At) -> EvalResult<Verdict> {
        let (accepted, members, name) = match self.callables.get(set) {
            Callable::Overloaded(o) => (o.checked.clone(), o.members.clone(), o.name),
            _ => return bugf!(at, "overload set changed kind"),
        };
        // The meet check must see every member, validated or not: the meet
        // of a split pair may well be defined after the pair
        let mut all_domains: Vec<Vec<TypeId>> = Vec::with_capacity(members.len());
        for m in members {
            all_domains.push(self.get_domain(m, at)?);
        }
        for prev in &accepted {
            match self.check_pair(prev, info, &all_domains, name, at)? {
                PairOutcome::Compatible => {}
                PairOutcome::Duplicate => return Ok(Verdict::DropDuplicate),
            }
        }
        Ok(Verdict::Keep)
    }

    /// The pairwise rule set: exclusion short-circuits, self slots are
    /// exempt, symbolic positions demand an excluding pair, directional
    /// subtyping demands return-type co-direction, split specificity
    /// demands the meet be an existing member, identical signatures dedup.
    fn check_pair(
        &self,
        a: &Overload,
        b: &Overload,
        all_domains: &[Vec<TypeId>],
        name: Name,
        at: At,
    ) -> EvalResult<PairOutcome> {
        let ta = &a.domain;
        let tb = &b.domain;
        let a_rest = self.types.domain_has_rest(ta);
        let b_rest = self.types.domain_has_rest(tb);
        let a_fixed = ta.len() - a_rest as usize;
        let b_fixed = tb.len() - b_rest as usize;
        // No arity a call could present to both means no possible overlap
        if !a_rest && !b_rest && a_fixed != b_fixed {
            return Ok(PairOutcome::Compatible);
        }
        if a_rest && !b_rest && b_fixed < a_fixed {
            return Ok(PairOutcome::Compatible);
        }
        if !a_rest && b_rest && a_fixed < b_fixed {
            return Ok(PairOutcome::Compatible);
        }
        let n = if a_rest && b_rest {
            a_fixed.max(b_fixed) + 1
        } else if a_rest {
            b_fixed
        } else {
            a_fixed
        };
        let mut a_more = false;
        let mut b_more = false;
        let mut unordered = false;
        let mut saw_symbolic = false;
        let mut identical = true;
        for i in 0..n {
            let (Some(x), Some(y)) = (self.types.clamped(ta, i), self.types.clamped(tb, i)) else {
                return bugf!(at, "overload domains misaligned while checking `{}`", self.names.str(name));
            };
            if a.self_index == Some(i as u32) && b.self_index == Some(i as u32) {
                // Self slots are somebody else's problem: per-object
                // override checking owns them
                continue;
            }
            if x == y {
                continue;
            }
            identical = false;
            if self.types.excludes_other(x, y) {
                return Ok(PairOutcome::Compatible);
            }
            if self.types.is_symbolic(x) || self.types.is_symbolic(y) {
                saw_symbolic = true;
                continue;
            }
            let x_le = self.types.subtype_of(x, y);
            let y_le = self.types.subtype_of(y, x);
            if x_le {
                a_more = true;
            } else if y_le {
                b_more = true;
            } else {
                unordered = true;
            }
        }
        if identical && a_rest == b_rest && ta.len() == tb.len() {
            if a.return_type == b.return_type {
                return Ok(PairOutcome::Duplicate);
            }
            return failf!(
                ErrorKind::AmbiguousOverload,
                at,
                "overloads of `{}` have identical parameter types {} but different return types {} and {}",
                self.names.str(name),
                self.types.display_domain(ta, &self.names),
                self.types.display(a.return_type, &self.names),
                self.types.display(b.return_type, &self.names)
            );
        }
        if saw_symbolic {
            return failf!(
                ErrorKind::AmbiguousOverload,
                at,
                "generic overloads of `{}` need an excluding parameter pair to be distinguishable: {} vs {}",
                self.names.str(name),
                self.types.display_domain(ta, &self.names),
                self.types.display_domain(tb, &self.names)
            );
        }
        if unordered || (a_more && b_more) {
            let mut meet = Vec::with_capacity(n);
            for i in 0..n {
                let (Some(x), Some(y)) = (self.types.clamped(ta, i), self.types.clamped(tb, i))
                else {
                    return bugf!(at, "overload domains misaligned while checking `{}`", self.names.str(name));
                };
                if self.types.subtype_of(x, y) {
                    meet.push(x);
                } else if self.types.subtype_of(y, x) {
                    meet.push(y);
                } else {
                    return failf!(
                        ErrorKind::AmbiguousOverload,
                        at,
                        "overloads of `{}` cannot be ordered and have no meet: {} vs {}",
                        self.names.str(name),
                        self.types.display_domain(ta, &self.names),
                        self.types.display_domain(tb, &self.names)
                    );
                }
            }
            // The meet must already be a member, exactly; it is never
            // derived on the set's behalf
            let meet_present = all_domains.iter().any(|d| self.domain_covers_exactly(d, &meet));
            if !meet_present {
                return failf!(
                    ErrorKind::AmbiguousOverload,
                    at,
                    "ambiguous overloads of `{}`: {} vs {}; define the meet {} to disambiguate",
                    self.names.str(name),
                    self.types.display_domain(ta, &self.names),
                    self.types.display_domain(tb, &self.names),
                    self.types.display_domain(&meet, &self.names)
                );
            }
            return Ok(PairOutcome::Compatible);
        }
        if a_more && !self.types.subtype_of(a.return_type, b.return_type) {
            return failf!(
                ErrorKind::AmbiguousOverload,
                at,
                "overload {} of `{}` has more specific arguments than {} but not a more specific or equal result: {} vs {}",
                self.types.display_domain(ta, &self.names),
                self.names.str(name),
                self.types.display_domain(tb, &self.names),
                self.types.display(a.return_type, &self.names),
                self.types.display(b.return_type, &self.names)
            );
        }
        if b_more && !self.types.subtype_of(b.return_type, a.return_type) {
            return failf!(
                ErrorKind::AmbiguousOverload,
                at,
                "overload {} of `{}` has more specific arguments than {} but not a more specific or equal result: {} vs {}",
                self.types.display_domain(tb, &self.names),
                self.names.str(name),
                self.types.display_domain(ta, &self.names),
                self.types.display(b.return_type, &self.names),
                self.types.display(a.return_type, &self.names)
            );
        }
        Ok(PairOutcome::Compatible)
    }

    /// Does `domain` accept exactly the aligned type list `args` position
    /// for position? Used for the exact-member meet check.
    fn domain_covers_exactly(&self, domain: &[TypeId], args: &[TypeId]) -> bool {
        let has_rest = self.types.domain_has_rest(domain);
        let fixed = domain.len() - has_rest as usize;
        if !has_rest && domain.len() != args.len() {
            return false;
        }
        if has_rest && args.len() < fixed {
            return false;
        }
        args.iter().enumerate().all(|(i, &t)| self.types.clamped(domain, i) == Some(t))
    }

    //
    // Dispatch
    //

    /// Most-specific member for these argument values, memoized by their
    /// runtime types.
    pub fn best_match(&mut self, set: CallableId, args: &[Value], at: At) -> EvalResult<CallableId> {
        let key = self.arg_types(args);
        let (finished, cached, name) = match self.callables.get(set) {
            Callable::Overloaded(o) => (o.is_finished(), o.cache.get(&key).copied(), o.name),
            other => return bugf!(at, "best_match on a {}", other.kind_name()),
        };
        if let Some(hit) = cached {
            trace!("dispatch cache hit for `{}`", self.names.str(name));
            return Ok(hit);
        }
        if !finished {
            self.finalize_overloads(set, at)?;
        }
        self.counters.dispatch_scans += 1;
        let members = match self.callables.get(set) {
            Callable::Overloaded(o) => o.members.clone(),
            _ => return bugf!(at, "overload set changed kind"),
        };
        let mut survivors: Vec<(CallableId, Vec<TypeId>)> = Vec::new();
        for m in &members {
            let cand = match self.callables.get(*m) {
                Callable::Generic(_) => match self.infer_instantiation(*m, &key, at) {
                    Ok(type_args) => match self.instantiate(*m, &type_args, at) {
                        Ok(c) => c,
                        // A bound violation just disqualifies this candidate
                        Err(e) if e.kind == ErrorKind::TypeMismatch => {
                            trace!("candidate `{}` excluded: {}", self.names.str(name), e.message);
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                    Err(e) if e.kind == ErrorKind::UnificationFailure => {
                        trace!("candidate `{}` excluded: {}", self.names.str(name), e.message);
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                _ => *m,
            };
            let Some(sig) = self.signature_of(cand) else {
                return bugf!(
                    at,
                    "overload member `{}` was never finish-initialized",
                    self.names.str(self.as_method_name(cand))
                );
            };
            let domain = sig.domain();
            if !self.args_match_domain(&domain, &key) {
                continue;
            }
            survivors.push((cand, domain));
        }
        if survivors.is_empty() {
            let described = members.iter().map(|&m| self.describe_member(m, at)).join(", ");
            return failf!(
                ErrorKind::DispatchFailure,
                at,
                "no overload of `{}` matches argument types {}; members: [{}]",
                self.names.str(name),
                self.types.display_domain(&key, &self.names),
                described
            );
        }
        let mut best = 0;
        for i in 1..survivors.len() {
            if self.domain_more_specific(&survivors[i].1, &survivors[best].1, key.len()) {
                best = i;
            }
        }
        for (i, s) in survivors.iter().enumerate() {
            if i == best {
                continue;
            }
            if !self.domain_more_specific_or_equal(&survivors[best].1, &s.1, key.len()) {
                return failf!(
                    ErrorKind::AmbiguousOverload,
                    at,
                    "dispatch of `{}` with {} is ambiguous between {} and {}",
                    self.names.str(name),
                    self.types.display_domain(&key, &self.names),
                    self.types.display_domain(&survivors[best].1, &self.names),
                    self.types.display_domain(&s.1, &self.names)
                );
            }
        }
        let winner = survivors[best].0;
        let Callable::Overloaded(o) = self.callables.get_mut(set) else {
            return bugf!(at, "overload set changed kind");
        };
        // Publish if absent; a re-entrant fill wins and ours is discarded
        let chosen = *o.cache.entry(key).or_insert(winner);
        Ok(chosen)
    }

    fn domain_more_specific_or_equal(&self, a: &[TypeId], b: &[TypeId], nargs: usize) -> bool {
        (0..nargs).all(|i| match (self.types.clamped(a, i), self.types.clamped(b, i)) {
            (Some(x), Some(y)) => self.types.subtype_of(x, y),
            _ => false,
        })
    }

    fn domain_more_specific(&self, a: &[TypeId], b: &[TypeId], nargs: usize) -> bool {
        if !self.domain_more_specific_or_equal(a, b, nargs) {
            return false;
        }
        let strict = (0..nargs).any(|i| {
            match (self.types.clamped(a, i), self.types.clamped(b, i)) {
                (Some(x), Some(y)) => x != y,
                _ => false,
            }
        });
        // An exact-arity signature beats a rest signature it ties with
        strict || (!self.types.domain_has_rest(a) && self.types.domain_has_rest(b))
    }

    fn describe_member(&mut self, m: CallableId, at: At) -> String {
        let name = self.names.str(self.as_method_name(m)).to_string();
        match self.get_domain(m, at) {
            Ok(d) => format!("{}{}", name, self.types.display_domain(&d, &self.names)),
            Err(_) => format!("{name}(?)"),
        }
    }

    pub(crate) fn apply_overloaded(
        &mut self,
        set: CallableId,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        let winner = self.best_match(set, args, at)?;
        self.apply_resolved(winner, args, at)
    }

    /// Invoke a dispatch winner. Functional methods resolve a second time
    /// against the self argument's concrete runtime type before running.
    pub(crate) fn apply_resolved(
        &mut self,
        winner: CallableId,
        args: &[Value],
        at: At,
    ) -> EvalResult<Value> {
        match self.callables.get(winner) {
            Callable::Method(m) if m.self_index.is_some() => {
                self.apply_functional(winner, args, at)
            }
            Callable::Ctor(_) => self.apply_constructor(winner, args, at),
            _ => self.apply_single(winner, args, at, None),
        }
    }
}
