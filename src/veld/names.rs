// Copyright (c) 2025 knix
// All rights reserved.

use std::fmt::{Display, Formatter};

use string_interner::{Symbol, backend::StringBackend};

/// Interned identifier. Equality and hashing are symbol equality; the
/// backing string lives in the NamePool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Name(string_interner::symbol::SymbolU32);

impl Ord for Name {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Name> for usize {
    fn from(value: Name) -> Self {
        value.0.to_usize()
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_usize())
    }
}

/// Source attribution for definitions, calls, and errors. The front end
/// hands these out; 0 means "no usable location".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct At(pub u32);

impl At {
    pub const NOWHERE: At = At(0);
}

impl Display for At {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 { f.write_str("<no location>") } else { write!(f, "loc:{}", self.0) }
    }
}

#[allow(non_snake_case)]
pub struct BuiltinNames {
    pub self_: Name,
    pub parent: Name,
    pub rest: Name,
    pub Any: Name,
    pub Bottom: Name,
    pub Unit: Name,
    pub Boolean: Name,
    pub Char: Name,
    pub String: Name,
    pub Number: Name,
    pub ZZ64: Name,
    pub ZZ32: Name,
    pub RR64: Name,
}

// We use the default StringInterner, which uses a contiguous string as its backend
pub struct NamePool {
    intern_pool: string_interner::StringInterner<StringBackend>,
    pub b: BuiltinNames,
}

impl NamePool {
    pub fn make() -> NamePool {
        let mut pool = string_interner::StringInterner::with_capacity(4096);
        let mut intern = |s: &str| Name(pool.get_or_intern(s));
        let b = BuiltinNames {
            self_: intern("self"),
            parent: intern("parent"),
            rest: intern("rest"),
            Any: intern("Any"),
            Bottom: intern("Bottom"),
            Unit: intern("()"),
            Boolean: intern("Boolean"),
            Char: intern("Char"),
            String: intern("String"),
            Number: intern("Number"),
            ZZ64: intern("ZZ64"),
            ZZ32: intern("ZZ32"),
            RR64: intern("RR64"),
        };
        NamePool { intern_pool: pool, b }
    }

    pub fn intern(&mut self, s: impl AsRef<str>) -> Name {
        Name(self.intern_pool.get_or_intern(s.as_ref()))
    }

    pub fn get(&self, s: impl AsRef<str>) -> Option<Name> {
        self.intern_pool.get(s.as_ref()).map(Name)
    }

    pub fn str(&self, name: Name) -> &str {
        self.intern_pool.resolve(name.0).expect("name was not interned by this pool")
    }
}
