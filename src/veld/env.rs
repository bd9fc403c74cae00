// Copyright (c) 2025 knix
// All rights reserved.

use std::num::NonZeroU32;

use ahash::HashMapExt;
use fxhash::FxHashMap;
use itertools::Itertools;

use crate::names::{At, Name};
use crate::nz_u32_id;
use crate::pool::Pool;
use crate::types::TypeId;
use crate::values::Value;

nz_u32_id!(EnvId);

#[derive(Debug, Clone)]
pub struct Binding {
    pub value: Value,
    pub declared_type: Option<TypeId>,
}

/// One lexical frame. Frames form parent chains through the arena; a
/// callable captures an EnvId rather than an owning pointer because
/// object construction makes the chains genuinely cyclic (the self
/// frame holds the object whose instance env is that same frame).
pub struct Frame {
    pub parent: Option<EnvId>,
    pub at: At,
    blessed: bool,
    values: FxHashMap<Name, Binding>,
    types: FxHashMap<Name, TypeId>,
}

impl Frame {
    fn make(parent: Option<EnvId>, at: At) -> Frame {
        Frame { parent, at, blessed: false, values: FxHashMap::new(), types: FxHashMap::new() }
    }
}

pub struct Envs {
    frames: Pool<Frame, EnvId>,
    pub global: EnvId,
}

impl Envs {
    pub fn make() -> Envs {
        let mut frames = Pool::make_with_hint("env_frames", 256);
        let global = frames.add(Frame::make(None, At::NOWHERE));
        Envs { frames, global }
    }

    pub fn extend(&mut self, parent: EnvId) -> EnvId {
        self.extend_at(parent, self.frames.get(parent).at)
    }

    pub fn extend_at(&mut self, parent: EnvId, at: At) -> EnvId {
        self.frames.add(Frame::make(Some(parent), at))
    }

    pub fn parent(&self, env: EnvId) -> Option<EnvId> {
        self.frames.get(env).parent
    }

    /// Freeze a frame. Blessed frames reject ordinary puts; only
    /// put_value_raw (secret bindings) may still write.
    pub fn bless(&mut self, env: EnvId) {
        self.frames.get_mut(env).blessed = true;
    }

    pub fn is_blessed(&self, env: EnvId) -> bool {
        self.frames.get(env).blessed
    }

    pub fn put_value(&mut self, env: EnvId, name: Name, value: Value) {
        let frame = self.frames.get_mut(env);
        debug_assert!(!frame.blessed, "write to a blessed frame");
        frame.values.insert(name, Binding { value, declared_type: None });
    }

    pub fn put_value_typed(&mut self, env: EnvId, name: Name, value: Value, ty: TypeId) {
        let frame = self.frames.get_mut(env);
        debug_assert!(!frame.blessed, "write to a blessed frame");
        frame.values.insert(name, Binding { value, declared_type: Some(ty) });
    }

    /// Unchecked write; installs secret bindings (self, parent) even into
    /// blessed frames.
    pub fn put_value_raw(&mut self, env: EnvId, name: Name, value: Value) {
        self.frames.get_mut(env).values.insert(name, Binding { value, declared_type: None });
    }

    pub fn put_type(&mut self, env: EnvId, name: Name, ty: TypeId) {
        self.frames.get_mut(env).types.insert(name, ty);
    }

    /// Walks the parent chain.
    pub fn get_value(&self, env: EnvId, name: Name) -> Option<Value> {
        let mut current = env;
        loop {
            let frame = self.frames.get(current);
            if let Some(binding) = frame.values.get(&name) {
                return Some(binding.value.clone());
            }
            current = frame.parent?;
        }
    }

    /// This frame only, no parent walk.
    pub fn get_leaf_value(&self, env: EnvId, name: Name) -> Option<Value> {
        self.frames.get(env).values.get(&name).map(|b| b.value.clone())
    }

    pub fn get_type(&self, env: EnvId, name: Name) -> Option<TypeId> {
        let mut current = env;
        loop {
            let frame = self.frames.get(current);
            if let Some(&ty) = frame.types.get(&name) {
                return Some(ty);
            }
            current = frame.parent?;
        }
    }

    /// Names bound in the innermost frame, sorted for deterministic
    /// iteration order.
    pub fn youngest_names(&self, env: EnvId) -> Vec<Name> {
        self.frames.get(env).values.keys().copied().sorted().collect()
    }
}
