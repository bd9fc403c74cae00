// Copyright (c) 2025 knix
// All rights reserved.

use std::num::NonZeroU32;

/// Append-only arena. Handles are 1-based NonZeroU32 newtypes so that
/// Option<Handle> stays word-sized.
pub struct Pool<T, Index: Into<NonZeroU32> + From<NonZeroU32>> {
    vec: Vec<T>,
    name: &'static str,
    _index: std::marker::PhantomData<Index>,
}

impl<T, Index: Into<NonZeroU32> + From<NonZeroU32>> Pool<T, Index> {
    pub fn make(name: &'static str) -> Pool<T, Index> {
        Pool { name, vec: Vec::new(), _index: std::marker::PhantomData }
    }

    pub fn make_with_hint(name: &'static str, capacity: usize) -> Pool<T, Index> {
        Pool { name, vec: Vec::with_capacity(capacity), _index: std::marker::PhantomData }
    }

    pub fn next_id(&self) -> Index {
        let index = NonZeroU32::new(self.vec.len() as u32 + 1).unwrap();
        Index::from(index)
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    pub fn add(&mut self, t: T) -> Index {
        #[cfg(debug_assertions)]
        let cap = self.vec.capacity();

        let index = self.next_id();
        self.vec.push(t);

        #[cfg(debug_assertions)]
        {
            let new_cap = self.vec.capacity();
            if new_cap != cap {
                log::trace!("pool {} resized {cap} -> {new_cap}", self.name)
            }
        }

        index
    }

    fn actual_index(index: Index) -> usize {
        let nz32: NonZeroU32 = index.into();
        nz32.get() as usize - 1
    }

    pub fn get(&self, index: Index) -> &T {
        &self.vec[Self::actual_index(index)]
    }

    pub fn get_mut(&mut self, index: Index) -> &mut T {
        &mut self.vec[Self::actual_index(index)]
    }

    pub fn iter(&self) -> std::slice::Iter<T> {
        self.vec.iter()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = Index> {
        (1..=self.vec.len() as u32).map(|i| Index::from(NonZeroU32::new(i).unwrap()))
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU32;

    use super::Pool;

    #[test]
    fn single() {
        let mut pool: Pool<i32, NonZeroU32> = Pool::make("single");
        let handle: NonZeroU32 = pool.add(42);
        assert_eq!(*pool.get(handle), 42);
    }

    #[test]
    fn handles_are_one_based() {
        let mut pool: Pool<&str, NonZeroU32> = Pool::make("one_based");
        let first = pool.add("a");
        let second = pool.add("b");
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);
        assert_eq!(*pool.get(second), "b");
    }

    #[test]
    fn iter_ids_matches_iter() {
        let mut pool: Pool<i32, NonZeroU32> = Pool::make("iter_ids");
        pool.add(10);
        pool.add(20);
        let pairs: Vec<(NonZeroU32, i32)> = pool.iter_ids().zip(pool.iter().copied()).collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(*pool.get(pairs[1].0), 20);
    }
}
