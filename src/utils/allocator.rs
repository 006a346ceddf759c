use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt::Debug, hash::Hash, marker::PhantomData};

/// Slot index with generation tracking to prevent stale references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct GenerationalId {
    pub index: usize,
    pub generation: u32,
}

impl GenerationalId {
    pub fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Typed handle into an [`Arena`].
pub trait ArenaKey: Copy + Eq + Ord + Hash + Debug {
    fn from_raw(raw: GenerationalId) -> Self;
    fn raw(&self) -> GenerationalId;

    fn index(&self) -> usize {
        self.raw().index
    }

    fn generation(&self) -> u32 {
        self.raw().generation
    }
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
        pub struct $name(pub GenerationalId);

        impl $name {
            pub fn new(index: usize, generation: u32) -> Self {
                Self(GenerationalId::new(index, generation))
            }

            pub fn from_index(index: u32) -> Self {
                Self::new(index as usize, 0)
            }
        }

        impl ArenaKey for $name {
            fn from_raw(raw: GenerationalId) -> Self {
                Self(raw)
            }

            fn raw(&self) -> GenerationalId {
                self.0
            }
        }
    };
}

arena_key!(
    /// Handle of a dynamic entity (particle or frame).
    EntityId
);
arena_key!(
    /// Handle of an installed attachment.
    AttachmentId
);
arena_key!(
    /// Handle of a joint.
    JointId
);
arena_key!(
    /// Handle of a coordinate coupling.
    CouplingId
);
arena_key!(
    /// Handle of a collidable mesh.
    CollidableId
);
arena_key!(
    /// Handle of a contact generator.
    GeneratorId
);

/// Generational arena that hands out stable typed handles while preventing use-after-free.
#[derive(Debug, Clone)]
pub struct Arena<T, K: ArenaKey = EntityId> {
    items: Vec<Option<T>>,
    generations: Vec<u32>,
    free_list: VecDeque<usize>,
    _key: PhantomData<K>,
}

impl<T, K: ArenaKey> Default for Arena<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K: ArenaKey> Arena<T, K> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            generations: Vec::new(),
            free_list: VecDeque::new(),
            _key: PhantomData,
        }
    }

    pub fn insert(&mut self, item: T) -> K {
        if let Some(index) = self.free_list.pop_front() {
            let generation = self.generations[index];
            self.items[index] = Some(item);
            return K::from_raw(GenerationalId::new(index, generation));
        }

        let index = self.items.len();
        self.items.push(Some(item));
        self.generations.push(0);
        K::from_raw(GenerationalId::new(index, 0))
    }

    pub fn get(&self, id: K) -> Option<&T> {
        if self.is_valid(id) {
            self.items.get(id.index()).and_then(|slot| slot.as_ref())
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        if self.is_valid(id) {
            self.items.get_mut(id.index()).and_then(|slot| slot.as_mut())
        } else {
            None
        }
    }

    pub fn contains(&self, id: K) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: K) -> Option<T> {
        if !self.is_valid(id) {
            return None;
        }
        let slot = self.items.get_mut(id.index())?;
        if slot.is_some() {
            self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);
            self.free_list.push_back(id.index());
        }
        slot.take()
    }

    /// Iterates live items together with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.items.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|item| {
                (
                    K::from_raw(GenerationalId::new(index, self.generations[index])),
                    item,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> + '_ {
        let generations = &self.generations;
        self.items
            .iter_mut()
            .enumerate()
            .filter_map(move |(index, slot)| {
                slot.as_mut().map(|item| {
                    (
                        K::from_raw(GenerationalId::new(index, generations[index])),
                        item,
                    )
                })
            })
    }

    pub fn ids(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_valid(&self, id: K) -> bool {
        self.generations
            .get(id.index())
            .copied()
            .map(|gen| gen == id.generation())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_handles_go_stale() {
        let mut arena: Arena<&str, JointId> = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.remove(a), Some("a"));
        assert!(arena.get(a).is_none());

        let c = arena.insert("c");
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(c), Some(&"c"));
        assert_eq!(arena.ids().collect::<Vec<_>>(), vec![c, b]);
    }
}
