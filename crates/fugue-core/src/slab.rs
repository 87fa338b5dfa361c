// src/slab.rs

/// Readiness token: `(generation << 32) | index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

impl Token {
    #[inline(always)]
    fn new(index: usize, generation: u32) -> Self {
        Token(((generation as u64) << 32) | index as u64)
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline(always)]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

enum Entry<T> {
    Free { next: Option<usize> },
    Occupied(T),
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

/// Per-worker connection table with an intrusive free list.
///
/// Slots are created lazily up to `capacity` and recycled afterwards. Each
/// reuse bumps the slot generation so tokens of freed entries go stale.
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    head_free: Option<usize>,
    active_count: usize,
    capacity: usize,
}

impl<T> Slab<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// O(1) allocation. Returns `None` once `capacity` slots are live.
    #[inline(always)]
    pub fn insert(&mut self, value: T) -> Option<Token> {
        if let Some(idx) = self.head_free {
            let slot = &mut self.slots[idx];
            if let Entry::Free { next } = slot.entry {
                self.head_free = next;
            }
            slot.entry = Entry::Occupied(value);
            self.active_count += 1;
            return Some(Token::new(idx, slot.generation));
        }

        if self.slots.len() >= self.capacity {
            return None;
        }

        let idx = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            entry: Entry::Occupied(value),
        });
        self.active_count += 1;
        Some(Token::new(idx, 0))
    }

    /// The token the next [`insert`](Self::insert) will return, so a value
    /// can be built knowing its own token.
    pub fn vacant_token(&self) -> Option<Token> {
        if let Some(idx) = self.head_free {
            return Some(Token::new(idx, self.slots[idx].generation));
        }
        if self.slots.len() >= self.capacity {
            return None;
        }
        Some(Token::new(self.slots.len(), 0))
    }

    /// O(1) deallocation. Stale or already-freed tokens return `None`.
    #[inline(always)]
    pub fn remove(&mut self, token: Token) -> Option<T> {
        let idx = token.index();
        let slot = self.slots.get_mut(idx)?;
        if slot.generation != token.generation() || matches!(slot.entry, Entry::Free { .. }) {
            return None;
        }

        let old = std::mem::replace(&mut slot.entry, Entry::Free { next: self.head_free });
        slot.generation = slot.generation.wrapping_add(1);
        self.head_free = Some(idx);
        self.active_count -= 1;

        match old {
            Entry::Occupied(value) => Some(value),
            Entry::Free { .. } => None,
        }
    }

    #[inline(always)]
    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        let slot = self.slots.get_mut(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        match &mut slot.entry {
            Entry::Occupied(value) => Some(value),
            Entry::Free { .. } => None,
        }
    }

    #[inline(always)]
    pub fn get(&self, token: Token) -> Option<&T> {
        let slot = self.slots.get(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        match &slot.entry {
            Entry::Occupied(value) => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Tokens of every live entry.
    pub fn tokens(&self) -> Vec<Token> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.entry, Entry::Occupied(_)))
            .map(|(idx, slot)| Token::new(idx, slot.generation))
            .collect()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab = Slab::new(10);

        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 10);

        let t1 = slab.insert(100).unwrap();
        assert_eq!(t1.index(), 0);
        assert_eq!(slab.get(t1), Some(&100));

        let t2 = slab.insert(101).unwrap();
        assert_eq!(t2.index(), 1);

        assert_eq!(slab.remove(t1), Some(100));
        assert_eq!(slab.len(), 1);

        // Index 0 is reused since it sits at the head of the free list
        let t3 = slab.insert(102).unwrap();
        assert_eq!(t3.index(), 0);
        assert_ne!(t3, t1);
    }

    #[test]
    fn test_stale_token_is_ignored() {
        let mut slab = Slab::new(4);
        let old = slab.insert("first").unwrap();
        slab.remove(old);
        let new = slab.insert("second").unwrap();

        assert_eq!(old.index(), new.index());
        assert!(slab.get_mut(old).is_none());
        assert!(slab.remove(old).is_none());
        assert_eq!(slab.get(new), Some(&"second"));
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut slab = Slab::new(2);
        let t = slab.insert(1).unwrap();
        assert_eq!(slab.remove(t), Some(1));
        assert_eq!(slab.remove(t), None);
        assert!(slab.is_empty());
    }

    #[test]
    fn test_vacant_token_predicts_insert() {
        let mut slab = Slab::new(2);
        let predicted = slab.vacant_token().unwrap();
        let a = slab.insert(1).unwrap();
        assert_eq!(predicted, a);

        slab.remove(a);
        let predicted = slab.vacant_token().unwrap();
        assert_eq!(predicted.index(), a.index());
        assert_ne!(predicted, a);
        assert_eq!(slab.insert(2), Some(predicted));

        slab.insert(3).unwrap();
        assert!(slab.vacant_token().is_none());
    }

    #[test]
    fn test_capacity_bound() {
        let mut slab = Slab::new(2);
        let a = slab.insert('a').unwrap();
        slab.insert('b').unwrap();
        assert!(slab.insert('c').is_none());

        slab.remove(a);
        assert!(slab.insert('c').is_some());
        assert_eq!(slab.tokens().len(), 2);
    }
}
