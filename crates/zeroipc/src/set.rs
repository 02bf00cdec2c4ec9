//! Bounded hash set: a value-less view over [`Map`].
//!
//! The algebraic derivations build a new set by iterating a snapshot of the
//! operands, so they reflect some point-in-time state of each side.

use crate::error::Result;
use crate::map::Map;
use crate::pod::Key;
use crate::segment::Segment;

/// Named bounded lock-free hash set.
pub struct Set<T: Key> {
    map: Map<T, ()>,
}

impl<T: Key> Clone for Set<T> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T: Key> Set<T> {
    /// Create a set with `capacity` slots.
    pub fn create(segment: &Segment, name: &str, capacity: usize) -> Result<Self> {
        Ok(Self {
            map: Map::create(segment, name, capacity)?,
        })
    }

    /// Open an existing set, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        Ok(Self {
            map: Map::open(segment, name)?,
        })
    }

    /// Insert `value`. Returns `true` if it was newly inserted, `false` if
    /// it was already present (idempotent; the size does not change).
    pub fn insert(&self, value: &T) -> Result<bool> {
        self.map.insert(value, &())
    }

    /// Whether `value` is present.
    pub fn contains(&self, value: &T) -> bool {
        self.map.contains(value)
    }

    /// Remove `value`. Returns whether it was present.
    pub fn erase(&self, value: &T) -> bool {
        self.map.erase(value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Snapshot of the elements.
    pub fn elements(&self) -> Vec<T> {
        self.map.entries().into_iter().map(|(k, ())| k).collect()
    }

    /// Iterate over a snapshot of the elements.
    pub fn iter(&self) -> impl Iterator<Item = T> {
        self.elements().into_iter()
    }

    /// Build `self ∪ other` as a new set named `name`.
    pub fn union(
        &self,
        other: &Set<T>,
        segment: &Segment,
        name: &str,
        capacity: usize,
    ) -> Result<Set<T>> {
        let out = Set::create(segment, name, capacity)?;
        for v in self.iter().chain(other.iter()) {
            out.insert(&v)?;
        }
        Ok(out)
    }

    /// Build `self ∩ other` as a new set named `name`.
    pub fn intersection(
        &self,
        other: &Set<T>,
        segment: &Segment,
        name: &str,
        capacity: usize,
    ) -> Result<Set<T>> {
        let out = Set::create(segment, name, capacity)?;
        for v in self.iter().filter(|v| other.contains(v)) {
            out.insert(&v)?;
        }
        Ok(out)
    }

    /// Build `self ∖ other` as a new set named `name`.
    pub fn difference(
        &self,
        other: &Set<T>,
        segment: &Segment,
        name: &str,
        capacity: usize,
    ) -> Result<Set<T>> {
        let out = Set::create(segment, name, capacity)?;
        for v in self.iter().filter(|v| !other.contains(v)) {
            out.insert(&v)?;
        }
        Ok(out)
    }

    /// Whether every element of `self` is in `other`.
    pub fn is_subset_of(&self, other: &Set<T>) -> bool {
        self.iter().all(|v| other.contains(&v))
    }

    /// Whether `self` and `other` share no element.
    pub fn is_disjoint(&self, other: &Set<T>) -> bool {
        self.iter().all(|v| !other.contains(&v))
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        self.map.segment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestSegment;

    #[test]
    fn test_insert_is_idempotent() {
        let shm = TestSegment::new("set_idem");
        let set = Set::<u32>::create(&shm, "s", 16).unwrap();

        assert!(set.insert(&5).unwrap());
        assert!(!set.insert(&5).unwrap());
        assert_eq!(set.len(), 1);
        assert!(set.contains(&5));
        assert!(!set.contains(&6));
    }

    #[test]
    fn test_erase() {
        let shm = TestSegment::new("set_erase");
        let set = Set::<u64>::create(&shm, "s", 8).unwrap();
        set.insert(&1).unwrap();
        assert!(set.erase(&1));
        assert!(!set.erase(&1));
        assert!(set.is_empty());
    }

    #[test]
    fn test_algebra() {
        let shm = TestSegment::new("set_alg");
        let a = Set::<u32>::create(&shm, "a", 16).unwrap();
        let b = Set::<u32>::create(&shm, "b", 16).unwrap();
        for v in [1, 2, 3] {
            a.insert(&v).unwrap();
        }
        for v in [2, 3, 4] {
            b.insert(&v).unwrap();
        }

        let union = a.union(&b, &shm, "u", 16).unwrap();
        let inter = a.intersection(&b, &shm, "i", 16).unwrap();
        let diff = a.difference(&b, &shm, "d", 16).unwrap();

        let sorted = |s: &Set<u32>| {
            let mut v = s.elements();
            v.sort_unstable();
            v
        };
        assert_eq!(sorted(&union), vec![1, 2, 3, 4]);
        assert_eq!(sorted(&inter), vec![2, 3]);
        assert_eq!(sorted(&diff), vec![1]);

        assert!(inter.is_subset_of(&a));
        assert!(inter.is_subset_of(&b));
        assert!(!a.is_subset_of(&b));
        assert!(diff.is_disjoint(&b));
        assert!(!a.is_disjoint(&b));
    }
}
