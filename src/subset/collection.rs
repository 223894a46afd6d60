//! Keyed container of subsets sharing a resource kind on one NUMA node
//! (spec §3 `SubsetCollection`), grounded on the original's
//! `SubsetCollection` (`schedulerlocal/subset/subset.py`).

use std::collections::BTreeMap;

/// Subsets are keyed by their oversubscription ratio, encoded as the
/// `f64`'s bit pattern so the map stays `Ord`/`Eq` without pulling in a
/// float-ordering crate. Ratios only ever come from parsed config, so the
/// same ratio always produces the same bits.
fn ratio_key(ratio: f64) -> u64 {
    ratio.to_bits()
}

#[derive(Debug, Default)]
pub struct SubsetCollection<S> {
    subsets: BTreeMap<u64, S>,
}

impl<S> SubsetCollection<S> {
    pub fn new() -> Self {
        Self { subsets: BTreeMap::new() }
    }

    pub fn add(&mut self, ratio: f64, subset: S) {
        self.subsets.insert(ratio_key(ratio), subset);
    }

    pub fn remove(&mut self, ratio: f64) -> Option<S> {
        self.subsets.remove(&ratio_key(ratio))
    }

    pub fn get(&self, ratio: f64) -> Option<&S> {
        self.subsets.get(&ratio_key(ratio))
    }

    pub fn get_mut(&mut self, ratio: f64) -> Option<&mut S> {
        self.subsets.get_mut(&ratio_key(ratio))
    }

    pub fn contains(&self, ratio: f64) -> bool {
        self.subsets.contains_key(&ratio_key(ratio))
    }

    pub fn len(&self) -> usize {
        self.subsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &S> {
        self.subsets.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.subsets.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_by_ratio() {
        let mut c: SubsetCollection<u32> = SubsetCollection::new();
        c.add(3.0, 7);
        assert_eq!(c.get(3.0), Some(&7));
        assert!(c.contains(3.0));
        assert_eq!(c.remove(3.0), Some(7));
        assert!(!c.contains(3.0));
    }
}
