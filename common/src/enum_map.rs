use crate::MakeNamed;
use std::ops::{IndexMut, Index};

/// Dense map with exactly one slot per variant of `E`
pub struct EnumMap<T, E>
    where
        E: MakeNamed,
{
    contents: Box<[T]>,
    _names: std::marker::PhantomData<fn(E)>,
}

impl<T, E> EnumMap<T, E>
    where
        E: MakeNamed,
{
    pub fn new() -> EnumMap<T, E>
    where
        T: Default,
    {
        Self::from_fn(|_| T::default())
    }

    pub fn from_fn<F>(f: F) -> EnumMap<T, E>
    where
        F: FnMut(E) -> T,
    {
        EnumMap {
            contents: E::iter().map(f).collect(),
            _names: std::marker::PhantomData,
        }
    }

    /// Returns the iter of this [`EnumMap<T, E>`].
    pub fn iter(&self) -> EnumMapIterator<'_, T, E> {
        EnumMapIterator {
            pos: 0,
            map: self,
        }
    }
}

impl<T, E> Default for EnumMap<T, E>
    where
        E: MakeNamed,
        T: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

pub struct EnumMapIterator<'a, T, E>
    where
        E: MakeNamed,
{
    pos: usize,
    map: &'a EnumMap<T, E>,
}

impl<'a, T, E> Iterator for EnumMapIterator<'a, T, E>
    where
        E: MakeNamed,
{
    type Item = (E, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let i: usize = self.pos;
        if i < E::COUNT {
            self.pos = i + 1;
            Some((i.into(), &self.map.contents[i]))
        } else {
            None
        }
    }
}

impl<T, E> Index<E> for EnumMap<T, E>
    where
        E: MakeNamed,
{
    type Output = T;
    fn index(&self, id: E) -> &T {
        &self.contents[id.into()]
    }
}

impl<T, E> IndexMut<E> for EnumMap<T, E>
    where
        E: MakeNamed,
{
    fn index_mut(&mut self, id: E) -> &mut T {
        &mut self.contents[id.into()]
    }
}

#[cfg(test)]
mod tests {
    use crate::{EnumMap, MakeNamed, Named};

    #[derive(PartialEq, Eq, Copy, Clone, Debug, Named)]
    enum Parts {
        #[named(required)]
        Alpha,
        #[named(name = "second")]
        Beta,
        Gamma,
    }

    #[test]
    fn derive_counts_and_names() {
        assert_eq!(Parts::COUNT, 3);
        assert_eq!(Parts::Alpha.name(), "alpha");
        assert_eq!(Parts::Beta.name(), "second");
        assert!(Parts::Alpha.required());
        assert!(!Parts::Gamma.required());
        assert_eq!(Parts::iter().collect::<Vec<_>>(), vec![Parts::Alpha, Parts::Beta, Parts::Gamma]);
    }

    #[test]
    fn map_has_one_slot_per_variant() {
        let mut map: EnumMap<u32, Parts> = EnumMap::new();
        map[Parts::Gamma] = 7;
        map[Parts::Alpha] += 1;

        let collected: Vec<_> = map.iter().map(|(id, v)| (id, *v)).collect();
        assert_eq!(collected, vec![(Parts::Alpha, 1), (Parts::Beta, 0), (Parts::Gamma, 7)]);
    }
}
