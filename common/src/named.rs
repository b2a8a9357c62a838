use std::marker::PhantomData;

/// An enum naming a fixed set of things (machine components, interrupt lines...), usually
/// implemented with `#[derive(Named)]`.
pub trait MakeNamed : From<usize> + Into<usize> + PartialEq + Copy + 'static + std::fmt::Debug
{
    const COUNT: usize;

    fn name(self) -> &'static str;

    /// Whether a machine refuses to start without this entry being filled in
    fn required(self) -> bool {
        false
    }

    fn iter() -> NamedIterator<Self> where Self: Sized {
        NamedIterator {
            pos: 0,
            e_type: PhantomData::<*const Self>,
        }
    }
}

pub struct NamedIterator<E> {
    pos: usize,
    e_type: PhantomData<*const E>,
}

impl<E> Iterator for NamedIterator<E> where E: MakeNamed {
    type Item = E;

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        let i: usize = self.pos;
        if i < E::COUNT {
            self.pos = i + 1;
            Some(i.into())
        } else {
            None
        }
    }
}
