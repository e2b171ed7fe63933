//! Bounded single-producer/single-consumer queues between stages.
//!
//! Every [Pipe] of a graph lives in one [Pipes] arena. Stages hold [PipeId]s, small typed handles
//! that are only valid for the arena generation that created them.
use std::{any::TypeId, marker::PhantomData};

use crate::{
    constellation::SoftSymbol,
    dvbs2::{BbFrame, FecFrame, PlSlot},
    packet::{RsPacket, TsPacket},
    Error, Result, Sample,
};

/// Bounded queue with contiguous read and write windows.
///
/// Unread items always occupy `buf[rd..wr]`. Free space is made contiguous by moving the unread
/// items to the front when the write window is requested.
#[derive(Default)]
pub struct Pipe<T> {
    name: &'static str,
    buf: Vec<T>,
    rd: usize,
    wr: usize,
    total_read: u64,
    total_written: u64,
}

impl<T: Clone + Default> Pipe<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Pipe {
            name,
            buf: vec![T::default(); capacity],
            rd: 0,
            wr: 0,
            total_read: 0,
            total_written: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn available_for_read(&self) -> usize {
        self.wr - self.rd
    }

    pub fn available_for_write(&self) -> usize {
        self.buf.len() - self.available_for_read()
    }

    /// Unread items, oldest first.
    pub fn rd(&self) -> &[T] {
        &self.buf[self.rd..self.wr]
    }

    /// Unread items, for stages that move items out instead of copying them.
    pub fn rd_mut(&mut self) -> &mut [T] {
        &mut self.buf[self.rd..self.wr]
    }

    /// Consume `n` items.
    ///
    /// # Panics
    /// If fewer than `n` items are readable.
    pub fn read(&mut self, n: usize) {
        assert!(
            n <= self.available_for_read(),
            "{}: read {n} of {}",
            self.name,
            self.available_for_read()
        );
        self.rd += n;
        self.total_read += n as u64;
        if self.rd == self.wr {
            self.rd = 0;
            self.wr = 0;
        }
    }

    /// Free space, as one contiguous window.
    pub fn wr(&mut self) -> &mut [T] {
        if self.rd > 0 {
            self.buf[..self.wr].rotate_left(self.rd);
            self.wr -= self.rd;
            self.rd = 0;
        }
        &mut self.buf[self.wr..]
    }

    /// Commit `n` items previously placed in [Self::wr].
    ///
    /// # Panics
    /// If `n` exceeds the free space.
    pub fn written(&mut self, n: usize) {
        assert!(
            self.wr + n <= self.buf.len(),
            "{}: wrote {n} past capacity",
            self.name
        );
        self.wr += n;
        self.total_written += n as u64;
    }

    /// Append a single item.
    pub fn write(&mut self, item: T) -> Result<()> {
        if self.available_for_write() == 0 {
            return Err(Error::Overflow);
        }
        self.wr()[0] = item;
        self.written(1);
        Ok(())
    }

    /// Monotonic count of items moved through this pipe, used to detect scheduler progress.
    pub fn activity(&self) -> u64 {
        self.total_read + self.total_written
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }
}

impl<T> std::fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.name)
            .field("capacity", &self.buf.len())
            .field("readable", &(self.wr - self.rd))
            .finish()
    }
}

/// Typed handle to a [Pipe] in a [Pipes] arena.
pub struct PipeId<T> {
    index: usize,
    generation: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for PipeId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PipeId<T> {}

impl<T> std::fmt::Debug for PipeId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PipeId({}@{})", self.index, self.generation)
    }
}

/// Item types that may travel through a pipe.
pub trait PipeItem: Clone + Default + Sized + 'static {
    fn pool(pipes: &Pipes) -> &Vec<Pipe<Self>>;
    fn pool_mut(pipes: &mut Pipes) -> &mut Vec<Pipe<Self>>;
}

macro_rules! pipe_pools {
    ($($field:ident: $ty:ty),* $(,)?) => {
        /// Arena owning every pipe of one graph generation.
        #[derive(Debug, Default)]
        pub struct Pipes {
            generation: u64,
            $($field: Vec<Pipe<$ty>>,)*
        }

        $(
            impl PipeItem for $ty {
                fn pool(pipes: &Pipes) -> &Vec<Pipe<Self>> {
                    &pipes.$field
                }
                fn pool_mut(pipes: &mut Pipes) -> &mut Vec<Pipe<Self>> {
                    &mut pipes.$field
                }
            }
        )*

        impl Pipes {
            /// Sum of [Pipe::activity] over all pipes.
            pub fn activity(&self) -> u64 {
                let mut total = 0;
                $(total += self.$field.iter().map(Pipe::activity).sum::<u64>();)*
                total
            }

            pub fn len(&self) -> usize {
                0 $(+ self.$field.len())*
            }
        }
    };
}

pipe_pools! {
    samples: Sample,
    symbols: SoftSymbol,
    bytes: u8,
    rs_packets: RsPacket,
    ts_packets: TsPacket,
    slots: PlSlot,
    fec_frames: FecFrame,
    bb_frames: BbFrame,
}

impl Pipes {
    pub fn new(generation: u64) -> Self {
        Pipes {
            generation,
            ..Default::default()
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a pipe and return its handle.
    pub fn add<T: PipeItem>(&mut self, name: &'static str, capacity: usize) -> PipeId<T> {
        let pool = T::pool_mut(self);
        pool.push(Pipe::new(name, capacity));
        PipeId {
            index: pool.len() - 1,
            generation: self.generation,
            _item: PhantomData,
        }
    }

    fn check<T>(&self, id: PipeId<T>) {
        assert_eq!(
            id.generation, self.generation,
            "pipe handle from graph generation {} used in generation {}",
            id.generation, self.generation
        );
    }

    /// # Panics
    /// If `id` belongs to another generation.
    pub fn get<T: PipeItem>(&self, id: PipeId<T>) -> &Pipe<T> {
        self.check(id);
        &T::pool(self)[id.index]
    }

    /// # Panics
    /// If `id` belongs to another generation.
    pub fn get_mut<T: PipeItem>(&mut self, id: PipeId<T>) -> &mut Pipe<T> {
        self.check(id);
        &mut T::pool_mut(self)[id.index]
    }

    /// Borrow an input and an output pipe at the same time.
    ///
    /// # Panics
    /// If both ids refer to the same pipe or to another generation.
    pub fn with<A: PipeItem, B: PipeItem, R>(
        &mut self,
        input: PipeId<A>,
        output: PipeId<B>,
        f: impl FnOnce(&mut Pipe<A>, &mut Pipe<B>) -> R,
    ) -> R {
        assert!(
            TypeId::of::<A>() != TypeId::of::<B>() || input.index != output.index,
            "pipe {} used as input and output",
            self.get(output).name
        );
        let mut out = std::mem::take(self.get_mut(output));
        let result = f(self.get_mut(input), &mut out);
        *self.get_mut(output) = out;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_until_overflow() {
        let mut pipe: Pipe<u8> = Pipe::new("test", 4);
        for i in 0..4 {
            pipe.write(i).unwrap();
        }
        assert!(matches!(pipe.write(4), Err(Error::Overflow)));
        assert_eq!(pipe.rd(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_compaction_keeps_order() {
        let mut pipe: Pipe<u8> = Pipe::new("test", 8);
        pipe.wr()[..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        pipe.written(6);
        pipe.read(4);
        assert_eq!(pipe.available_for_write(), 6);

        let window = pipe.wr();
        assert_eq!(window.len(), 6);
        window[..3].copy_from_slice(&[7, 8, 9]);
        pipe.written(3);
        assert_eq!(pipe.rd(), &[5, 6, 7, 8, 9]);
        assert_eq!(pipe.total_written(), 9);
        assert_eq!(pipe.total_read(), 4);
    }

    #[test]
    fn test_arena_pair_access() {
        let mut pipes = Pipes::new(3);
        let a: PipeId<u8> = pipes.add("a", 4);
        let b: PipeId<u8> = pipes.add("b", 4);
        pipes.get_mut(a).write(42).unwrap();

        pipes.with(a, b, |input, output| {
            let v = input.rd()[0];
            input.read(1);
            output.write(v + 1).unwrap();
        });

        assert_eq!(pipes.get(a).available_for_read(), 0);
        assert_eq!(pipes.get(b).rd(), &[43]);
        assert_eq!(pipes.activity(), 3);
    }

    #[test]
    #[should_panic]
    fn test_stale_generation_rejected() {
        let mut old = Pipes::new(1);
        let id: PipeId<u8> = old.add("old", 4);
        let mut new = Pipes::new(2);
        let _: PipeId<u8> = new.add("new", 4);
        new.get(id);
    }
}
