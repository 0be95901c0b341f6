use core::hash::{BuildHasherDefault, Hasher};

// Node ids are small sequential integers, so hashing them buys nothing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, _bytes: &[u8]) {
        unimplemented!("IdentityHasher only supports usize keys")
    }

    fn write_usize(&mut self, i: usize) {
        self.0 = i as u64;
    }
}

pub(crate) type BuildIdentityHasher = BuildHasherDefault<IdentityHasher>;
