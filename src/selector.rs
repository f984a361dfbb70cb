//! Endpoint selection over a listing.
//!
//! Both strategies are pure functions of the listing they are given; the only state is
//! the round-robin counter, which is shared by every name a [`Center`](crate::Center)
//! serves.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::service::Service;

/// Seed of the routing hash. Changing it reshuffles every consistent-hash route.
pub const HASH_SEED: u32 = 37;

/// Cyclic selection driven by one counter shared across names.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Creates a selector whose first pick is index `1 % len`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a selector whose counter starts at `value`; the first pick is
    /// `(value + 1) % len`.
    #[must_use]
    pub fn starting_at(value: usize) -> Self {
        Self {
            counter: AtomicUsize::new(value),
        }
    }

    /// Advances the counter and picks from `services`. `None` when the list is empty,
    /// in which case the counter is left alone.
    pub fn pick<'a>(&self, services: &'a [Service]) -> Option<&'a Service> {
        if services.is_empty() {
            return None;
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        services.get(n % services.len())
    }
}

/// Picks the service that `key` routes to. `None` when the list is empty.
#[must_use]
pub fn pick_by_key<'a>(services: &'a [Service], key: &str) -> Option<&'a Service> {
    if services.is_empty() {
        return None;
    }

    let slot = usize::try_from(route_hash(key.as_bytes())).ok()?;
    services.get(slot % services.len())
}

/// Routing hash of `key`: MurmurHash3 x86-32 with [`HASH_SEED`], byte-swapped.
///
/// Independent processes sharing a key space must agree on this value, so it is fixed
/// bit for bit.
#[must_use]
pub fn route_hash(key: &[u8]) -> u32 {
    murmur3_32(key, HASH_SEED).swap_bytes()
}

/// MurmurHash3, x86 32-bit variant.
#[must_use]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut blocks = data.chunks_exact(4);

    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_k(k, C1, C2);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= u32::from(*byte) << (8 * i);
        }
        h ^= mix_k(k, C1, C2);
    }

    // The reference mixes in the length modulo 2^32.
    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;
    h ^= len;

    fmix32(h)
}

fn mix_k(k: u32, c1: u32, c2: u32) -> u32 {
    k.wrapping_mul(c1).rotate_left(15).wrapping_mul(c2)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
