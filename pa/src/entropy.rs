// Copyright 2022 Oxide Computer Company

use rand::RngCore;

/// Random material needed by the assignment machinery: a uniform 32-bit
/// source for backoff windows and candidate picks, and a keyed
/// pseudo-random hash for reproducible prefix tentatives.
pub trait RandomSource {
    fn random(&mut self) -> u32;

    /// 16 pseudo-random bytes derived from (seed, ctr0, ctr1). The same
    /// inputs yield the same bytes on every node, which lets routers with
    /// the same seed converge on the same tentatives.
    fn prand(&mut self, seed: &[u8], ctr0: u32, ctr1: u32) -> [u8; 16];
}

/// Default source: thread RNG plus an MD5-based hash, the classic
/// construction md5(seed || ctr0 || ctr1).
pub struct DefaultRandom;

impl RandomSource for DefaultRandom {
    fn random(&mut self) -> u32 {
        rand::thread_rng().next_u32()
    }

    fn prand(&mut self, seed: &[u8], ctr0: u32, ctr1: u32) -> [u8; 16] {
        md5_prand(seed, ctr0, ctr1)
    }
}

pub fn md5_prand(seed: &[u8], ctr0: u32, ctr1: u32) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    ctx.consume(seed);
    ctx.consume(ctr0.to_be_bytes());
    ctx.consume(ctr1.to_be_bytes());
    ctx.compute().0
}
