//! Deterministic splitmix64 PRNG.
//!
//! candle's CPU backend cannot be seeded, so centroid initialisation and
//! the synthetic clip generator draw from this instead.

/// splitmix64 generator.
///
/// # Example
///
/// ```
/// use dcm_core::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let val = rng.next_f32();
/// assert!((0.0..1.0).contains(&val));
/// ```
#[derive(Debug, Clone)]
pub struct SimpleRng(u64);

impl SimpleRng {
    /// Creates a new PRNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Next pseudo-random u64.
    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Uniform f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / ((1u64 << 24) as f32)
    }

    /// Uniform f32 in [lo, hi).
    pub fn next_f32_range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * self.next_f32()
    }

    /// Uniform usize in [0, n). `n` must be non-zero.
    pub fn next_below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    /// Standard normal sample (Box–Muller).
    pub fn next_normal(&mut self) -> f32 {
        let u1 = (1.0 - self.next_f32()).max(f32::MIN_POSITIVE);
        let u2 = self.next_f32();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }

    /// `n` standard normal samples.
    pub fn normal_vec(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.next_normal()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_hits_every_value() {
        let mut rng = SimpleRng::new(3);
        let mut seen = [0usize; 5];
        for _ in 0..1000 {
            seen[rng.next_below(5)] += 1;
        }
        assert!(seen.iter().all(|&c| c > 100), "{seen:?}");
        assert!((0..50).all(|_| rng.next_below(1) == 0));
    }

    #[test]
    fn normal_vec_reproducible_per_seed() {
        let a = SimpleRng::new(9).normal_vec(64);
        assert_eq!(a, SimpleRng::new(9).normal_vec(64));
        assert_ne!(a, SimpleRng::new(10).normal_vec(64));
    }

    #[test]
    fn normal_tails_bounded() {
        // 24-bit uniforms cap the Box-Muller radius at sqrt(2 ln 2^24) < 6
        let mut rng = SimpleRng::new(5);
        assert!((0..100_000).all(|_| rng.next_normal().abs() < 6.0));
    }

    #[test]
    fn normal_roughly_standard() {
        let mut rng = SimpleRng::new(11);
        let samples = rng.normal_vec(10_000);
        assert!(samples.iter().all(|v| v.is_finite()));
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }
}
