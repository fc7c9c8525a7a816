use rand::rngs::StdRng;
use rand::SeedableRng;

/// The run's random source. Owned by the orchestrator and lent to every entry
/// point that needs randomness, so equal seeds give equal runs.
pub fn seeded_rng(seed: u64) -> StdRng {
    tracing::debug!("Using random seed (u64): {}", seed);
    StdRng::seed_from_u64(seed)
}
