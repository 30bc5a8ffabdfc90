//! Time and randomness providers.
//!
//! Everything the engine reads from the environment goes through these
//! traits, so a cell of peers can run inside one process with virtual time
//! and seeded randomness.
//!
//! | Provider | Production | Tests |
//! |---|---|---|
//! | [`TimeProvider`] | [`TokioTimeProvider`] | [`TokioTimeProvider`] under `start_paused` |
//! | [`RandomProvider`] | [`TokioRandomProvider`] | [`SeededRandomProvider`] |
//!
//! The [`Providers`] bundle carries both as associated types so components
//! take a single type parameter.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::distr::uniform::SampleUniform;
use rand::distr::{Distribution, StandardUniform};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic time elapsed since the provider was created.
    ///
    /// Leases and timeouts are computed against this clock.
    fn now(&self) -> Duration;

    /// Wall-clock time since the unix epoch.
    ///
    /// Only used to stamp mutations; never compared for safety.
    fn wall_time(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Err(TimeError::Elapsed)` if it does not complete in time.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>;
}

/// Time provider backed by tokio's clock.
///
/// Uses `tokio::time::Instant`, so a runtime started with paused time
/// drives leases and timeouts virtually.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn wall_time(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}

/// Provider trait for random number generation.
pub trait RandomProvider: Clone {
    /// Generate a random value of type T.
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>;

    /// Generate a random value within `start..end`.
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd;

    /// Generate a random bool with the given probability of being true.
    fn random_bool(&self, probability: f64) -> bool;
}

/// Production random provider using the thread-local RNG.
#[derive(Debug, Clone, Default)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

impl RandomProvider for TokioRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        rand::rng().random()
    }

    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        rand::rng().random_range(range)
    }

    fn random_bool(&self, probability: f64) -> bool {
        rand::rng().random_bool(probability.clamp(0.0, 1.0))
    }
}

/// Deterministic random provider.
///
/// Clones share one `ChaCha8Rng` stream, so a peer built from a seed draws
/// the same random seeds for its mutations on every run.
#[derive(Debug, Clone)]
pub struct SeededRandomProvider {
    rng: Rc<RefCell<ChaCha8Rng>>,
}

impl SeededRandomProvider {
    /// Create a provider seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }
}

impl RandomProvider for SeededRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        self.rng.borrow_mut().random()
    }

    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        self.rng.borrow_mut().random_range(range)
    }

    fn random_bool(&self, probability: f64) -> bool {
        self.rng.borrow_mut().random_bool(probability.clamp(0.0, 1.0))
    }
}

/// Bundle of the provider types used by one peer.
pub trait Providers: Clone + 'static {
    /// Time provider type.
    type Time: TimeProvider + 'static;

    /// Random provider type.
    type Random: RandomProvider + 'static;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the random provider instance.
    fn random(&self) -> &Self::Random;
}

/// Production providers.
#[derive(Debug, Clone, Default)]
pub struct TokioProviders {
    time: TokioTimeProvider,
    random: TokioRandomProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Providers for TokioProviders {
    type Time = TokioTimeProvider;
    type Random = TokioRandomProvider;

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}

/// Tokio time with seeded randomness, for reproducible tests.
#[derive(Debug, Clone)]
pub struct SeededProviders {
    time: TokioTimeProvider,
    random: SeededRandomProvider,
}

impl SeededProviders {
    /// Create a bundle whose randomness is derived from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            time: TokioTimeProvider::new(),
            random: SeededRandomProvider::new(seed),
        }
    }
}

impl Providers for SeededProviders {
    type Time = TokioTimeProvider;
    type Random = SeededRandomProvider;

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}
