//! Environment abstraction for deterministic testing.
//!
//! Decouples the delivery core and driver from system resources (wall clock,
//! randomness). Production uses real time and OS entropy; tests use a manual
//! clock and seeded randomness so rotation deadlines and TTL sweeps are
//! reproducible.

use uuid::Uuid;

/// Abstract environment providing wall-clock time and randomness.
///
/// Implementations MUST guarantee:
///
/// - `now_millis()` never decreases within a single execution context
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time as Unix milliseconds.
    ///
    /// Wall time (not a monotonic instant) because event timestamps, TTL
    /// cutoffs, and rotation deadlines are compared against stored values
    /// that survive process restarts.
    fn now_millis(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, for session ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random v4 UUID, for server-originated event ids.
    fn random_event_id(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// Deterministic environment for simulation and tests.
///
/// A manually advanced clock plus a seeded SplitMix64 generator, so rotation
/// deadlines and TTL sweeps replay identically from the same seed. The
/// randomness is NOT cryptographic; never use outside tests.
#[derive(Clone)]
pub struct VirtualEnv {
    inner: std::sync::Arc<std::sync::Mutex<VirtualEnvInner>>,
}

struct VirtualEnvInner {
    now_millis: u64,
    rng_state: u64,
}

impl VirtualEnv {
    /// Create a virtual environment at the given start time.
    pub fn new(start_millis: u64, seed: u64) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(VirtualEnvInner {
                now_millis: start_millis,
                rng_state: seed,
            })),
        }
    }

    /// Advance the clock by `millis`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn advance(&self, millis: u64) {
        self.inner.lock().expect("Mutex poisoned").now_millis += millis;
    }
}

impl Environment for VirtualEnv {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn now_millis(&self) -> u64 {
        self.inner.lock().expect("Mutex poisoned").now_millis
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        for chunk in buffer.chunks_mut(8) {
            // SplitMix64 step.
            inner.rng_state = inner.rng_state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = inner.rng_state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            let bytes = z.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}
