//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` backs the driver with real wall-clock time and OS
//! cryptographic randomness. Non-deterministic by nature; tests use
//! `VirtualEnv` from the core crate instead.

use shroud_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// Uses `std::time::SystemTime` for wall-clock milliseconds and getrandom
/// for randomness (e.g. /dev/urandom on Linux). Suitable for session IDs
/// and server-originated event IDs.
///
/// # Panics
///
/// Panics if the OS RNG fails. This is intentional - a server without
/// functioning cryptographic randomness cannot operate securely. RNG failure
/// is extremely rare (indicates OS-level issues) and continuing would
/// compromise session and event IDs.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_millis() as u64
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - server cannot operate securely");
    }
}
