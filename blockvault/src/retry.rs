//! Transient-failure retry wrapper (§7). Only `ErrorKind::Transient` is
//! retried; every other kind — including `NotFound` — returns immediately,
//! since retrying a missing key or a corrupt block wastes time and cannot
//! succeed on a later attempt.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl Retry {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Runs `op`, retrying with linear backoff while it returns a
    /// `Transient` error, up to `max_attempts` total tries.
    pub fn call<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == ErrorKind::Transient && attempt < self.max_attempts => {
                    warn!(attempt, max = self.max_attempts, error = %e, "retrying transient failure");
                    thread::sleep(self.base_delay * attempt as u32);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
