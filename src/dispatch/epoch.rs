//! Epoch token: process-wide invalidation of every cached dispatch decision.
//!
//! # Protocol
//!
//! 1. Resolution captures the current [`EpochToken`] *before* it reads the
//!    symbol table
//! 2. The guarded handle it builds keeps that token
//! 3. `invalidate()` swaps in a fresh token and then marks the old one
//!    invalid
//!
//! A guard is a single atomic load on the captured token. Tokens are never
//! revalidated, so a handle that observed invalidation once keeps failing
//! until it is rebuilt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

/// One generation of dispatch state.
#[derive(Debug)]
pub struct EpochToken {
    generation: u64,
    valid: AtomicBool,
}

impl EpochToken {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            valid: AtomicBool::new(true),
        }
    }

    /// Cheap guard check. Sequentially consistent so that once
    /// [`Epoch::invalidate`] has returned, no thread sees the token valid.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Holder of the current epoch token.
#[derive(Debug)]
pub struct Epoch {
    current: ArcSwap<EpochToken>,
    swap_lock: Mutex<()>,
    invalidations: AtomicU64,
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(EpochToken::new(0)),
            swap_lock: Mutex::new(()),
            invalidations: AtomicU64::new(0),
        }
    }

    /// The token guards should capture right now.
    #[inline]
    pub fn current(&self) -> Arc<EpochToken> {
        self.current.load_full()
    }

    /// Replace the current token and invalidate the old one.
    ///
    /// Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        let _swap = self.swap_lock.lock();
        let generation = self.current.load().generation + 1;
        let old = self.current.swap(Arc::new(EpochToken::new(generation)));
        old.valid.store(false, Ordering::SeqCst);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(generation, "dispatch epoch invalidated");
        generation
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}
