//! Weak registry of linked call sites.
//!
//! Invalidation only needs to replace the epoch for correctness. Sweeping the
//! registry additionally drops every live site's cached handles and resets
//! promoted targets, so stale entries do not linger until their next call.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::dispatch::call_site::CallSite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Live sites whose caches were cleared.
    pub cleared: usize,
    /// Registry entries dropped because their site no longer exists.
    pub dropped: usize,
}

/// Registrations between opportunistic prunes of dead entries, at minimum.
const MIN_PRUNE_INTERVAL: usize = 64;

#[derive(Default)]
struct Sites {
    entries: Vec<Weak<CallSite>>,
    prune_at: usize,
}

#[derive(Default)]
pub struct CallSiteRegistry {
    sites: Mutex<Sites>,
}

impl CallSiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `site`. Dead entries are pruned whenever the list has doubled
    /// since the last prune, so registration stays amortized O(1).
    pub fn register(&self, site: &Arc<CallSite>) {
        let mut sites = self.sites.lock();
        if sites.entries.len() >= sites.prune_at {
            sites.entries.retain(|weak| weak.strong_count() > 0);
            sites.prune_at = (sites.entries.len() * 2).max(MIN_PRUNE_INTERVAL);
        }
        sites.entries.push(Arc::downgrade(site));
    }

    /// Clear every live site and forget the dead ones.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.sites.lock().entries.retain(|weak| match weak.upgrade() {
            Some(site) => {
                if !site.is_default() && site.installed_handle().is_some() {
                    site.install_default();
                }
                site.cache().clear();
                report.cleared += 1;
                true
            }
            None => {
                report.dropped += 1;
                false
            }
        });
        debug!(cleared = report.cleared, dropped = report.dropped, "call site registry swept");
        report
    }

    /// Registered sites that are still alive.
    pub fn live(&self) -> usize {
        self.sites
            .lock()
            .entries
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
