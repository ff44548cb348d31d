//! The host memory balancing algorithm.
//!
//! Pure functions over a free-host-memory figure and the per-domain
//! [`DomainMemoryState`] map. The balancing loop in the daemon owns the
//! map and applies the returned balloon requests; nothing here holds
//! state of its own.
//!
//! Two entry points:
//!
//! - [`admission_check`] answers "can `request` bytes be reclaimed from
//!   donor domains right now", returning the donor targets that free the
//!   memory, or `None` to deny.
//! - [`rebalance`] recomputes every eligible domain's target, either
//!   distributing surplus proportionally to preference or squeezing
//!   donors down to preference when memory is tight.
//!
//! Domains with no sanitized telemetry or with the `no_progress` flag
//! set are invisible to both.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::registry::DomainId;

use super::telemetry::DomainMemoryState;

/// Safety factor applied to admission borrowing. Slightly above 1 so
/// that donors yielding marginally less than asked (rounding, timing)
/// still free enough; the surplus returns to them on the next
/// rebalance.
pub const REQUEST_SAFETY_FACTOR: f64 = 1.05;

/// Rounding factor applied to computed targets to keep integer rounding
/// from oscillating targets just above what can be granted.
pub const ROUNDING_FACTOR: f64 = 0.999;

/// Tunables of the balancing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Multiplier on measured usage when computing a domain's preferred
    /// allocation, leaving headroom for cache.
    #[serde(default = "default_cache_factor")]
    pub cache_factor: f64,

    /// Floor on any non-administrative domain's preferred allocation,
    /// bytes.
    #[serde(default = "default_min_prefmem")]
    pub min_prefmem: u64,

    /// Extra preferred allocation for the administrative domain, which
    /// needs a large cache for the virtual disks it backs. Bytes.
    #[serde(default = "default_admin_boost")]
    pub admin_boost: u64,

    /// Donors whose squeezable surplus is below this are left alone in
    /// the low-memory regime; reclaiming a few MiB is not worth the
    /// churn. Bytes.
    #[serde(default = "default_squeeze_threshold")]
    pub squeeze_threshold: u64,
}

const fn default_cache_factor() -> f64 {
    1.3
}

const fn default_min_prefmem() -> u64 {
    200 * 1024 * 1024
}

const fn default_admin_boost() -> u64 {
    350 * 1024 * 1024
}

const fn default_squeeze_threshold() -> u64 {
    10 * 1024 * 1024
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            cache_factor: default_cache_factor(),
            min_prefmem: default_min_prefmem(),
            admin_boost: default_admin_boost(),
            squeeze_threshold: default_squeeze_threshold(),
        }
    }
}

/// A computed balloon target for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalloonRequest {
    /// The domain to steer.
    pub id: DomainId,
    /// The new memory target, bytes.
    pub target: u64,
}

/// The allocation a domain would ideally hold: measured usage scaled by
/// the cache factor, clamped to its ceiling, floored at `min_prefmem`
/// for regular domains. The administrative domain gets the boost term
/// instead of the floor. `None` when the domain has no sanitized
/// telemetry.
#[must_use]
pub fn prefmem(cfg: &BalancerConfig, domain: &DomainMemoryState) -> Option<u64> {
    let used = domain.memory_used?;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (used as f64 * cfg.cache_factor) as u64;
    if domain.id.is_admin() {
        Some(
            scaled
                .saturating_add(cfg.admin_boost)
                .min(domain.memory_maximum),
        )
    } else {
        Some(scaled.min(domain.memory_maximum).max(cfg.min_prefmem))
    }
}

/// Difference between preferred and actual allocation. Negative means
/// the domain holds more than it prefers and can donate that much.
/// `None` when the domain has no sanitized telemetry.
///
/// The proportional distribution in [`rebalance`] relies on this exact
/// formula; do not fold clamping into it.
#[must_use]
pub fn memory_needed(cfg: &BalancerConfig, domain: &DomainMemoryState) -> Option<i64> {
    let pref = prefmem(cfg, domain)?;
    #[allow(clippy::cast_possible_wrap)] // memory sizes fit i64
    Some(pref as i64 - domain.memory_actual as i64)
}

/// Admission control: find donor targets that free `request` bytes.
///
/// Donors are eligible domains holding more than they prefer. Their
/// combined surplus must cover the request or the call denies
/// (`None`) — the caller must not grow any allocation on a denial.
/// On success each donor contributes proportionally to its surplus,
/// scaled by [`REQUEST_SAFETY_FACTOR`].
#[must_use]
pub fn admission_check(
    cfg: &BalancerConfig,
    request: u64,
    domains: &HashMap<DomainId, DomainMemoryState>,
) -> Option<Vec<BalloonRequest>> {
    let mut donors: Vec<(DomainId, u64, u64)> = Vec::new();
    let mut available: u64 = 0;
    for domain in domains.values() {
        if !domain.eligible() {
            continue;
        }
        let Some(needed) = memory_needed(cfg, domain) else {
            continue;
        };
        if needed < 0 {
            let surplus = needed.unsigned_abs();
            donors.push((domain.id, surplus, domain.memory_actual));
            available = available.saturating_add(surplus);
        }
    }
    info!(request, available, donors = donors.len(), "admission check");
    if available < request {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let scale = request as f64 / available as f64;
    let mut requests = Vec::with_capacity(donors.len());
    for (id, surplus, actual) in donors {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let borrowed = (surplus as f64 * scale * REQUEST_SAFETY_FACTOR) as u64;
        let target = actual.saturating_sub(borrowed);
        debug!(%id, borrowed, target, "borrowing from donor");
        requests.push(BalloonRequest { id, target });
    }
    Some(requests)
}

/// Recompute targets for all eligible domains.
///
/// With surplus (free host memory exceeds the net shortfall), every
/// domain is set to its preference plus a share of the surplus
/// proportional to that preference, clamped to its ceiling; memory
/// clipped by a ceiling is redistributed among domains still below
/// theirs until none remains or nobody can take more.
///
/// Under pressure, donors are squeezed down to exactly their preference
/// (skipping those whose surplus is below the configured threshold) and
/// the freed memory plus the free host pool is split among acceptors
/// proportionally to preference, clamped to ceilings.
///
/// Donor requests are ordered before acceptor requests so the caller
/// reclaims memory before granting it.
#[must_use]
pub fn rebalance(
    cfg: &BalancerConfig,
    free_host_memory: u64,
    domains: &HashMap<DomainId, DomainMemoryState>,
) -> Vec<BalloonRequest> {
    let mut total_needed: i64 = 0;
    let mut total_pref: u64 = 0;
    let mut total_pref_acceptors: u64 = 0;
    let mut donors: Vec<DomainId> = Vec::new();
    let mut acceptors: Vec<DomainId> = Vec::new();

    for domain in domains.values() {
        if !domain.eligible() {
            continue;
        }
        let (Some(needed), Some(pref)) = (memory_needed(cfg, domain), prefmem(cfg, domain)) else {
            continue;
        };
        if needed < 0 || domain.memory_actual >= domain.memory_maximum {
            donors.push(domain.id);
        } else {
            acceptors.push(domain.id);
            total_pref_acceptors = total_pref_acceptors.saturating_add(pref);
        }
        total_needed = total_needed.saturating_add(needed);
        total_pref = total_pref.saturating_add(pref);
    }

    #[allow(clippy::cast_possible_wrap)] // memory sizes fit i64
    let total_available = free_host_memory as i64 - total_needed;
    if total_available > 0 {
        #[allow(clippy::cast_sign_loss)] // checked positive above
        balance_with_surplus(cfg, total_available as u64, total_pref, domains)
    } else {
        balance_under_pressure(
            cfg,
            free_host_memory,
            total_pref_acceptors,
            &donors,
            &acceptors,
            domains,
        )
    }
}

/// Surplus regime: distribute `total_available` proportionally to
/// preference, clamping at ceilings and redistributing the clipped
/// remainder.
fn balance_with_surplus(
    cfg: &BalancerConfig,
    total_available: u64,
    total_pref: u64,
    domains: &HashMap<DomainId, DomainMemoryState>,
) -> Vec<BalloonRequest> {
    if total_pref == 0 {
        return Vec::new();
    }
    debug!(total_available, total_pref, "balancing with surplus");

    struct Entry {
        id: DomainId,
        target: u64,
        maximum: u64,
        actual: u64,
    }

    let mut entries: Vec<Entry> = Vec::new();
    let mut left_memory: u64 = 0;
    let mut acceptors_count: u64 = 0;
    for domain in domains.values() {
        if !domain.eligible() {
            continue;
        }
        let Some(pref) = prefmem(cfg, domain) else {
            continue;
        };
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let share = {
            let scale = pref as f64 / total_pref as f64;
            let target_raw = pref as f64 + scale * total_available as f64;
            (ROUNDING_FACTOR * target_raw) as u64
        };
        let mut target = share;
        if target > domain.memory_maximum {
            left_memory += target - domain.memory_maximum;
            target = domain.memory_maximum;
        } else {
            acceptors_count += 1;
        }
        entries.push(Entry {
            id: domain.id,
            target,
            maximum: domain.memory_maximum,
            actual: domain.memory_actual,
        });
    }

    // Redistribute memory clipped by ceilings among domains that still
    // have room, repeating until nothing is left or everyone is full.
    while left_memory > 0 && acceptors_count > 0 {
        debug!(left_memory, acceptors_count, "redistributing clipped surplus");
        let mut new_left: u64 = 0;
        let mut new_acceptors = acceptors_count;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bonus = (ROUNDING_FACTOR * (left_memory / acceptors_count) as f64) as u64;
        for entry in &mut entries {
            if entry.target >= entry.maximum {
                continue;
            }
            if entry.target + bonus >= entry.maximum {
                new_left += entry.target + bonus - entry.maximum;
                entry.target = entry.maximum;
                new_acceptors -= 1;
            } else {
                entry.target += bonus;
            }
        }
        if new_left == left_memory && new_acceptors == acceptors_count {
            // bonus rounded to zero; the remainder stays in the free pool
            break;
        }
        left_memory = new_left;
        acceptors_count = new_acceptors;
    }

    // Donors (shrinking) first so the caller reclaims before granting.
    let mut requests: Vec<BalloonRequest> = Vec::with_capacity(entries.len());
    for entry in entries.iter().filter(|e| e.target < e.actual) {
        requests.push(BalloonRequest {
            id: entry.id,
            target: entry.target,
        });
    }
    for entry in entries.iter().filter(|e| e.target >= e.actual) {
        requests.push(BalloonRequest {
            id: entry.id,
            target: entry.target,
        });
    }
    requests
}

/// Low-memory regime: squeeze donors to preference, hand the pool to
/// acceptors proportionally to preference.
fn balance_under_pressure(
    cfg: &BalancerConfig,
    free_host_memory: u64,
    total_pref_acceptors: u64,
    donors: &[DomainId],
    acceptors: &[DomainId],
    domains: &HashMap<DomainId, DomainMemoryState>,
) -> Vec<BalloonRequest> {
    debug!(
        free_host_memory,
        donors = donors.len(),
        acceptors = acceptors.len(),
        "balancing under memory pressure"
    );
    let mut requests: Vec<BalloonRequest> = Vec::new();
    let mut squeezed_pool = free_host_memory;

    for &id in donors {
        let Some(domain) = domains.get(&id) else {
            continue;
        };
        let (Some(needed), Some(pref)) = (memory_needed(cfg, domain), prefmem(cfg, domain)) else {
            continue;
        };
        if needed >= 0 {
            // at ceiling but not above preference; nothing to squeeze
            continue;
        }
        let surplus = needed.unsigned_abs();
        if surplus < cfg.squeeze_threshold {
            // already close to preference; not worth the churn
            continue;
        }
        squeezed_pool = squeezed_pool.saturating_add(surplus);
        requests.push(BalloonRequest { id, target: pref });
    }

    if total_pref_acceptors == 0 {
        return requests;
    }
    for &id in acceptors {
        let Some(domain) = domains.get(&id) else {
            continue;
        };
        let Some(pref) = prefmem(cfg, domain) else {
            continue;
        };
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let grant = {
            let scale = pref as f64 / total_pref_acceptors as f64;
            let target_raw = domain.memory_actual as f64 + scale * squeezed_pool as f64;
            (ROUNDING_FACTOR * target_raw) as u64
        };
        requests.push(BalloonRequest {
            id,
            target: grant.min(domain.memory_maximum),
        });
    }
    requests
}
