//! Guest memory telemetry: untrusted input, sanitized before use.
//!
//! Every running domain self-reports its memory statistics in the
//! classic `Key: value` meminfo format. The report crosses a trust
//! boundary: a compromised or buggy guest controls every byte of it, and
//! a crafted report must not be able to force a pathological allocation
//! on the host. [`Telemetry::sanitize`] is therefore total: every
//! required field is checked for presence, shape, and internal
//! consistency before any arithmetic uses it, and any violation rejects
//! the whole report.
//!
//! Values are reported in KiB and converted to bytes here; all further
//! balancer math is in bytes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::registry::DomainId;

/// Maximum accepted size of a raw telemetry report. Reports come from a
/// size-limited guest channel; anything larger is rejected outright
/// rather than parsed.
pub const MAX_TELEMETRY_LEN: usize = 64 * 1024;

/// Required fields, in the order they are checked.
const REQUIRED_FIELDS: [&str; 6] = [
    "MemTotal",
    "MemFree",
    "Buffers",
    "Cached",
    "SwapTotal",
    "SwapFree",
];

/// A sanitized guest memory report. All values in bytes.
///
/// Constructing one is only possible through [`Telemetry::sanitize`], so
/// holding a `Telemetry` is proof the report passed every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Total guest memory.
    pub mem_total: u64,
    /// Free guest memory.
    pub mem_free: u64,
    /// Buffer cache.
    pub buffers: u64,
    /// Page cache.
    pub cached: u64,
    /// Total swap.
    pub swap_total: u64,
    /// Free swap.
    pub swap_free: u64,
}

impl Telemetry {
    /// Parse and sanitize a raw guest report.
    ///
    /// Returns `None` when the report is oversized, a required field is
    /// missing, non-numeric, or would overflow, `SwapTotal < SwapFree`,
    /// or `MemTotal < MemFree + Cached + Buffers`. There is
    /// intentionally no partial acceptance and no error detail beyond
    /// the log line: the caller treats any rejected report as "this
    /// domain has no usable telemetry".
    #[must_use]
    pub fn sanitize(raw: &str) -> Option<Self> {
        if raw.len() > MAX_TELEMETRY_LEN {
            return None;
        }
        let fields = parse_fields(raw);

        let mut values = [0u64; 6];
        for (slot, key) in values.iter_mut().zip(REQUIRED_FIELDS) {
            let text = fields.get(key)?;
            // u64 parsing rejects signs, so negatives cannot slip in.
            let kib: u64 = text.parse().ok()?;
            *slot = kib.checked_mul(1024)?;
        }
        let [mem_total, mem_free, buffers, cached, swap_total, swap_free] = values;

        if swap_total < swap_free {
            return None;
        }
        let reclaimable = mem_free
            .checked_add(cached)
            .and_then(|v| v.checked_add(buffers))?;
        if mem_total < reclaimable {
            return None;
        }
        // No upper limits on the individual values: the most a domain
        // can gain by inflating them is to be assigned all free host
        // memory, which legal values can achieve too, and which cannot
        // starve other domains.
        Some(Self {
            mem_total,
            mem_free,
            buffers,
            cached,
            swap_total,
            swap_free,
        })
    }

    /// Memory the guest is actually using:
    /// `MemTotal - MemFree - Cached - Buffers + SwapTotal - SwapFree`.
    #[must_use]
    pub const fn memory_used(&self) -> u64 {
        // Sanitization guarantees both subtractions stay non-negative.
        (self.mem_total - self.mem_free - self.cached - self.buffers)
            + (self.swap_total - self.swap_free)
    }
}

/// Split a raw report into `key -> value` pairs: one pair per line,
/// first word (trailing `:` stripped) is the key, second word the value.
/// Extra words and unparseable lines are ignored; validation happens
/// against the required-field list afterwards.
fn parse_fields(raw: &str) -> HashMap<&str, &str> {
    let mut fields = HashMap::new();
    for line in raw.lines() {
        let mut words = line.split_whitespace();
        let (Some(key), Some(value)) = (words.next(), words.next()) else {
            continue;
        };
        fields.insert(key.trim_end_matches(':'), value);
    }
    fields
}

/// Per-domain state tracked by the balancing loop.
///
/// `memory_actual` and `memory_maximum` come from the hypervisor;
/// `telemetry` and `memory_used` from the guest (post-sanitization);
/// `no_progress` is set by the loop when a previous balloon request
/// observably failed to move the domain, excluding it from further
/// passes until it makes observable progress.
#[derive(Debug, Clone)]
pub struct DomainMemoryState {
    /// The domain this state belongs to.
    pub id: DomainId,
    /// Last sanitized report, or `None` if the domain never reported or
    /// its last report failed sanitization.
    pub telemetry: Option<Telemetry>,
    /// Derived from `telemetry`; `None` exactly when `telemetry` is.
    pub memory_used: Option<u64>,
    /// Current allocation, bytes.
    pub memory_actual: u64,
    /// Static allocation ceiling, bytes.
    pub memory_maximum: u64,
    /// Excluded from balancing after an ignored balloon request.
    pub no_progress: bool,
}

impl DomainMemoryState {
    /// Fresh state for a newly started domain.
    #[must_use]
    pub const fn new(id: DomainId, memory_actual: u64, memory_maximum: u64) -> Self {
        Self {
            id,
            telemetry: None,
            memory_used: None,
            memory_actual,
            memory_maximum,
            no_progress: false,
        }
    }

    /// Ingest a raw guest report. A report that fails sanitization
    /// invalidates any previously accepted telemetry: stale numbers must
    /// not keep steering the balancer once the guest misbehaves.
    pub fn refresh_telemetry(&mut self, raw: &str) {
        match Telemetry::sanitize(raw) {
            Some(telemetry) => {
                self.telemetry = Some(telemetry);
                self.memory_used = Some(telemetry.memory_used());
            }
            None => {
                warn!(
                    id = %self.id,
                    memory_actual = self.memory_actual,
                    "rejecting suspicious telemetry report"
                );
                self.telemetry = None;
                self.memory_used = None;
            }
        }
    }

    /// Whether this domain participates in a balancing pass.
    #[must_use]
    pub const fn eligible(&self) -> bool {
        self.telemetry.is_some() && !self.no_progress
    }
}
