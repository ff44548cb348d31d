//! Registry-specific error types.

use thiserror::Error;

use super::record::DomainId;

/// Errors from registry mutations and lookups.
///
/// Every variant describes a request that was rejected before any
/// in-memory change was made; a failed registry call never leaves the
/// catalog partially updated.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Another record already uses this id or name.
    #[error("domain identity already in use: {what}")]
    DuplicateIdentity {
        /// Human-readable description of the colliding id or name.
        what: String,
    },

    /// No record matches the given id or name.
    #[error("no such domain: {what}")]
    NotFound {
        /// The id or name that was looked up.
        what: String,
    },

    /// The record is still referenced as a template or network provider.
    #[error("domain {id} is still referenced by {referrers:?}")]
    StillReferenced {
        /// The record that cannot be removed.
        id: DomainId,
        /// Ids of the records referencing it.
        referrers: Vec<DomainId>,
    },

    /// Assigning this network provider would create a cycle.
    #[error("network provider assignment would make domain {id} its own ancestor")]
    CyclicDependency {
        /// The domain whose provider was being set.
        id: DomainId,
    },

    /// The name does not match the required pattern or length.
    #[error("invalid domain name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A template/provider reference points at a record of the wrong kind
    /// or a kind that cannot carry the reference.
    #[error("invalid reference: {reason}")]
    InvalidReference {
        /// Why the reference was rejected.
        reason: String,
    },

    /// The operation targets the reserved administrative record.
    #[error("operation not permitted on the administrative domain")]
    ReservedDomain,

    /// `memory_target` exceeds `memory_ceiling`, or a bound is zero.
    #[error("invalid memory bounds for domain {name:?}: target={target} ceiling={ceiling}")]
    MemoryBounds {
        /// Name of the offending record.
        name: String,
        /// Requested target, bytes.
        target: u64,
        /// Requested ceiling, bytes.
        ceiling: u64,
    },

    /// The id range is exhausted; no unused id remains.
    #[error("no unused domain id available")]
    IdSpaceExhausted,
}
