//! The authoritative catalog of domains.
//!
//! [`DomainRegistry`] tracks every [`DomainRecord`], the reverse index of
//! network-provider dependents, and the registry-level role pointers. All
//! mutating calls validate their full effect before touching any state, so
//! the invariants below hold between any two calls:
//!
//! - ids and names are unique
//! - the network-provider relation is acyclic
//! - `template` references point at Template-kind records
//! - a record referenced as template or provider cannot be removed
//!
//! The registry is a plain synchronous structure; callers that share it
//! across tasks wrap it in a lock. Persistence (snapshot file, flock
//! discipline) lives in [`store`].

pub mod error;
pub mod record;
pub mod store;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

pub use error::RegistryError;
pub use record::{
    DomainId, DomainKind, DomainName, DomainRecord, DomainSpec, ADMIN_DOMAIN_ID, MAX_DOMAIN_ID,
};

/// Capacity of the registry event channel. Slow subscribers lag rather
/// than block mutations.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registry-level role pointers.
///
/// Each role optionally designates one domain. Roles are auto-populated
/// when the first matching record is added and cleared when the designated
/// record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Template new domains derive from when none is given.
    DefaultTemplate,
    /// Network provider new domains attach to when none is given.
    DefaultNetworkProvider,
    /// Network provider placed in front of firewalling providers.
    DefaultFirewallNetworkProvider,
    /// Domain through which host updates are fetched.
    UpdateChannelProvider,
    /// Domain the platform clock is synchronized against.
    ClockReferenceProvider,
}

impl Role {
    const ALL: [Self; 5] = [
        Self::DefaultTemplate,
        Self::DefaultNetworkProvider,
        Self::DefaultFirewallNetworkProvider,
        Self::UpdateChannelProvider,
        Self::ClockReferenceProvider,
    ];

    /// Whether a record of `kind` may hold this role.
    #[must_use]
    pub const fn accepts(self, kind: DomainKind) -> bool {
        match self {
            Self::DefaultTemplate => kind.is_template(),
            Self::DefaultNetworkProvider
            | Self::DefaultFirewallNetworkProvider
            | Self::UpdateChannelProvider
            | Self::ClockReferenceProvider => matches!(kind, DomainKind::NetworkProvider),
        }
    }
}

/// The five role pointers, serialized with the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTable {
    #[serde(default)]
    default_template: Option<DomainId>,
    #[serde(default)]
    default_network_provider: Option<DomainId>,
    #[serde(default)]
    default_firewall_network_provider: Option<DomainId>,
    #[serde(default)]
    update_channel_provider: Option<DomainId>,
    #[serde(default)]
    clock_reference_provider: Option<DomainId>,
}

impl RoleTable {
    fn slot(&self, role: Role) -> Option<DomainId> {
        match role {
            Role::DefaultTemplate => self.default_template,
            Role::DefaultNetworkProvider => self.default_network_provider,
            Role::DefaultFirewallNetworkProvider => self.default_firewall_network_provider,
            Role::UpdateChannelProvider => self.update_channel_provider,
            Role::ClockReferenceProvider => self.clock_reference_provider,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<DomainId> {
        match role {
            Role::DefaultTemplate => &mut self.default_template,
            Role::DefaultNetworkProvider => &mut self.default_network_provider,
            Role::DefaultFirewallNetworkProvider => &mut self.default_firewall_network_provider,
            Role::UpdateChannelProvider => &mut self.update_channel_provider,
            Role::ClockReferenceProvider => &mut self.clock_reference_provider,
        }
    }
}

/// Notification emitted by registry mutations.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A record was inserted.
    DomainAdded {
        /// New record's id.
        id: DomainId,
        /// New record's name.
        name: DomainName,
        /// New record's kind.
        kind: DomainKind,
    },
    /// A record was removed.
    DomainRemoved {
        /// Removed record's id.
        id: DomainId,
        /// Removed record's name.
        name: DomainName,
        /// Removed record's kind.
        kind: DomainKind,
    },
}

/// Serialized form of the registry: records plus role pointers.
///
/// This is the exact content of the persisted snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// All records, administrative domain included.
    pub domains: Vec<DomainRecord>,
    /// Role pointers.
    #[serde(default)]
    pub roles: RoleTable,
}

/// The in-memory domain catalog.
pub struct DomainRegistry {
    domains: BTreeMap<DomainId, DomainRecord>,
    /// Name -> id lookup index.
    names: HashMap<String, DomainId>,
    /// Reverse index: provider id -> ids whose `network_provider` is it.
    dependents: BTreeMap<DomainId, BTreeSet<DomainId>>,
    roles: RoleTable,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("domains", &self.domains.len())
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRegistry {
    /// Create a registry holding only the administrative record.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let admin = DomainRecord::administrative();
        let mut names = HashMap::new();
        names.insert(admin.name.as_str().to_string(), admin.id);
        let mut domains = BTreeMap::new();
        let mut dependents = BTreeMap::new();
        dependents.insert(admin.id, BTreeSet::new());
        domains.insert(admin.id, admin);
        Self {
            domains,
            names,
            dependents,
            roles: RoleTable::default(),
            events,
        }
    }

    /// Subscribe to domain-added / domain-removed notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Number of records, administrative domain included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// `true` when only the administrative record exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.len() <= 1
    }

    /// Iterate over all records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &DomainRecord> {
        self.domains.values()
    }

    /// Fetch a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no record has this id.
    pub fn get(&self, id: DomainId) -> Result<&DomainRecord, RegistryError> {
        self.domains.get(&id).ok_or_else(|| RegistryError::NotFound {
            what: id.to_string(),
        })
    }

    /// Fetch a record by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no record has this name.
    pub fn get_by_name(&self, name: &str) -> Result<&DomainRecord, RegistryError> {
        self.names
            .get(name)
            .and_then(|id| self.domains.get(id))
            .ok_or_else(|| RegistryError::NotFound {
                what: name.to_string(),
            })
    }

    /// Resolve a selector that is either a numeric id or a name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if neither interpretation
    /// matches a record.
    pub fn lookup(&self, selector: &str) -> Result<&DomainRecord, RegistryError> {
        if let Ok(id) = selector.parse::<u16>() {
            if let Ok(record) = self.get(DomainId(id)) {
                return Ok(record);
            }
        }
        self.get_by_name(selector)
    }

    /// Insert a new record built from `spec`, allocating an id if none was
    /// pre-assigned, and fire `domain-added`. Role pointers are
    /// auto-populated in the same critical section: the first Template
    /// becomes the default template, the first NetworkProvider fills the
    /// unset network-ish roles.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateIdentity`] on id or name collision
    /// - [`RegistryError::ReservedDomain`] if the pre-assigned id is 0
    /// - [`RegistryError::InvalidReference`] if `template` is not a
    ///   Template-kind record, the record's kind cannot carry a template,
    ///   or the provider cannot provide network
    /// - [`RegistryError::CyclicDependency`] if the provider reference
    ///   would close a cycle
    /// - [`RegistryError::MemoryBounds`] if `memory_target` is zero or
    ///   exceeds `memory_ceiling`
    /// - [`RegistryError::NotFound`] if a referenced record does not exist
    /// - [`RegistryError::IdSpaceExhausted`] if no id is free
    pub fn add(&mut self, spec: DomainSpec) -> Result<DomainId, RegistryError> {
        let id = match spec.id {
            Some(id) if id.is_admin() => return Err(RegistryError::ReservedDomain),
            Some(id) if id.0 > MAX_DOMAIN_ID => {
                return Err(RegistryError::InvalidReference {
                    reason: format!("id {id} outside assignable range 1..={MAX_DOMAIN_ID}"),
                })
            }
            Some(id) => {
                if self.domains.contains_key(&id) {
                    return Err(RegistryError::DuplicateIdentity {
                        what: format!("id {id}"),
                    });
                }
                id
            }
            None => self.allocate_id()?,
        };

        if self.names.contains_key(spec.name.as_str()) {
            return Err(RegistryError::DuplicateIdentity {
                what: format!("name {:?}", spec.name.as_str()),
            });
        }

        self.validate_memory_bounds(&spec)?;
        self.validate_template_ref(spec.kind, spec.template)?;
        if let Some(provider) = spec.network_provider {
            self.validate_provider_ref(id, provider)?;
        }

        let record = DomainRecord::from_spec(id, spec);
        let name = record.name.clone();
        let kind = record.kind;
        let provider = record.network_provider;

        self.names.insert(name.as_str().to_string(), id);
        self.dependents.insert(id, BTreeSet::new());
        if let Some(provider) = provider {
            self.dependents.entry(provider).or_default().insert(id);
        }
        self.domains.insert(id, record);
        self.autopopulate_roles(id, kind);

        debug!(%id, name = %name, %kind, "domain added");
        let _ = self.events.send(RegistryEvent::DomainAdded { id, name, kind });
        Ok(id)
    }

    /// Remove a record, clearing role pointers that designated it, and
    /// fire `domain-removed`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ReservedDomain`] for the administrative record
    /// - [`RegistryError::NotFound`] if no record has this id
    /// - [`RegistryError::StillReferenced`] while other records reference
    ///   it as template or network provider
    pub fn remove(&mut self, id: DomainId) -> Result<(), RegistryError> {
        if id.is_admin() {
            return Err(RegistryError::ReservedDomain);
        }
        if !self.domains.contains_key(&id) {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        }

        let mut referrers: Vec<DomainId> = self
            .dependents
            .get(&id)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();
        referrers.extend(
            self.domains
                .values()
                .filter(|r| r.template == Some(id))
                .map(|r| r.id),
        );
        if !referrers.is_empty() {
            referrers.sort_unstable();
            referrers.dedup();
            return Err(RegistryError::StillReferenced { id, referrers });
        }

        for role in Role::ALL {
            let slot = self.roles.slot_mut(role);
            if *slot == Some(id) {
                *slot = None;
            }
        }

        let Some(record) = self.domains.remove(&id) else {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        };
        self.names.remove(record.name.as_str());
        self.dependents.remove(&id);
        if let Some(provider) = record.network_provider {
            if let Some(deps) = self.dependents.get_mut(&provider) {
                deps.remove(&id);
            }
        }

        debug!(%id, name = %record.name, "domain removed");
        let _ = self.events.send(RegistryEvent::DomainRemoved {
            id,
            name: record.name,
            kind: record.kind,
        });
        Ok(())
    }

    /// Rename a record. The lifecycle controller gates this on the domain
    /// being halted; the registry only enforces identity invariants.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ReservedDomain`] for the administrative record
    /// - [`RegistryError::NotFound`] if no record has this id
    /// - [`RegistryError::DuplicateIdentity`] if the name is taken
    pub fn rename(&mut self, id: DomainId, new_name: DomainName) -> Result<(), RegistryError> {
        if id.is_admin() {
            return Err(RegistryError::ReservedDomain);
        }
        if !self.domains.contains_key(&id) {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        }
        if let Some(&holder) = self.names.get(new_name.as_str()) {
            if holder != id {
                return Err(RegistryError::DuplicateIdentity {
                    what: format!("name {:?}", new_name.as_str()),
                });
            }
            return Ok(());
        }
        let Some(record) = self.domains.get_mut(&id) else {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        };
        self.names.remove(record.name.as_str());
        self.names.insert(new_name.as_str().to_string(), id);
        record.name = new_name;
        Ok(())
    }

    /// Point a record at a new network provider (or clear it), keeping the
    /// reverse index in sync.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] if either record does not exist
    /// - [`RegistryError::InvalidReference`] if the provider's kind cannot
    ///   provide network
    /// - [`RegistryError::CyclicDependency`] if the assignment would make
    ///   the record its own ancestor
    pub fn set_network_provider(
        &mut self,
        id: DomainId,
        provider: Option<DomainId>,
    ) -> Result<(), RegistryError> {
        if !self.domains.contains_key(&id) {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        }
        if let Some(provider) = provider {
            self.validate_provider_ref(id, provider)?;
        }

        let Some(record) = self.domains.get_mut(&id) else {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        };
        let old = record.network_provider;
        record.network_provider = provider;
        if let Some(old) = old {
            if let Some(deps) = self.dependents.get_mut(&old) {
                deps.remove(&id);
            }
        }
        if let Some(provider) = provider {
            self.dependents.entry(provider).or_default().insert(id);
        }
        Ok(())
    }

    /// Point a record at a new template (or clear it).
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] if either record does not exist
    /// - [`RegistryError::InvalidReference`] if the target is not a
    ///   Template-kind record or the record's kind carries no template
    pub fn set_template(
        &mut self,
        id: DomainId,
        template: Option<DomainId>,
    ) -> Result<(), RegistryError> {
        let kind = self.get(id)?.kind;
        self.validate_template_ref(kind, template)?;
        let Some(record) = self.domains.get_mut(&id) else {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        };
        record.template = template;
        Ok(())
    }

    /// Records whose `network_provider` is `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no record has this id.
    pub fn dependents_of(&self, id: DomainId) -> Result<BTreeSet<DomainId>, RegistryError> {
        if !self.domains.contains_key(&id) {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        }
        Ok(self.dependents.get(&id).cloned().unwrap_or_default())
    }

    /// Transitive closure of provider dependents, breadth-first from `id`
    /// (not including `id` itself). The order is usable for teardown
    /// planning: reversing it visits leaves first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no record has this id.
    pub fn network_closure_of(&self, id: DomainId) -> Result<Vec<DomainId>, RegistryError> {
        if !self.domains.contains_key(&id) {
            return Err(RegistryError::NotFound {
                what: id.to_string(),
            });
        }
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<DomainId> = VecDeque::new();
        queue.push_back(id);
        seen.insert(id);
        while let Some(current) = queue.pop_front() {
            if let Some(deps) = self.dependents.get(&current) {
                for &dep in deps {
                    if seen.insert(dep) {
                        out.push(dep);
                        queue.push_back(dep);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Current holder of a role.
    #[must_use]
    pub fn role(&self, role: Role) -> Option<DomainId> {
        self.roles.slot(role)
    }

    /// Assign or clear a role pointer.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] if the record does not exist
    /// - [`RegistryError::InvalidReference`] if the record's kind cannot
    ///   hold the role
    pub fn set_role(&mut self, role: Role, id: Option<DomainId>) -> Result<(), RegistryError> {
        if let Some(id) = id {
            let kind = self.get(id)?.kind;
            if !role.accepts(kind) {
                return Err(RegistryError::InvalidReference {
                    reason: format!("domain {id} of kind {kind} cannot hold role {role:?}"),
                });
            }
        }
        *self.roles.slot_mut(role) = id;
        Ok(())
    }

    /// Snapshot of all records and roles, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            domains: self.domains.values().cloned().collect(),
            roles: self.roles.clone(),
        }
    }

    /// Rebuild a registry from a snapshot, revalidating every invariant.
    ///
    /// Fails closed: a snapshot containing a duplicate identity, a
    /// dangling or wrongly-kinded reference, a provider cycle, or bad
    /// memory bounds is rejected in whole. A snapshot without an
    /// administrative record gets one inserted.
    ///
    /// # Errors
    ///
    /// Any [`RegistryError`] describing the first invariant violation
    /// found.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        let mut records = snapshot.domains;
        records.sort_by_key(|r| r.id);

        for record in &records {
            if record.id.is_admin() {
                if record.kind != DomainKind::Administrative {
                    return Err(RegistryError::InvalidReference {
                        reason: format!(
                            "record 0 has kind {}, expected administrative",
                            record.kind
                        ),
                    });
                }
                // Replace the built-in administrative record wholesale.
                if let Some(builtin) = registry.domains.get(&ADMIN_DOMAIN_ID) {
                    let builtin_name = builtin.name.as_str().to_string();
                    registry.names.remove(&builtin_name);
                }
                registry
                    .names
                    .insert(record.name.as_str().to_string(), record.id);
                registry.domains.insert(record.id, record.clone());
                continue;
            }
            if record.id.0 > MAX_DOMAIN_ID {
                return Err(RegistryError::InvalidReference {
                    reason: format!("id {} outside assignable range", record.id),
                });
            }
            if registry.domains.contains_key(&record.id) {
                return Err(RegistryError::DuplicateIdentity {
                    what: format!("id {}", record.id),
                });
            }
            if registry.names.contains_key(record.name.as_str()) {
                return Err(RegistryError::DuplicateIdentity {
                    what: format!("name {:?}", record.name.as_str()),
                });
            }
            registry
                .names
                .insert(record.name.as_str().to_string(), record.id);
            registry.dependents.entry(record.id).or_default();
            registry.domains.insert(record.id, record.clone());
        }

        // References are validated after all records are present, so
        // forward references within the snapshot resolve.
        for record in registry.domains.clone().values() {
            registry.validate_memory_bounds_record(record)?;
            registry.validate_template_ref(record.kind, record.template)?;
            if let Some(provider) = record.network_provider {
                registry.validate_provider_ref(record.id, provider)?;
                registry
                    .dependents
                    .entry(provider)
                    .or_default()
                    .insert(record.id);
            }
        }

        registry.roles = snapshot.roles;
        for role in Role::ALL {
            if let Some(id) = registry.roles.slot(role) {
                let kind = registry.get(id)?.kind;
                if !role.accepts(kind) {
                    return Err(RegistryError::InvalidReference {
                        reason: format!("role {role:?} points at {id} of kind {kind}"),
                    });
                }
            }
        }
        Ok(registry)
    }

    fn allocate_id(&self) -> Result<DomainId, RegistryError> {
        (1..=MAX_DOMAIN_ID)
            .map(DomainId)
            .find(|id| !self.domains.contains_key(id))
            .ok_or(RegistryError::IdSpaceExhausted)
    }

    fn validate_memory_bounds(&self, spec: &DomainSpec) -> Result<(), RegistryError> {
        if spec.memory_target == 0 || spec.memory_target > spec.memory_ceiling {
            return Err(RegistryError::MemoryBounds {
                name: spec.name.as_str().to_string(),
                target: spec.memory_target,
                ceiling: spec.memory_ceiling,
            });
        }
        Ok(())
    }

    fn validate_memory_bounds_record(&self, record: &DomainRecord) -> Result<(), RegistryError> {
        if record.memory_target == 0 || record.memory_target > record.memory_ceiling {
            return Err(RegistryError::MemoryBounds {
                name: record.name.as_str().to_string(),
                target: record.memory_target,
                ceiling: record.memory_ceiling,
            });
        }
        Ok(())
    }

    fn validate_template_ref(
        &self,
        kind: DomainKind,
        template: Option<DomainId>,
    ) -> Result<(), RegistryError> {
        let Some(template) = template else {
            return Ok(());
        };
        if !kind.uses_template() {
            return Err(RegistryError::InvalidReference {
                reason: format!("{kind} domains do not derive from a template"),
            });
        }
        let target = self.get(template)?;
        if !target.kind.is_template() {
            return Err(RegistryError::InvalidReference {
                reason: format!(
                    "template reference points at {} of kind {}",
                    target.id, target.kind
                ),
            });
        }
        Ok(())
    }

    /// Check that `provider` exists, can provide network, and that making
    /// it `id`'s provider keeps the relation acyclic. The walk follows
    /// provider links upward from `provider`; reaching `id` means the
    /// assignment would close a cycle (self-assignment included).
    fn validate_provider_ref(
        &self,
        id: DomainId,
        provider: DomainId,
    ) -> Result<(), RegistryError> {
        let target = self.get(provider)?;
        if !target.kind.provides_network() {
            return Err(RegistryError::InvalidReference {
                reason: format!(
                    "network provider reference points at {} of kind {}",
                    target.id, target.kind
                ),
            });
        }
        // The visited set bounds the walk even when called on a snapshot
        // that already contains a cycle elsewhere in the forest.
        let mut visited = BTreeSet::new();
        let mut current = Some(provider);
        while let Some(ancestor) = current {
            if ancestor == id || !visited.insert(ancestor) {
                return Err(RegistryError::CyclicDependency { id });
            }
            current = self
                .domains
                .get(&ancestor)
                .and_then(|r| r.network_provider);
        }
        Ok(())
    }

    fn autopopulate_roles(&mut self, id: DomainId, kind: DomainKind) {
        for role in Role::ALL {
            if role.accepts(kind) && self.roles.slot(role).is_none() {
                debug!(%id, ?role, "auto-assigning role to first matching domain");
                *self.roles.slot_mut(role) = Some(id);
            }
        }
    }
}
