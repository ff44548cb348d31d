//! Domain identity and record types.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::RegistryError;

/// Identifier of a domain, stable for the domain's lifetime.
///
/// Id 0 is reserved for the always-on administrative domain; user domains
/// are allocated from `1..=MAX_DOMAIN_ID`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DomainId(pub u16);

/// The administrative domain representing the host itself.
pub const ADMIN_DOMAIN_ID: DomainId = DomainId(0);

/// Highest id assignable to a user domain.
pub const MAX_DOMAIN_ID: u16 = 254;

impl DomainId {
    /// Whether this is the reserved administrative domain id.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum length of a domain name in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// A validated domain name.
///
/// Names start with an ASCII letter followed by letters, digits, `_` or
/// `-`, and are at most [`MAX_NAME_LEN`] bytes long. Validation happens on
/// construction (and on deserialization), so holding a `DomainName` is
/// proof the name is well-formed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    /// Validate and wrap a domain name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidName`] if the name is empty, too
    /// long, does not start with a letter, or contains a character outside
    /// `[a-zA-Z0-9_-]`.
    pub fn new(name: impl Into<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(RegistryError::InvalidName { name });
        }
        let mut chars = name.chars();
        // chars() on a non-empty string always yields at least one element
        let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_first || !valid_rest {
            return Err(RegistryError::InvalidName { name });
        }
        Ok(Self(name))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DomainName {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DomainName> for String {
    fn from(name: DomainName) -> Self {
        name.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What a domain is for; determines default behaviors and which references
/// and roles it may participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    /// The always-on, privileged domain representing the host (id 0).
    Administrative,
    /// A domain whose root disk other domains derive theirs from.
    Template,
    /// A regular user-facing application domain.
    Application,
    /// A domain supplying network connectivity to other domains.
    NetworkProvider,
    /// A throwaway domain destroyed after a single use.
    Disposable,
    /// A self-contained domain with its own root disk.
    Standalone,
}

impl DomainKind {
    /// Whether records of this kind may be referenced as a `template`.
    #[must_use]
    pub const fn is_template(self) -> bool {
        matches!(self, Self::Template)
    }

    /// Whether records of this kind may be referenced as a network
    /// provider. The administrative domain counts: it can carry the
    /// platform's physical uplink.
    #[must_use]
    pub const fn provides_network(self) -> bool {
        matches!(self, Self::NetworkProvider | Self::Administrative)
    }

    /// Whether records of this kind derive their root disk from a
    /// template at clone time.
    #[must_use]
    pub const fn uses_template(self) -> bool {
        matches!(
            self,
            Self::Application | Self::NetworkProvider | Self::Disposable
        )
    }
}

impl fmt::Display for DomainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Administrative => "administrative",
            Self::Template => "template",
            Self::Application => "application",
            Self::NetworkProvider => "network-provider",
            Self::Disposable => "disposable",
            Self::Standalone => "standalone",
        };
        f.write_str(s)
    }
}

/// Caller-supplied description of a new domain, before the registry has
/// assigned it an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSpec {
    /// Domain name, unique across the registry.
    pub name: DomainName,

    /// Domain kind.
    pub kind: DomainKind,

    /// Pre-assigned id, if the caller needs a specific one. Usually left
    /// unset so the registry allocates the first unused id.
    #[serde(default)]
    pub id: Option<DomainId>,

    /// The template this domain's root disk is derived from.
    #[serde(default)]
    pub template: Option<DomainId>,

    /// The domain supplying network connectivity, if any.
    #[serde(default)]
    pub network_provider: Option<DomainId>,

    /// Memory allocation the domain is started with and the balancer
    /// steers toward, in bytes.
    pub memory_target: u64,

    /// Upper bound on the domain's memory allocation, in bytes.
    pub memory_ceiling: u64,

    /// Number of virtual CPUs.
    pub vcpu_count: u32,

    /// Host devices exclusively bound to this domain while it runs.
    #[serde(default)]
    pub exclusive_devices: Vec<String>,

    /// Skip starting the display-isolation daemon for this domain.
    #[serde(default)]
    pub suppress_display_daemon: bool,
}

/// Default memory target for new domains (400 MiB).
const DEFAULT_MEMORY_TARGET: u64 = 400 * 1024 * 1024;

/// Default memory ceiling for new domains (4 GiB).
const DEFAULT_MEMORY_CEILING: u64 = 4 * 1024 * 1024 * 1024;

impl DomainSpec {
    /// Create a spec with default sizing.
    #[must_use]
    pub fn new(name: DomainName, kind: DomainKind) -> Self {
        Self {
            name,
            kind,
            id: None,
            template: None,
            network_provider: None,
            memory_target: DEFAULT_MEMORY_TARGET,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            vcpu_count: 2,
            exclusive_devices: Vec::new(),
            suppress_display_daemon: false,
        }
    }

    /// Request a specific id instead of letting the registry allocate one.
    #[must_use]
    pub const fn with_id(mut self, id: DomainId) -> Self {
        self.id = Some(id);
        self
    }

    /// Derive the root disk from the given template.
    #[must_use]
    pub const fn with_template(mut self, template: DomainId) -> Self {
        self.template = Some(template);
        self
    }

    /// Attach to the given network provider.
    #[must_use]
    pub const fn with_network_provider(mut self, provider: DomainId) -> Self {
        self.network_provider = Some(provider);
        self
    }

    /// Set memory target and ceiling, in bytes.
    #[must_use]
    pub const fn with_memory(mut self, target: u64, ceiling: u64) -> Self {
        self.memory_target = target;
        self.memory_ceiling = ceiling;
        self
    }

    /// Set the number of virtual CPUs.
    #[must_use]
    pub const fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpu_count = vcpus;
        self
    }

    /// Exclusively bind the given host device while the domain runs.
    #[must_use]
    pub fn with_exclusive_device(mut self, device: impl Into<String>) -> Self {
        self.exclusive_devices.push(device.into());
        self
    }

    /// Skip the display-isolation daemon when starting this domain.
    #[must_use]
    pub const fn without_display_daemon(mut self) -> Self {
        self.suppress_display_daemon = true;
        self
    }
}

/// A domain as tracked by the registry.
///
/// `template` and `network_provider` are ownership-free references to
/// other records; the registry enforces that they point at records of the
/// right kind and that the provider relation stays acyclic. The reverse
/// index of provider dependents lives at registry level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Unique, stable id.
    pub id: DomainId,

    /// Unique name. Immutable while the domain is running; renames go
    /// through the lifecycle controller.
    pub name: DomainName,

    /// Domain kind.
    pub kind: DomainKind,

    /// Template the root disk is derived from.
    pub template: Option<DomainId>,

    /// Network provider, if any.
    pub network_provider: Option<DomainId>,

    /// Balancer target, in bytes. Always `<= memory_ceiling`.
    pub memory_target: u64,

    /// Static upper bound on the memory allocation, in bytes.
    pub memory_ceiling: u64,

    /// Number of virtual CPUs.
    pub vcpu_count: u32,

    /// Host devices exclusively bound while running.
    #[serde(default)]
    pub exclusive_devices: Vec<String>,

    /// Skip the display-isolation daemon on start.
    #[serde(default)]
    pub suppress_display_daemon: bool,
}

impl DomainRecord {
    pub(super) fn from_spec(id: DomainId, spec: DomainSpec) -> Self {
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            template: spec.template,
            network_provider: spec.network_provider,
            memory_target: spec.memory_target,
            memory_ceiling: spec.memory_ceiling,
            vcpu_count: spec.vcpu_count,
            exclusive_devices: spec.exclusive_devices,
            suppress_display_daemon: spec.suppress_display_daemon,
        }
    }

    /// The administrative record inserted into every fresh registry.
    pub(super) fn administrative() -> Self {
        Self {
            id: ADMIN_DOMAIN_ID,
            // static literal, always valid
            name: DomainName("host".to_string()),
            kind: DomainKind::Administrative,
            template: None,
            network_provider: None,
            memory_target: DEFAULT_MEMORY_TARGET,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            vcpu_count: 1,
            exclusive_devices: Vec::new(),
            suppress_display_daemon: true,
        }
    }
}
