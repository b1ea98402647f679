//! Declared resources and their kinds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::value::{OutputRef, Properties, Value};

/// The closed set of resource kinds the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Static external IP address.
    Address,
    /// VPC network.
    Network,
    /// Firewall rule attached to a network.
    Firewall,
    /// Persistent disk.
    Disk,
    /// Virtual machine instance.
    Instance,
}

/// Where a resource is in the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Read from the declarations.
    #[default]
    Declared,
    /// An action has been planned for it.
    Planned,
    /// Its action completed successfully.
    Applied,
    /// Its remote object was deleted.
    Destroyed,
}

/// A declared unit of infrastructure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Logical name, unique within a graph.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired properties, possibly containing references.
    pub properties: Properties,
    /// Lifecycle flag.
    pub lifecycle: Lifecycle,
}

impl ResourceKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 5] = [
        Self::Address,
        Self::Network,
        Self::Firewall,
        Self::Disk,
        Self::Instance,
    ];

    /// Returns the lowercase name used in declarations.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Network => "network",
            Self::Firewall => "firewall",
            Self::Disk => "disk",
            Self::Instance => "instance",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Declared => "declared",
            Self::Planned => "planned",
            Self::Applied => "applied",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

impl Resource {
    /// Creates a resource with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            properties: Properties::new(),
            lifecycle: Lifecycle::Declared,
        }
    }

    /// Sets a property, builder style.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns every output reference in the property bag.
    #[must_use]
    pub fn references(&self) -> Vec<OutputRef> {
        let mut refs = Vec::new();
        for value in self.properties.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Returns the distinct names of the resources this one references.
    #[must_use]
    pub fn dependency_names(&self) -> BTreeSet<String> {
        self.references().into_iter().map(|r| r.resource).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_names_are_distinct() {
        let vm = Resource::new("vm", ResourceKind::Instance)
            .with_property("zone", "us-east1-b")
            .with_property("a", "${network.id}")
            .with_property("b", "${network.self_link}")
            .with_property("c", "${addr.address}");

        let deps: Vec<_> = vm.dependency_names().into_iter().collect();
        assert_eq!(deps, vec![String::from("addr"), String::from("network")]);
        assert_eq!(vm.references().len(), 3);
    }

    #[test]
    fn test_kind_serde() {
        let kind: ResourceKind = serde_yaml::from_str("firewall").expect("parse");
        assert_eq!(kind, ResourceKind::Firewall);
        assert_eq!(kind.to_string(), "firewall");
    }
}
