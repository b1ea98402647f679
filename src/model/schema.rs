//! Per-kind property schemas.
//!
//! Each kind declares the properties it accepts, their types, whether they are
//! required, and whether a change can be applied in place or forces the remote
//! object to be recreated. Kinds also list the outputs other resources may
//! reference and whether they survive a dependency being replaced underneath
//! them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::GraphError;

use super::resource::{Resource, ResourceKind};
use super::value::{PlannedProperties, PlannedValue, Properties, Value};

/// Accepted shape of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// `true` / `false`.
    Bool,
    /// Integer.
    Integer,
    /// String or reference.
    String,
    /// List of strings or references.
    StringList,
    /// Map of strings or references.
    StringMap,
    /// Free-form nested object.
    Object,
    /// List of free-form nested objects.
    ObjectList,
}

/// What happens when a property changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePolicy {
    /// The provider can update the remote object in place.
    Update,
    /// The remote object must be deleted and created again.
    Replace,
}

/// Whether a resource survives its dependency being replaced while it is
/// only updated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceTolerance {
    /// The dependency may disappear briefly.
    Tolerates,
    /// The dependency must never disappear underneath it.
    Forbids,
}

/// Outcome of comparing recorded and desired properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffPolicy {
    /// Nothing changed.
    Noop,
    /// Only in-place updatable fields changed.
    Update,
    /// At least one field forces recreation.
    Replace,
}

/// Schema entry for one property.
#[derive(Debug, Clone, Copy)]
pub struct PropertySchema {
    /// Property name.
    pub name: &'static str,
    /// Accepted type.
    pub ty: PropertyType,
    /// Whether the property must be declared.
    pub required: bool,
    /// Change policy.
    pub policy: ChangePolicy,
}

/// Schema for one resource kind.
#[derive(Debug)]
pub struct KindSchema {
    /// The kind.
    pub kind: ResourceKind,
    /// Accepted properties.
    pub properties: &'static [PropertySchema],
    /// Outputs the provider returns for this kind.
    pub outputs: &'static [&'static str],
    /// Behavior when a dependency is replaced.
    pub replace_tolerance: ReplaceTolerance,
}

const fn prop(
    name: &'static str,
    ty: PropertyType,
    required: bool,
    policy: ChangePolicy,
) -> PropertySchema {
    PropertySchema {
        name,
        ty,
        required,
        policy,
    }
}

use ChangePolicy::{Replace, Update};
use PropertyType::{Bool, Integer, Object, ObjectList, StringList, StringMap};

static ADDRESS: KindSchema = KindSchema {
    kind: ResourceKind::Address,
    properties: &[
        prop("region", PropertyType::String, true, Replace),
        prop("address_type", PropertyType::String, false, Replace),
        prop("description", PropertyType::String, false, Replace),
        prop("labels", StringMap, false, Update),
    ],
    outputs: &["id", "address", "self_link"],
    replace_tolerance: ReplaceTolerance::Tolerates,
};

static NETWORK: KindSchema = KindSchema {
    kind: ResourceKind::Network,
    properties: &[
        prop("auto_create_subnetworks", Bool, false, Replace),
        prop("description", PropertyType::String, false, Replace),
        prop("mtu", Integer, false, Replace),
        prop("routing_mode", PropertyType::String, false, Update),
    ],
    outputs: &["id", "name", "self_link"],
    replace_tolerance: ReplaceTolerance::Tolerates,
};

static FIREWALL: KindSchema = KindSchema {
    kind: ResourceKind::Firewall,
    properties: &[
        prop("network", PropertyType::String, true, Replace),
        prop("allows", ObjectList, true, Update),
        prop("denies", ObjectList, false, Update),
        prop("direction", PropertyType::String, false, Replace),
        prop("priority", Integer, false, Update),
        prop("source_ranges", StringList, false, Update),
        prop("target_tags", StringList, false, Update),
        prop("description", PropertyType::String, false, Update),
    ],
    outputs: &["id", "self_link"],
    replace_tolerance: ReplaceTolerance::Tolerates,
};

static DISK: KindSchema = KindSchema {
    kind: ResourceKind::Disk,
    properties: &[
        prop("zone", PropertyType::String, true, Replace),
        prop("image", PropertyType::String, false, Replace),
        prop("type", PropertyType::String, false, Replace),
        prop("size", Integer, false, Update),
        prop("labels", StringMap, false, Update),
    ],
    outputs: &["id", "name", "self_link"],
    replace_tolerance: ReplaceTolerance::Tolerates,
};

static INSTANCE: KindSchema = KindSchema {
    kind: ResourceKind::Instance,
    properties: &[
        prop("zone", PropertyType::String, true, Replace),
        prop("machine_type", PropertyType::String, true, Update),
        prop("boot_disk", Object, true, Replace),
        prop("network_interfaces", ObjectList, true, Replace),
        prop("guest_accelerators", ObjectList, false, Update),
        prop("scheduling", Object, false, Update),
        prop("metadata", StringMap, false, Update),
        prop("metadata_startup_script", PropertyType::String, false, Replace),
        prop("tags", StringList, false, Update),
        prop("labels", StringMap, false, Update),
    ],
    outputs: &["id", "name", "self_link", "internal_ip"],
    replace_tolerance: ReplaceTolerance::Forbids,
};

/// Returns the schema for a kind.
#[must_use]
pub const fn schema_for(kind: ResourceKind) -> &'static KindSchema {
    match kind {
        ResourceKind::Address => &ADDRESS,
        ResourceKind::Network => &NETWORK,
        ResourceKind::Firewall => &FIREWALL,
        ResourceKind::Disk => &DISK,
        ResourceKind::Instance => &INSTANCE,
    }
}

impl PropertyType {
    /// Returns true if `value` has this shape.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Bool, Value::Bool(_))
            | (Self::Integer, Value::Integer(_))
            | (Self::Object, Value::Map(_)) => true,
            (Self::String, v) => v.is_stringish(),
            (Self::StringList, Value::List(items)) => items.iter().all(Value::is_stringish),
            (Self::StringMap, Value::Map(map)) => map.values().all(Value::is_stringish),
            (Self::ObjectList, Value::List(items)) => {
                items.iter().all(|v| matches!(v, Value::Map(_)))
            }
            _ => false,
        }
    }

    /// Human-readable description of the shape.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Bool => "a boolean",
            Self::Integer => "an integer",
            Self::String => "a string",
            Self::StringList => "a list of strings",
            Self::StringMap => "a map of strings",
            Self::Object => "an object",
            Self::ObjectList => "a list of objects",
        }
    }
}

impl KindSchema {
    /// Looks up a property schema by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertySchema> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Returns true if the kind exposes the named output.
    #[must_use]
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains(&name)
    }

    /// Checks a resource's property bag against this schema.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Schema`] for unknown, missing or mistyped
    /// properties.
    pub fn validate(&self, resource: &Resource) -> Result<(), GraphError> {
        let schema_error = |property: &str, message: String| GraphError::Schema {
            resource: resource.name.clone(),
            kind: self.kind.to_string(),
            property: property.to_string(),
            message,
        };

        for (name, value) in &resource.properties {
            let Some(schema) = self.property(name) else {
                return Err(schema_error(name, String::from("unknown property")));
            };
            if !schema.ty.accepts(value) {
                return Err(schema_error(
                    name,
                    format!(
                        "expected {}, found {}",
                        schema.ty.describe(),
                        value.type_name()
                    ),
                ));
            }
        }

        if let Some(missing) = self
            .properties
            .iter()
            .find(|p| p.required && !resource.properties.contains_key(p.name))
        {
            return Err(schema_error(
                missing.name,
                String::from("required property is missing"),
            ));
        }

        Ok(())
    }

    /// Returns the names of properties whose desired value differs from the
    /// recorded one. Unknown values always count as changed.
    #[must_use]
    pub fn changed_fields(old: &Properties, new: &PlannedProperties) -> Vec<String> {
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        keys.into_iter()
            .filter(|key| match (old.get(*key), new.get(*key)) {
                (Some(o), Some(PlannedValue::Known(n))) => o != n,
                (None, None) => false,
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Decides whether the change from `old` to `new` is a no-op, an
    /// in-place update or a replacement.
    ///
    /// A changed property the schema does not know forces replacement.
    #[must_use]
    pub fn diff_policy(&self, old: &Properties, new: &PlannedProperties) -> DiffPolicy {
        let changed = Self::changed_fields(old, new);
        if changed.is_empty() {
            return DiffPolicy::Noop;
        }

        let replace = changed.iter().any(|field| {
            self.property(field)
                .is_none_or(|p| p.policy == ChangePolicy::Replace)
        });

        if replace {
            DiffPolicy::Replace
        } else {
            DiffPolicy::Update
        }
    }
}

impl std::fmt::Display for DiffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Noop => "noop",
            Self::Update => "update",
            Self::Replace => "replace",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(props: &Properties) -> PlannedProperties {
        props
            .iter()
            .map(|(k, v)| (k.clone(), PlannedValue::Known(v.clone())))
            .collect()
    }

    fn disk() -> Resource {
        Resource::new("disk", ResourceKind::Disk)
            .with_property("size", 200_i64)
            .with_property("image", "ubuntu-os-cloud/ubuntu-1804-lts")
            .with_property("zone", "us-east1-b")
    }

    #[test]
    fn test_validate_accepts_declared_disk() {
        assert!(schema_for(ResourceKind::Disk).validate(&disk()).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_property() {
        let bad = disk().with_property("colour", "blue");
        let err = schema_for(ResourceKind::Disk)
            .validate(&bad)
            .expect_err("unknown property");
        assert!(matches!(err, GraphError::Schema { ref property, .. } if property == "colour"));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let bad = disk().with_property("size", "large");
        let err = schema_for(ResourceKind::Disk)
            .validate(&bad)
            .expect_err("wrong type");
        assert!(err.to_string().contains("expected an integer"));
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let bad = Resource::new("disk", ResourceKind::Disk).with_property("size", 10_i64);
        let err = schema_for(ResourceKind::Disk)
            .validate(&bad)
            .expect_err("missing zone");
        assert!(matches!(err, GraphError::Schema { ref property, .. } if property == "zone"));
    }

    #[test]
    fn test_references_accepted_for_strings() {
        let fw = Resource::new("fw", ResourceKind::Firewall)
            .with_property("network", "${network.id}")
            .with_property("allows", Value::List(vec![]));
        assert!(schema_for(ResourceKind::Firewall).validate(&fw).is_ok());
    }

    #[test]
    fn test_diff_policy() {
        let schema = schema_for(ResourceKind::Disk);
        let old = disk().properties;

        assert_eq!(schema.diff_policy(&old, &known(&old)), DiffPolicy::Noop);

        let resized = disk().with_property("size", 500_i64).properties;
        assert_eq!(schema.diff_policy(&old, &known(&resized)), DiffPolicy::Update);

        let reimaged = disk()
            .with_property("size", 500_i64)
            .with_property("image", "ubuntu-os-cloud/ubuntu-2204-lts")
            .properties;
        assert_eq!(schema.diff_policy(&old, &known(&reimaged)), DiffPolicy::Replace);
    }

    #[test]
    fn test_unknown_value_counts_as_changed() {
        let old = Resource::new("fw", ResourceKind::Firewall)
            .with_property("network", "net-1")
            .properties;
        let mut new = known(&old);
        new.insert(String::from("network"), PlannedValue::Unknown);

        assert_eq!(KindSchema::changed_fields(&old, &new), vec![String::from("network")]);
        assert_eq!(
            schema_for(ResourceKind::Firewall).diff_policy(&old, &new),
            DiffPolicy::Replace
        );
    }
}
