//! Core data model
//!
//! Directory objects, relationships between them, and the in-memory
//! generation plan computed before any directory write happens.
//! Identifiers are distinguished names derived deterministically from the
//! parent path and the object name, which makes them the idempotency key
//! for re-runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The object classes the engine fabricates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    Ou,
    Group,
    User,
    Computer,
    ServiceAccount,
    Gpo,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Ou => "organizationalUnit",
            ObjectType::Group => "group",
            ObjectType::User => "user",
            ObjectType::Computer => "computer",
            ObjectType::ServiceAccount => "user",
            ObjectType::Gpo => "groupPolicyContainer",
        }
    }

    /// RDN attribute used when deriving the object's DN
    pub fn rdn_attribute(&self) -> &'static str {
        match self {
            ObjectType::Ou => "OU",
            _ => "CN",
        }
    }
}

/// Creation status of an object within a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ObjectStatus {
    Pending,
    Created,
    Failed,
}

/// One fabricated directory object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryObject {
    /// Distinguished name; unique within the run and derived from
    /// `parent_dn` + `name`
    pub dn: String,
    pub object_type: ObjectType,
    pub name: String,
    /// DN of the owning container (an OU, or a well-known container)
    pub parent_dn: String,
    pub attributes: BTreeMap<String, String>,
    pub status: ObjectStatus,
}

impl DirectoryObject {
    pub fn new(
        object_type: ObjectType,
        name: impl Into<String>,
        parent_dn: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        let name = name.into();
        let parent_dn = parent_dn.into();
        let dn = derive_dn(object_type, &name, &parent_dn);
        Self {
            dn,
            object_type,
            name,
            parent_dn,
            attributes,
            status: ObjectStatus::Pending,
        }
    }

    /// Nesting depth of the identifier, counted in OU components.
    /// Used to create parents before children.
    pub fn ou_depth(&self) -> usize {
        self.dn
            .split(',')
            .filter(|part| part.trim_start().to_uppercase().starts_with("OU="))
            .count()
    }
}

/// Derive a child DN from its parent path and name.
///
/// Escapes the RDN characters AD treats specially so a generated name can
/// never break out of its component.
pub fn derive_dn(object_type: ObjectType, name: &str, parent_dn: &str) -> String {
    format!(
        "{}={},{}",
        object_type.rdn_attribute(),
        escape_rdn_value(name),
        parent_dn
    )
}

/// Escape special characters in an RDN value (RFC 4514 subset)
pub fn escape_rdn_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, ch) in value.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            '#' if i == 0 => {
                out.push('\\');
                out.push(ch);
            }
            ' ' if i == 0 || i == value.len() - 1 => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Kinds of typed edges between two directory objects
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// group -> member (user, computer, service account, or nested group)
    Membership,
    /// principal is granted a rights set over an OU or object (from = target,
    /// to = trustee)
    Delegation,
    /// OU -> linked GPO (the gPLink lives on the OU)
    GpoLink,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Membership => "membership",
            RelationshipKind::Delegation => "delegation",
            RelationshipKind::GpoLink => "gpo-link",
        }
    }
}

/// A typed edge between two directory objects, identified by their DNs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub from: String,
    pub to: String,
    /// Edge metadata: rights set for delegations, link order for GPO links
    pub attributes: BTreeMap<String, String>,
}

impl Relationship {
    pub fn new(kind: RelationshipKind, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// A misconfiguration the dry-run plan expects to inject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedMisconfig {
    pub rule_id: String,
    pub target_dn: String,
}

/// The full set of intended objects, relationships and misconfigurations,
/// computed entirely in memory before execution. Enables dry-run
/// validation without any directory write.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationPlan {
    pub base_dn: String,
    /// Objects in creation order: OUs (parents first), then groups, then
    /// users/computers/service accounts, then GPOs
    pub objects: Vec<DirectoryObject>,
    pub relationships: Vec<Relationship>,
    /// Preview of the injection stage, evaluated as if every create
    /// succeeds; the injector re-samples against the live registry
    pub planned_misconfigs: Vec<PlannedMisconfig>,
}

impl GenerationPlan {
    pub fn count_of(&self, object_type: ObjectType) -> usize {
        self.objects
            .iter()
            .filter(|o| o.object_type == object_type)
            .count()
    }

    /// Per-type object counts keyed by a stable name, for the dry-run output
    pub fn object_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        counts.insert("ous", self.count_of(ObjectType::Ou));
        counts.insert("groups", self.count_of(ObjectType::Group));
        counts.insert("users", self.count_of(ObjectType::User));
        counts.insert("computers", self.count_of(ObjectType::Computer));
        counts.insert("service_accounts", self.count_of(ObjectType::ServiceAccount));
        counts.insert("gpos", self.count_of(ObjectType::Gpo));
        counts
    }
}

/// DN of the standard GPO home container for a domain
pub fn policies_container(base_dn: &str) -> String {
    format!("CN=Policies,CN=System,{}", base_dn)
}

/// Containers assumed to pre-exist on any target domain; objects parented
/// here do not wait for an OU create to be confirmed.
pub fn is_well_known_container(dn: &str, base_dn: &str) -> bool {
    if dn.eq_ignore_ascii_case(base_dn) {
        return true;
    }
    let well_known = [
        format!("CN=Users,{}", base_dn),
        format!("CN=Computers,{}", base_dn),
        format!("CN=System,{}", base_dn),
        policies_container(base_dn),
        format!("OU=Domain Controllers,{}", base_dn),
    ];
    well_known.iter().any(|w| dn.eq_ignore_ascii_case(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dn_derivation() {
        let obj = DirectoryObject::new(
            ObjectType::User,
            "Ada Lovelace",
            "OU=Engineering,DC=range,DC=local",
            BTreeMap::new(),
        );
        assert_eq!(obj.dn, "CN=Ada Lovelace,OU=Engineering,DC=range,DC=local");
        assert_eq!(obj.status, ObjectStatus::Pending);
    }

    #[test]
    fn test_dn_unique_per_sibling_name() {
        let parent = "OU=Sales,DC=range,DC=local";
        let a = derive_dn(ObjectType::User, "Sam Oak", parent);
        let b = derive_dn(ObjectType::User, "Sam Oak", parent);
        let c = derive_dn(ObjectType::User, "Sam Oak 2", parent);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rdn_escaping() {
        assert_eq!(escape_rdn_value("Smith, John"), "Smith\\, John");
        assert_eq!(escape_rdn_value(" lead"), "\\ lead");
        assert_eq!(escape_rdn_value("a=b"), "a\\=b");
    }

    #[test]
    fn test_ou_depth() {
        let obj = DirectoryObject::new(
            ObjectType::User,
            "x",
            "OU=Team,OU=Engineering,DC=range,DC=local",
            BTreeMap::new(),
        );
        assert_eq!(obj.ou_depth(), 2);
    }

    #[test]
    fn test_well_known_containers() {
        let base = "DC=range,DC=local";
        assert!(is_well_known_container(base, base));
        assert!(is_well_known_container("CN=Users,DC=range,DC=local", base));
        assert!(is_well_known_container(
            "CN=Policies,CN=System,DC=range,DC=local",
            base
        ));
        assert!(!is_well_known_container(
            "OU=Engineering,DC=range,DC=local",
            base
        ));
    }
}
