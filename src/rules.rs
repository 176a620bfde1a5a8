//! Misconfiguration rule catalog
//!
//! Each rule names the weakness it seeds, the object type it targets, an
//! eligibility predicate and an apply function producing the attribute or
//! relationship delta. The catalog is fixed; per-rule sampling fractions
//! come from configuration.

use rand::seq::IteratorRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{DirectoryObject, ObjectType, Relationship, RelationshipKind};
use crate::naming::NameGenerator;
use crate::registry::ObjectRegistry;

/// userAccountControl bit flags relevant to seeded weaknesses
pub mod uac_flags {
    pub const ENCRYPTED_TEXT_PASSWORD_ALLOWED: u32 = 0x0080;
    pub const NORMAL_ACCOUNT: u32 = 0x0200;
    pub const DONT_EXPIRE_PASSWORD: u32 = 0x10000;
    pub const TRUSTED_FOR_DELEGATION: u32 = 0x80000;
    pub const USE_DES_KEY_ONLY: u32 = 0x200000;
    pub const DONT_REQ_PREAUTH: u32 = 0x400000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RuleSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSeverity::Low => "low",
            RuleSeverity::Medium => "medium",
            RuleSeverity::High => "high",
            RuleSeverity::Critical => "critical",
        }
    }
}

/// The concrete change a rule application produces
#[derive(Debug, Clone)]
pub enum RuleEffect {
    SetAttributes(BTreeMap<String, String>),
    AddRelationship(Relationship),
}

impl RuleEffect {
    /// Serializable description of the change, recorded in the ledger
    pub fn delta(&self) -> BTreeMap<String, String> {
        match self {
            RuleEffect::SetAttributes(attrs) => attrs.clone(),
            RuleEffect::AddRelationship(rel) => {
                let mut delta = BTreeMap::from([
                    ("relationship".to_string(), format!("{:?}", rel.kind)),
                    ("from".to_string(), rel.from.clone()),
                    ("to".to_string(), rel.to.clone()),
                ]);
                for (k, v) in &rel.attributes {
                    delta.insert(k.clone(), v.clone());
                }
                delta
            }
        }
    }
}

type Predicate = fn(&DirectoryObject, &ObjectRegistry) -> bool;
type Apply = fn(
    &DirectoryObject,
    &ObjectRegistry,
    &NameGenerator,
    &mut dyn rand::RngCore,
) -> Option<RuleEffect>;

pub struct MisconfigRule {
    pub id: &'static str,
    pub name: &'static str,
    pub severity: RuleSeverity,
    pub target: ObjectType,
    pub description: &'static str,
    pub remediation: &'static str,
    pub predicate: Predicate,
    pub apply: Apply,
}

fn parse_uac(object: &DirectoryObject) -> u32 {
    object
        .attributes
        .get("userAccountControl")
        .and_then(|v| v.parse().ok())
        .unwrap_or(uac_flags::NORMAL_ACCOUNT)
}

fn set_uac_flag(object: &DirectoryObject, flag: u32) -> Option<RuleEffect> {
    let uac = parse_uac(object) | flag;
    Some(RuleEffect::SetAttributes(BTreeMap::from([(
        "userAccountControl".to_string(),
        uac.to_string(),
    )])))
}

fn lacks_uac_flag(object: &DirectoryObject, flag: u32) -> bool {
    parse_uac(object) & flag == 0
}

fn random_created_user<R: Rng + ?Sized>(
    registry: &ObjectRegistry,
    rng: &mut R,
) -> Option<DirectoryObject> {
    registry
        .created_of_type(ObjectType::User)
        .into_iter()
        .choose(rng)
}

/// The full built-in catalog, in stable id order.
pub fn catalog() -> Vec<MisconfigRule> {
    vec![
        MisconfigRule {
            id: "computer-unconstrained-delegation",
            name: "Unconstrained delegation on computer",
            severity: RuleSeverity::Critical,
            target: ObjectType::Computer,
            description: "Computer trusted for unconstrained Kerberos delegation",
            remediation: "Clear TRUSTED_FOR_DELEGATION; use resource-based constrained delegation",
            predicate: |o, _| lacks_uac_flag(o, uac_flags::TRUSTED_FOR_DELEGATION),
            apply: |o, _, _, _| set_uac_flag(o, uac_flags::TRUSTED_FOR_DELEGATION),
        },
        MisconfigRule {
            id: "gpo-edit-rights-loose",
            name: "GPO editable by non-administrators",
            severity: RuleSeverity::High,
            target: ObjectType::Gpo,
            description: "A regular user holds write rights on a linked GPO",
            remediation: "Restrict GPO edit rights to Domain Admins and delegated GPO admins",
            predicate: |_, registry| !registry.created_of_type(ObjectType::User).is_empty(),
            apply: |gpo, registry, _, rng| {
                let trustee = random_created_user(registry, rng)?;
                Some(RuleEffect::AddRelationship(
                    Relationship::new(RelationshipKind::Delegation, gpo.dn.clone(), trustee.dn)
                        .with_attribute("rights", "GenericWrite"),
                ))
            },
        },
        MisconfigRule {
            id: "gpo-grants-delegation-privilege",
            name: "GPO grants SeEnableDelegationPrivilege",
            severity: RuleSeverity::High,
            target: ObjectType::Gpo,
            description: "A linked GPO assigns SeEnableDelegationPrivilege to a regular user",
            remediation: "Remove the user-rights assignment from the GPO",
            predicate: |gpo, registry| {
                !gpo.attributes.contains_key("seEnableDelegationPrivilege")
                    && !registry.created_of_type(ObjectType::User).is_empty()
            },
            apply: |_, registry, _, rng| {
                let trustee = random_created_user(registry, rng)?;
                let sam = trustee.attributes.get("sAMAccountName")?.clone();
                Some(RuleEffect::SetAttributes(BTreeMap::from([(
                    "seEnableDelegationPrivilege".to_string(),
                    sam,
                )])))
            },
        },
        MisconfigRule {
            id: "group-nonadmin-in-privileged",
            name: "Non-admin principal in privileged group",
            severity: RuleSeverity::High,
            target: ObjectType::Group,
            description: "A regular user is a member of a privileged group",
            remediation: "Review privileged group membership; remove unvetted principals",
            predicate: |group, registry| {
                group.attributes.get("adminCount").map(String::as_str) == Some("1")
                    && !registry.created_of_type(ObjectType::User).is_empty()
            },
            apply: |group, registry, _, rng| {
                let member = random_created_user(registry, rng)?;
                Some(RuleEffect::AddRelationship(Relationship::new(
                    RelationshipKind::Membership,
                    group.dn.clone(),
                    member.dn,
                )))
            },
        },
        MisconfigRule {
            id: "ou-overbroad-delegation",
            name: "Overbroad delegation on OU",
            severity: RuleSeverity::Critical,
            target: ObjectType::Ou,
            description: "A regular user holds GenericAll or WriteDacl over an entire OU subtree",
            remediation: "Replace the grant with the narrowest delegation that covers the task",
            predicate: |_, registry| !registry.created_of_type(ObjectType::User).is_empty(),
            apply: |ou, registry, _, rng| {
                let trustee = random_created_user(registry, rng)?;
                let rights = if rng.next_u32() % 2 == 0 {
                    "GenericAll"
                } else {
                    "WriteDacl"
                };
                Some(RuleEffect::AddRelationship(
                    Relationship::new(RelationshipKind::Delegation, ou.dn.clone(), trustee.dn)
                        .with_attribute("rights", rights),
                ))
            },
        },
        MisconfigRule {
            id: "svc-unconstrained-delegation",
            name: "Unconstrained delegation on service account",
            severity: RuleSeverity::Critical,
            target: ObjectType::ServiceAccount,
            description: "Service account trusted for unconstrained Kerberos delegation",
            remediation: "Clear TRUSTED_FOR_DELEGATION; constrain delegation to required services",
            predicate: |o, _| lacks_uac_flag(o, uac_flags::TRUSTED_FOR_DELEGATION),
            apply: |o, _, _, _| set_uac_flag(o, uac_flags::TRUSTED_FOR_DELEGATION),
        },
        MisconfigRule {
            id: "user-asrep-roastable",
            name: "Kerberos pre-authentication disabled",
            severity: RuleSeverity::High,
            target: ObjectType::User,
            description: "Account does not require Kerberos pre-authentication (AS-REP roastable)",
            remediation: "Clear DONT_REQ_PREAUTH on the account",
            predicate: |o, _| lacks_uac_flag(o, uac_flags::DONT_REQ_PREAUTH),
            apply: |o, _, _, _| set_uac_flag(o, uac_flags::DONT_REQ_PREAUTH),
        },
        MisconfigRule {
            id: "user-des-only",
            name: "DES-only Kerberos keys",
            severity: RuleSeverity::Medium,
            target: ObjectType::User,
            description: "Account restricted to DES encryption for Kerberos",
            remediation: "Clear USE_DES_KEY_ONLY and rotate the password",
            predicate: |o, _| lacks_uac_flag(o, uac_flags::USE_DES_KEY_ONLY),
            apply: |o, _, _, _| set_uac_flag(o, uac_flags::USE_DES_KEY_ONLY),
        },
        MisconfigRule {
            id: "user-kerberoastable-spn",
            name: "SPN on a regular user account",
            severity: RuleSeverity::High,
            target: ObjectType::User,
            description: "User account carries a servicePrincipalName and is kerberoastable",
            remediation: "Move the SPN to a managed service account",
            predicate: |o, _| !o.attributes.contains_key("servicePrincipalName"),
            apply: |o, _, names, rng| {
                let sam = o.attributes.get("sAMAccountName")?;
                let service = names.service_name(rng);
                Some(RuleEffect::SetAttributes(BTreeMap::from([(
                    "servicePrincipalName".to_string(),
                    format!("{}/{}", service.to_uppercase(), sam),
                )])))
            },
        },
        MisconfigRule {
            id: "user-password-in-description",
            name: "Password stored in description",
            severity: RuleSeverity::High,
            target: ObjectType::User,
            description: "Account password written into the description attribute",
            remediation: "Clear the description and rotate the password",
            predicate: |o, _| {
                !o.attributes
                    .get("description")
                    .map(|d| d.contains("Password"))
                    .unwrap_or(false)
            },
            apply: |_, _, names, rng| {
                let password = names.weak_password(rng);
                Some(RuleEffect::SetAttributes(BTreeMap::from([(
                    "description".to_string(),
                    format!("Password: {}", password),
                )])))
            },
        },
        MisconfigRule {
            id: "user-password-never-expires",
            name: "Password never expires",
            severity: RuleSeverity::Low,
            target: ObjectType::User,
            description: "Account password is exempt from expiry policy",
            remediation: "Clear DONT_EXPIRE_PASSWORD and enforce the domain password policy",
            predicate: |o, _| lacks_uac_flag(o, uac_flags::DONT_EXPIRE_PASSWORD),
            apply: |o, _, _, _| set_uac_flag(o, uac_flags::DONT_EXPIRE_PASSWORD),
        },
        MisconfigRule {
            id: "user-reversible-encryption",
            name: "Reversible password encryption",
            severity: RuleSeverity::Medium,
            target: ObjectType::User,
            description: "Account stores its password with reversible encryption",
            remediation: "Clear ENCRYPTED_TEXT_PASSWORD_ALLOWED and rotate the password",
            predicate: |o, _| lacks_uac_flag(o, uac_flags::ENCRYPTED_TEXT_PASSWORD_ALLOWED),
            apply: |o, _, _, _| set_uac_flag(o, uac_flags::ENCRYPTED_TEXT_PASSWORD_ALLOWED),
        },
    ]
}
