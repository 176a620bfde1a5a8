//! Naming & attribute generation
//!
//! Pure, stateless draws from weighted distributions. Every sample takes
//! the caller's RNG, so a run seeded identically replays identically.
//! Built-in tables cover the common attribute pools; configuration may
//! override or extend any of them.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ForgeError, Result};

/// One weighted value in a distribution table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedEntry {
    pub value: String,
    pub weight: u32,
}

impl WeightedEntry {
    fn new(value: &str, weight: u32) -> Self {
        Self {
            value: value.to_string(),
            weight,
        }
    }
}

/// A named distribution: values plus a prebuilt weighted index
#[derive(Debug, Clone)]
struct WeightedTable {
    values: Vec<String>,
    index: WeightedIndex<u32>,
}

impl WeightedTable {
    fn build(name: &str, entries: &[WeightedEntry]) -> Result<Self> {
        if entries.is_empty() {
            return Err(ForgeError::config(format!(
                "naming distribution '{}' is empty",
                name
            )));
        }
        let weights: Vec<u32> = entries.iter().map(|e| e.weight).collect();
        let index = WeightedIndex::new(&weights).map_err(|e| {
            ForgeError::config(format!("naming distribution '{}' invalid: {}", name, e))
        })?;
        Ok(Self {
            values: entries.iter().map(|e| e.value.clone()).collect(),
            index,
        })
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        &self.values[self.index.sample(rng)]
    }
}

pub const DIST_FIRST_NAMES: &str = "first_names";
pub const DIST_LAST_NAMES: &str = "last_names";
pub const DIST_ORG_UNITS: &str = "org_units";
pub const DIST_GROUP_NAMES: &str = "group_names";
pub const DIST_PRIVILEGED_GROUPS: &str = "privileged_group_names";
pub const DIST_JOB_TITLES: &str = "job_titles";
pub const DIST_COMPUTER_PREFIXES: &str = "computer_prefixes";
pub const DIST_OPERATING_SYSTEMS: &str = "operating_systems";
pub const DIST_SERVICES: &str = "services";
pub const DIST_GPO_NAMES: &str = "gpo_names";
pub const DIST_WEAK_PASSWORDS: &str = "weak_passwords";

/// Generator over the configured distribution tables. Owns no RNG and
/// performs no I/O.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    tables: BTreeMap<String, WeightedTable>,
}

impl NameGenerator {
    /// Built-in tables only
    pub fn new() -> Self {
        // Defaults are valid by construction
        Self::with_overrides(&BTreeMap::new()).unwrap_or(Self {
            tables: BTreeMap::new(),
        })
    }

    /// Built-in tables merged with configuration overrides; an override
    /// replaces the default table of the same name wholesale.
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<WeightedEntry>>) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for (name, entries) in default_distributions() {
            tables.insert(name.to_string(), WeightedTable::build(name, &entries)?);
        }
        for (name, entries) in overrides {
            tables.insert(name.clone(), WeightedTable::build(name, entries)?);
        }
        Ok(Self { tables })
    }

    /// Draw one value from the named distribution; `None` if the table
    /// does not exist.
    pub fn sample<R: Rng + ?Sized>(&self, table: &str, rng: &mut R) -> Option<String> {
        self.tables.get(table).map(|t| t.sample(rng).to_string())
    }

    fn sample_or<R: Rng + ?Sized>(&self, table: &str, rng: &mut R, fallback: &str) -> String {
        self.sample(table, rng)
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn first_name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_FIRST_NAMES, rng, "Alex")
    }

    pub fn last_name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_LAST_NAMES, rng, "Smith")
    }

    pub fn org_unit<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_ORG_UNITS, rng, "Operations")
    }

    pub fn group_name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_GROUP_NAMES, rng, "Staff")
    }

    pub fn privileged_group_name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_PRIVILEGED_GROUPS, rng, "Tier-1 Admins")
    }

    pub fn job_title<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_JOB_TITLES, rng, "Analyst")
    }

    pub fn computer_prefix<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_COMPUTER_PREFIXES, rng, "WS")
    }

    pub fn operating_system<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_OPERATING_SYSTEMS, rng, "Windows 10 Enterprise")
    }

    pub fn service_name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_SERVICES, rng, "backup")
    }

    pub fn gpo_name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_GPO_NAMES, rng, "Baseline Policy")
    }

    pub fn weak_password<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.sample_or(DIST_WEAK_PASSWORDS, rng, "Summer2024!")
    }
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a sAMAccountName from a person's name; `discriminator` breaks
/// collisions (0 means none).
pub fn sam_account_name(first: &str, last: &str, discriminator: u32) -> String {
    let base: String = first
        .chars()
        .take(1)
        .chain(last.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    // sAMAccountName is capped at 20 characters
    let mut sam: String = base.chars().take(16).collect();
    if discriminator > 0 {
        sam.push_str(&discriminator.to_string());
    }
    sam
}

fn default_distributions() -> Vec<(&'static str, Vec<WeightedEntry>)> {
    vec![
        (
            DIST_FIRST_NAMES,
            [
                ("James", 8), ("Mary", 8), ("Robert", 7), ("Patricia", 7),
                ("John", 7), ("Jennifer", 6), ("Michael", 7), ("Linda", 5),
                ("David", 6), ("Elizabeth", 5), ("William", 5), ("Barbara", 4),
                ("Richard", 4), ("Susan", 4), ("Joseph", 4), ("Jessica", 4),
                ("Thomas", 4), ("Sarah", 4), ("Carlos", 3), ("Karen", 3),
                ("Wei", 3), ("Priya", 3), ("Ahmed", 3), ("Fatima", 3),
                ("Olga", 2), ("Kenji", 2), ("Amara", 2), ("Lucas", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_LAST_NAMES,
            [
                ("Smith", 8), ("Johnson", 7), ("Williams", 6), ("Brown", 6),
                ("Jones", 5), ("Garcia", 5), ("Miller", 5), ("Davis", 5),
                ("Rodriguez", 4), ("Martinez", 4), ("Hernandez", 3), ("Lopez", 3),
                ("Wilson", 3), ("Anderson", 3), ("Taylor", 3), ("Thomas", 3),
                ("Nguyen", 3), ("Kim", 3), ("Patel", 3), ("Chen", 3),
                ("Ivanova", 2), ("Kowalski", 2), ("Okafor", 2), ("Tanaka", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_ORG_UNITS,
            [
                ("Engineering", 6), ("Sales", 6), ("Finance", 5), ("Human Resources", 4),
                ("Marketing", 4), ("IT Operations", 5), ("Legal", 2), ("Research", 3),
                ("Support", 4), ("Procurement", 2), ("Facilities", 2), ("Security", 3),
                ("Product", 3), ("Data Services", 2), ("Field Offices", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_GROUP_NAMES,
            [
                ("All Staff", 4), ("Project Alpha", 3), ("Project Phoenix", 3),
                ("File Share Access", 5), ("VPN Users", 5), ("Printer Access", 4),
                ("Remote Desktop Users", 4), ("SQL Readers", 3), ("App Deployers", 2),
                ("Build Agents", 2), ("Shared Mailbox", 3), ("Intranet Editors", 2),
                ("Wiki Contributors", 2), ("Lab Access", 2), ("Badge Holders", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_PRIVILEGED_GROUPS,
            [
                ("IT Admins", 5), ("Helpdesk Admins", 4), ("Server Operators Tier 2", 3),
                ("Workstation Admins", 3), ("Backup Operators Ext", 2),
                ("SQL Administrators", 2), ("Exchange Admins", 2), ("Tier-1 Admins", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_JOB_TITLES,
            [
                ("Analyst", 6), ("Senior Analyst", 4), ("Engineer", 6),
                ("Senior Engineer", 4), ("Manager", 4), ("Director", 2),
                ("Coordinator", 3), ("Specialist", 4), ("Consultant", 3),
                ("Administrator", 3), ("Architect", 2), ("Intern", 2),
                ("Vice President", 1),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_COMPUTER_PREFIXES,
            [("WS", 6), ("LT", 4), ("SRV", 2), ("VD", 2), ("KIOSK", 1)]
                .iter()
                .map(|(v, w)| WeightedEntry::new(v, *w))
                .collect(),
        ),
        (
            DIST_OPERATING_SYSTEMS,
            [
                ("Windows 10 Enterprise", 5), ("Windows 11 Enterprise", 4),
                ("Windows Server 2019 Standard", 2), ("Windows Server 2022 Standard", 2),
                ("Windows Server 2016 Standard", 1),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_SERVICES,
            [
                ("sql", 4), ("backup", 3), ("web", 3), ("monitor", 2),
                ("deploy", 2), ("scan", 2), ("etl", 1), ("print", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_GPO_NAMES,
            [
                ("Default Workstation Policy", 4), ("Password Policy", 3),
                ("Drive Mapping", 4), ("Screen Lock Policy", 3),
                ("Software Deployment", 3), ("Firewall Baseline", 2),
                ("Proxy Settings", 2), ("Audit Policy", 2),
                ("Logon Banner", 2), ("Printer Deployment", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
        (
            DIST_WEAK_PASSWORDS,
            [
                ("Summer2024!", 4), ("Welcome1", 4), ("Password123", 3),
                ("Changeme!1", 3), ("CompanyName1!", 2), ("Temp1234", 2),
            ]
            .iter()
            .map(|(v, w)| WeightedEntry::new(v, *w))
            .collect(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_replays_identically() {
        let names = NameGenerator::new();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            assert_eq!(names.first_name(&mut a), names.first_name(&mut b));
            assert_eq!(names.org_unit(&mut a), names.org_unit(&mut b));
        }
    }

    #[test]
    fn test_samples_come_from_table() {
        let names = NameGenerator::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let os = names.operating_system(&mut rng);
            assert!(os.starts_with("Windows"));
        }
    }

    #[test]
    fn test_override_replaces_default_table() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            DIST_ORG_UNITS.to_string(),
            vec![WeightedEntry::new("Skunkworks", 1)],
        );
        let names = NameGenerator::with_overrides(&overrides).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(names.org_unit(&mut rng), "Skunkworks");
    }

    #[test]
    fn test_empty_override_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert(DIST_ORG_UNITS.to_string(), vec![]);
        assert!(NameGenerator::with_overrides(&overrides).is_err());
    }

    #[test]
    fn test_unknown_table_is_none() {
        let names = NameGenerator::new();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(names.sample("no_such_table", &mut rng).is_none());
    }

    #[test]
    fn test_sam_account_name() {
        assert_eq!(sam_account_name("Ada", "Lovelace", 0), "alovelace");
        assert_eq!(sam_account_name("Ada", "Lovelace", 2), "alovelace2");
        assert_eq!(sam_account_name("Mary-Jane", "O'Brien", 0), "mobrien");
    }
}
