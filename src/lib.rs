//! rangeforge: fabricate a realistic, deliberately misconfigured Active
//! Directory domain for security training ranges.
//!
//! A run plans an OU hierarchy, account and policy population from a
//! seed, creates it over LDAP, weaves memberships, GPO links and
//! delegations, then seeds a catalog of auditable misconfigurations.
//! Every seeded weakness lands in an append-only answer-key ledger.

pub mod adapter;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hierarchy;
pub mod injector;
pub mod ledger;
pub mod model;
pub mod naming;
pub mod population;
pub mod registry;
pub mod rules;
pub mod summary;
pub mod weaver;

pub use adapter::{DirectoryAdapter, LdapDirectoryAdapter};
pub use config::ForgeConfig;
pub use engine::{plan, ForgeEngine};
pub use errors::{ForgeError, Result};
pub use ledger::AnswerKeyLedger;
pub use model::{DirectoryObject, GenerationPlan, ObjectType, Relationship, RelationshipKind};
pub use summary::RunSummary;
