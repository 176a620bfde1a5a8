//! Directory execution adapter
//!
//! The only code that talks to the live directory. Exposes idempotent,
//! safely retryable primitives: re-issuing a create for an existing
//! identifier reports `AlreadyExists` instead of failing or duplicating.
//! Transient failures are retried with exponential backoff up to a capped
//! attempt count; permanent failures surface immediately.

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, RetryConfig};
use crate::errors::{ForgeError, Result};
use crate::model::{DirectoryObject, ObjectType, Relationship, RelationshipKind};

/// Outcome of an idempotent create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Idempotent write primitives against the target directory
#[async_trait]
pub trait DirectoryAdapter: Send + Sync {
    async fn create_object(&self, object: &DirectoryObject) -> Result<CreateOutcome>;

    async fn set_attributes(&self, dn: &str, delta: &BTreeMap<String, String>) -> Result<()>;

    async fn create_relationship(&self, relationship: &Relationship) -> Result<CreateOutcome>;
}

/// Exponential backoff policy wrapped around adapter calls. Only transient
/// errors are retried; permanent failures return on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let millis = (self.initial_delay.as_millis() as f64) * 2f64.powi(attempt as i32);
        Duration::from_millis((millis as u64).min(self.max_delay.as_millis() as u64))
    }

    pub async fn execute<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{}: transient failure (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt + 1,
                        self.max_attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

const ENTRY_ALREADY_EXISTS: u32 = 68;
const ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;

/// LDAP implementation of the adapter over an async ldap3 connection.
/// The `Ldap` handle multiplexes, so each call clones it cheaply.
pub struct LdapDirectoryAdapter {
    ldap: ldap3::Ldap,
}

impl LdapDirectoryAdapter {
    /// Connect and bind using the configured credentials.
    ///
    /// TLS certificate verification is disabled to support lab domain
    /// controllers with self-signed certificates.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(config.connect_timeout())
            .set_no_tls_verify(true);

        info!("connecting to directory at {}", config.url);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &config.url)
            .await
            .map_err(ForgeError::from)?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                error!("LDAP connection error: {:?}", e);
            }
        });

        ldap.simple_bind(&config.bind_dn, &config.password)
            .await
            .map_err(ForgeError::from)?
            .success()
            .map_err(ForgeError::from)?;

        info!("bind successful as {}", config.bind_dn);
        Ok(Self { ldap })
    }

    fn object_classes(object_type: ObjectType) -> Vec<&'static str> {
        match object_type {
            ObjectType::Ou => vec!["top", "organizationalUnit"],
            ObjectType::Group => vec!["top", "group"],
            ObjectType::User | ObjectType::ServiceAccount => {
                vec!["top", "person", "organizationalPerson", "user"]
            }
            ObjectType::Computer => {
                vec!["top", "person", "organizationalPerson", "user", "computer"]
            }
            ObjectType::Gpo => vec!["top", "container", "groupPolicyContainer"],
        }
    }

    async fn read_attribute(&self, dn: &str, attribute: &str) -> Result<Vec<String>> {
        let mut ldap = self.ldap.clone();
        let (entries, _) = ldap
            .search(dn, Scope::Base, "(objectClass=*)", vec![attribute])
            .await
            .map_err(ForgeError::from)?
            .success()
            .map_err(ForgeError::from)?;
        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .flat_map(|e| e.attrs.get(attribute).cloned().unwrap_or_default())
            .collect())
    }
}

#[async_trait]
impl DirectoryAdapter for LdapDirectoryAdapter {
    async fn create_object(&self, object: &DirectoryObject) -> Result<CreateOutcome> {
        let mut attrs: Vec<(String, HashSet<String>)> = Vec::new();
        let classes: HashSet<String> = Self::object_classes(object.object_type)
            .into_iter()
            .map(str::to_string)
            .collect();
        attrs.push(("objectClass".to_string(), classes));
        for (key, value) in &object.attributes {
            attrs.push((key.clone(), HashSet::from([value.clone()])));
        }

        let mut ldap = self.ldap.clone();
        let result = ldap.add(&object.dn, attrs).await.map_err(ForgeError::from)?;
        match result.success() {
            Ok(_) => {
                debug!("created {} ({})", object.dn, object.object_type.as_str());
                Ok(CreateOutcome::Created)
            }
            Err(ldap3::LdapError::LdapResult { result }) if result.rc == ENTRY_ALREADY_EXISTS => {
                debug!("already exists: {}", object.dn);
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_attributes(&self, dn: &str, delta: &BTreeMap<String, String>) -> Result<()> {
        let mods: Vec<Mod<String>> = delta
            .iter()
            .map(|(key, value)| Mod::Replace(key.clone(), HashSet::from([value.clone()])))
            .collect();
        let mut ldap = self.ldap.clone();
        ldap.modify(dn, mods)
            .await
            .map_err(ForgeError::from)?
            .success()
            .map_err(ForgeError::from)?;
        Ok(())
    }

    async fn create_relationship(&self, relationship: &Relationship) -> Result<CreateOutcome> {
        match relationship.kind {
            RelationshipKind::Membership => {
                let mut ldap = self.ldap.clone();
                let result = ldap
                    .modify(
                        &relationship.from,
                        vec![Mod::Add(
                            "member".to_string(),
                            HashSet::from([relationship.to.clone()]),
                        )],
                    )
                    .await
                    .map_err(ForgeError::from)?;
                match result.success() {
                    Ok(_) => Ok(CreateOutcome::Created),
                    Err(ldap3::LdapError::LdapResult { result })
                        if result.rc == ATTRIBUTE_OR_VALUE_EXISTS =>
                    {
                        Ok(CreateOutcome::AlreadyExists)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            RelationshipKind::GpoLink => {
                // gPLink holds an ordered list of [LDAP://<gpo-dn>;<flags>]
                // entries on the OU; append only when absent so the call is
                // safely repeatable.
                let current = self
                    .read_attribute(&relationship.from, "gPLink")
                    .await?
                    .into_iter()
                    .next()
                    .unwrap_or_default();
                if current
                    .to_lowercase()
                    .contains(&relationship.to.to_lowercase())
                {
                    return Ok(CreateOutcome::AlreadyExists);
                }
                let entry = format!("[LDAP://{};0]", relationship.to);
                let updated = format!("{}{}", current, entry);
                let mut ldap = self.ldap.clone();
                ldap.modify(
                    &relationship.from,
                    vec![Mod::Replace(
                        "gPLink".to_string(),
                        HashSet::from([updated]),
                    )],
                )
                .await
                .map_err(ForgeError::from)?
                .success()
                .map_err(ForgeError::from)?;
                Ok(CreateOutcome::Created)
            }
            RelationshipKind::Delegation => {
                // The trustee's rights become an SDDL ACE fragment on the
                // target's security descriptor.
                let rights = relationship
                    .attributes
                    .get("rights")
                    .map(String::as_str)
                    .unwrap_or("GenericWrite");
                let ace = sddl_ace(rights, &relationship.to);
                let mut ldap = self.ldap.clone();
                let result = ldap
                    .modify(
                        &relationship.from,
                        vec![Mod::Add(
                            "nTSecurityDescriptor".to_string(),
                            HashSet::from([ace]),
                        )],
                    )
                    .await
                    .map_err(ForgeError::from)?;
                match result.success() {
                    Ok(_) => Ok(CreateOutcome::Created),
                    Err(ldap3::LdapError::LdapResult { result })
                        if result.rc == ATTRIBUTE_OR_VALUE_EXISTS =>
                    {
                        Ok(CreateOutcome::AlreadyExists)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Render a delegation rights set as an SDDL ACE fragment with the trustee
/// named by DN
pub fn sddl_ace(rights: &str, trustee: &str) -> String {
    let mask = match rights {
        "GenericAll" => "GA",
        "GenericWrite" => "GW",
        "WriteDacl" => "WD",
        "WriteOwner" => "WO",
        "ResetPassword" => "CR",
        "WriteMembers" => "WP",
        _ => "GW",
    };
    format!("(A;;{};;;{})", mask, trustee)
}

/// In-memory directory used by tests and offline runs. Behaves like the
/// LDAP adapter contract: creates are idempotent, failures can be scripted
/// per DN.
pub mod mock {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::RwLock;

    #[derive(Default)]
    pub struct MockDirectory {
        objects: DashMap<String, BTreeMap<String, String>>,
        relationships: RwLock<HashSet<(RelationshipKind, String, String)>>,
        permanent_failure_substrings: RwLock<Vec<String>>,
        transient_remaining: DashMap<String, u32>,
        create_calls: AtomicU64,
    }

    impl MockDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Any DN containing `substring` fails permanently
        pub fn fail_permanently_on(&self, substring: &str) {
            if let Ok(mut subs) = self.permanent_failure_substrings.write() {
                subs.push(substring.to_string());
            }
        }

        /// The next `times` operations touching `dn` fail transiently
        pub fn fail_transiently(&self, dn: &str, times: u32) {
            self.transient_remaining.insert(dn.to_string(), times);
        }

        /// Pre-populate an object without going through `create_object`
        pub fn seed_object(&self, object: &DirectoryObject) {
            self.objects
                .insert(object.dn.clone(), object.attributes.clone());
        }

        fn check_scripted_failures(&self, dn: &str) -> Result<()> {
            if let Some(mut remaining) = self.transient_remaining.get_mut(dn) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ForgeError::Transient(format!(
                        "scripted transient failure for {}",
                        dn
                    )));
                }
            }
            let permanent = self
                .permanent_failure_substrings
                .read()
                .map(|subs| subs.iter().any(|s| dn.contains(s.as_str())))
                .unwrap_or(false);
            if permanent {
                return Err(ForgeError::Permanent(format!(
                    "scripted permanent failure for {}",
                    dn
                )));
            }
            Ok(())
        }

        pub fn object_count(&self) -> usize {
            self.objects.len()
        }

        pub fn has_object(&self, dn: &str) -> bool {
            self.objects.contains_key(dn)
        }

        pub fn attribute(&self, dn: &str, key: &str) -> Option<String> {
            self.objects.get(dn).and_then(|attrs| attrs.get(key).cloned())
        }

        pub fn relationship_count(&self) -> usize {
            self.relationships.read().map(|r| r.len()).unwrap_or(0)
        }

        pub fn has_relationship(&self, kind: RelationshipKind, from: &str, to: &str) -> bool {
            self.relationships
                .read()
                .map(|r| r.contains(&(kind, from.to_string(), to.to_string())))
                .unwrap_or(false)
        }

        pub fn create_calls(&self) -> u64 {
            self.create_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DirectoryAdapter for MockDirectory {
        async fn create_object(&self, object: &DirectoryObject) -> Result<CreateOutcome> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.check_scripted_failures(&object.dn)?;
            if self.objects.contains_key(&object.dn) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            self.objects
                .insert(object.dn.clone(), object.attributes.clone());
            Ok(CreateOutcome::Created)
        }

        async fn set_attributes(
            &self,
            dn: &str,
            delta: &BTreeMap<String, String>,
        ) -> Result<()> {
            self.check_scripted_failures(dn)?;
            let mut entry = self
                .objects
                .get_mut(dn)
                .ok_or_else(|| ForgeError::Permanent(format!("no such object: {}", dn)))?;
            for (key, value) in delta {
                entry.insert(key.clone(), value.clone());
            }
            Ok(())
        }

        async fn create_relationship(&self, relationship: &Relationship) -> Result<CreateOutcome> {
            self.check_scripted_failures(&relationship.from)?;
            if !self.objects.contains_key(&relationship.from) {
                return Err(ForgeError::Permanent(format!(
                    "no such object: {}",
                    relationship.from
                )));
            }
            if !self.objects.contains_key(&relationship.to) {
                return Err(ForgeError::Permanent(format!(
                    "no such object: {}",
                    relationship.to
                )));
            }
            let key = (
                relationship.kind,
                relationship.from.clone(),
                relationship.to.clone(),
            );
            let mut relationships = self
                .relationships
                .write()
                .map_err(|_| ForgeError::Permanent("mock lock poisoned".to_string()))?;
            if !relationships.insert(key) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            Ok(CreateOutcome::Created)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDirectory;
    use super::*;
    use crate::model::ObjectStatus;

    fn user(name: &str) -> DirectoryObject {
        let mut obj = DirectoryObject::new(
            ObjectType::User,
            name,
            "OU=People,DC=range,DC=local",
            BTreeMap::new(),
        );
        obj.status = ObjectStatus::Pending;
        obj
    }

    #[tokio::test]
    async fn test_mock_create_is_idempotent() {
        let dir = MockDirectory::new();
        let obj = user("Repeat");
        assert_eq!(dir.create_object(&obj).await.unwrap(), CreateOutcome::Created);
        assert_eq!(
            dir.create_object(&obj).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(dir.object_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let dir = MockDirectory::new();
        let obj = user("Flaky");
        dir.fail_transiently(&obj.dn, 2);

        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        });
        let outcome = policy
            .execute("create", || dir.create_object(&obj))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        assert_eq!(dir.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_cap() {
        let dir = MockDirectory::new();
        let obj = user("Hopeless");
        dir.fail_transiently(&obj.dn, 10);

        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        });
        let err = policy
            .execute("create", || dir.create_object(&obj))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(dir.create_calls(), 3);
        assert!(!dir.has_object(&obj.dn));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let dir = MockDirectory::new();
        dir.fail_permanently_on("Denied");
        let obj = user("Denied User");

        let policy = RetryPolicy::default();
        let err = policy
            .execute("create", || dir.create_object(&obj))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Permanent(_)));
        assert_eq!(dir.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_relationship_requires_endpoints() {
        let dir = MockDirectory::new();
        let a = user("A");
        dir.create_object(&a).await.unwrap();
        let rel = Relationship::new(
            RelationshipKind::Membership,
            a.dn.clone(),
            "CN=Ghost,OU=People,DC=range,DC=local",
        );
        assert!(dir.create_relationship(&rel).await.is_err());
    }

    #[test]
    fn test_sddl_ace_rendering() {
        let ace = sddl_ace("GenericAll", "CN=Eve,OU=People,DC=range,DC=local");
        assert!(ace.starts_with("(A;;GA;;;"));
        assert!(ace.contains("CN=Eve"));
    }
}
