//! Run object registry
//!
//! The one shared mutable structure of a run besides the ledger: DN-keyed
//! object state plus the accepted relationships. DashMap gives the
//! single-writer-per-key discipline the stages rely on; readers of one
//! key never block writers of another.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::RwLock;

use crate::model::{DirectoryObject, ObjectStatus, ObjectType, Relationship, RelationshipKind};

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: DashMap<String, DirectoryObject>,
    relationships: RwLock<Vec<Relationship>>,
    /// group DN -> directly nested member-group DNs; backs the cycle check
    group_children: DashMap<String, HashSet<String>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a planned object (status Pending)
    pub fn insert(&self, object: DirectoryObject) {
        self.objects.insert(object.dn.clone(), object);
    }

    pub fn set_status(&self, dn: &str, status: ObjectStatus) {
        if let Some(mut entry) = self.objects.get_mut(dn) {
            entry.status = status;
        }
    }

    pub fn status(&self, dn: &str) -> Option<ObjectStatus> {
        self.objects.get(dn).map(|o| o.status)
    }

    pub fn is_created(&self, dn: &str) -> bool {
        matches!(self.status(dn), Some(ObjectStatus::Created))
    }

    pub fn get(&self, dn: &str) -> Option<DirectoryObject> {
        self.objects.get(dn).map(|o| o.clone())
    }

    /// Merge an applied attribute delta into the registered object so later
    /// rule predicates observe the directory's current state
    pub fn apply_delta(&self, dn: &str, delta: &BTreeMap<String, String>) {
        if let Some(mut entry) = self.objects.get_mut(dn) {
            for (key, value) in delta {
                entry.attributes.insert(key.clone(), value.clone());
            }
        }
    }

    /// All Created objects of one type, in stable DN order
    pub fn created_of_type(&self, object_type: ObjectType) -> Vec<DirectoryObject> {
        let mut objects: Vec<DirectoryObject> = self
            .objects
            .iter()
            .filter(|entry| {
                entry.object_type == object_type && entry.status == ObjectStatus::Created
            })
            .map(|entry| entry.clone())
            .collect();
        objects.sort_by(|a, b| a.dn.cmp(&b.dn));
        objects
    }

    /// Snapshot of every registered object, in stable DN order
    pub fn snapshot(&self) -> Vec<DirectoryObject> {
        let mut objects: Vec<DirectoryObject> =
            self.objects.iter().map(|entry| entry.clone()).collect();
        objects.sort_by(|a, b| a.dn.cmp(&b.dn));
        objects
    }

    pub fn status_counts(&self) -> (usize, usize, usize) {
        let mut pending = 0;
        let mut created = 0;
        let mut failed = 0;
        for entry in self.objects.iter() {
            match entry.status {
                ObjectStatus::Pending => pending += 1,
                ObjectStatus::Created => created += 1,
                ObjectStatus::Failed => failed += 1,
            }
        }
        (pending, created, failed)
    }

    /// Record an accepted relationship. Membership edges between two groups
    /// also feed the nesting graph used for cycle detection.
    pub fn add_relationship(&self, relationship: Relationship) {
        if relationship.kind == RelationshipKind::Membership {
            let member_is_group = self
                .objects
                .get(&relationship.to)
                .map(|o| o.object_type == ObjectType::Group)
                .unwrap_or(false);
            if member_is_group {
                self.group_children
                    .entry(relationship.from.clone())
                    .or_default()
                    .insert(relationship.to.clone());
            }
        }
        if let Ok(mut relationships) = self.relationships.write() {
            relationships.push(relationship);
        }
    }

    pub fn relationships(&self) -> Vec<Relationship> {
        self.relationships
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether nesting `member` under `group` would close a cycle:
    /// true when `group` is already reachable from `member` through the
    /// existing nesting edges (or when the two are the same group).
    pub fn would_close_cycle(&self, group: &str, member: &str) -> bool {
        if group == member {
            return true;
        }
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(member.to_string());
        while let Some(current) = queue.pop_front() {
            if current == group {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.group_children.get(&current) {
                for child in children.iter() {
                    queue.push_back(child.clone());
                }
            }
        }
        false
    }
}
