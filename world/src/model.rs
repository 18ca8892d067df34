//! The universal world entity and its permission model.

use serde_derive::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

/// Stable identifier of a world object. Zero means "not yet persisted".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId(pub i64);

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who a permission extends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Perm {
    World,
    Owner,
}

impl Perm {
    pub fn as_str(self) -> &'static str {
        match self {
            Perm::World => "world",
            Perm::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Perm> {
        match s {
            "world" => Some(Perm::World),
            "owner" => Some(Perm::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    pub read: Perm,
    pub write: Perm,
    pub carry: Perm,
    pub execute: Perm,
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            read: Perm::World,
            write: Perm::Owner,
            carry: Perm::World,
            execute: Perm::World,
        }
    }
}

impl Permissions {
    /// Defaults for objects that must not be carried off by strangers.
    pub fn private() -> Self {
        Permissions {
            carry: Perm::Owner,
            ..Default::default()
        }
    }
}

/// Every entity in the world: rooms, avatars, doors, portable items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub owner_uid: u32,
    pub avatar: bool,
    pub bedroom: bool,
    pub data: HashMap<String, String>,
    pub permissions: Permissions,
    pub script: String,
    /// Hash over script ∪ data ∪ permissions; the supervisor uses it to
    /// detect stale script contexts. Recomputed on every save.
    pub fingerprint: u64,
}

impl Object {
    /// A fresh, unsaved object with at least `name` and `description` set.
    pub fn new(name: &str, description: &str) -> Self {
        let mut data = HashMap::new();
        data.insert("name".to_owned(), name.to_owned());
        data.insert("description".to_owned(), description.to_owned());
        Object {
            data,
            permissions: Permissions::default(),
            ..Default::default()
        }
    }

    pub fn with_script(mut self, script: &str) -> Self {
        self.script = script.to_owned();
        self
    }

    pub fn name(&self) -> &str {
        self.data.get("name").map(String::as_str).unwrap_or("something")
    }

    pub fn description(&self) -> &str {
        self.data
            .get("description")
            .map(String::as_str)
            .unwrap_or("you see nothing special.")
    }

    /// Stable within one process run, which is all the runtime-only script
    /// contexts need.
    pub fn compute_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.script.hash(&mut hasher);
        let mut pairs: Vec<_> = self.data.iter().collect();
        pairs.sort();
        for (k, v) in pairs {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        self.permissions.hash(&mut hasher);
        hasher.finish()
    }

    pub fn refresh_fingerprint(&mut self) {
        self.fingerprint = self.compute_fingerprint();
    }
}
