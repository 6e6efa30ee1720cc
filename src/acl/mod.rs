//! Subject resolution and permission evaluation.
//!
//! Every request resolves its caller to a [`Subject`] (user + groups +
//! effective realm permissions), then evaluates the per-object or per-file
//! permission word. `system.user.admin` and members of
//! `system.group.administrator` bypass all checks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::storage::{
    FileAcl, StoreError, ADMIN_GROUP, ADMIN_USER, PERM_READ, PERM_WRITE, SHIFT_EVERYONE,
    SHIFT_GROUP, SHIFT_USER,
};

/// A single operation against either realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    List,
    Read,
    Write,
    Create,
    Delete,
}

impl Op {
    /// Bit used when the permission word of an existing object or file is
    /// evaluated. Delete maps to write at the per-object level.
    pub fn required_bit(self) -> u16 {
        match self {
            Op::List | Op::Read => PERM_READ,
            Op::Write | Op::Create | Op::Delete => PERM_WRITE,
        }
    }
}

/// Boolean permission set for one realm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSet {
    pub list: bool,
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
}

impl OpSet {
    pub fn all() -> Self {
        Self {
            list: true,
            read: true,
            write: true,
            create: true,
            delete: true,
        }
    }

    pub fn allows(&self, op: Op) -> bool {
        match op {
            Op::List => self.list,
            Op::Read => self.read,
            Op::Write => self.write,
            Op::Create => self.create,
            Op::Delete => self.delete,
        }
    }

    fn merge(&mut self, other: OpSet) {
        self.list |= other.list;
        self.read |= other.read;
        self.write |= other.write;
        self.create |= other.create;
        self.delete |= other.delete;
    }

    fn from_value(v: &Value) -> Self {
        let flag = |k: &str| v.get(k).and_then(Value::as_bool).unwrap_or(false);
        Self {
            list: flag("list"),
            read: flag("read"),
            write: flag("write"),
            create: flag("create"),
            delete: flag("delete"),
        }
    }
}

/// Realm permissions of one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubjectAcl {
    pub file: OpSet,
    pub object: OpSet,
    pub users: OpSet,
}

impl SubjectAcl {
    pub fn all() -> Self {
        Self {
            file: OpSet::all(),
            object: OpSet::all(),
            users: OpSet::all(),
        }
    }
}

/// Resolved caller identity: user id, group membership and effective
/// permissions (union over all groups).
#[derive(Debug, Clone)]
pub struct Subject {
    pub user: String,
    pub groups: Vec<String>,
    pub acl: SubjectAcl,
}

impl Subject {
    pub fn is_admin(&self) -> bool {
        self.user == ADMIN_USER || self.groups.iter().any(|g| g == ADMIN_GROUP)
    }

    fn empty(user: &str) -> Self {
        Self {
            user: user.to_string(),
            groups: Vec::new(),
            acl: SubjectAcl::default(),
        }
    }

    fn admin() -> Self {
        Self {
            user: ADMIN_USER.to_string(),
            groups: vec![ADMIN_GROUP.to_string()],
            acl: SubjectAcl::all(),
        }
    }
}

/// Resolves users to subjects, caching the full user table until a
/// user or group object changes.
#[derive(Debug, Default)]
pub struct AclEngine {
    cache: RwLock<Option<HashMap<String, Arc<Subject>>>>,
}

impl AclEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the resolved table. Called after any mutation of a
    /// `system.user.*` or `system.group.*` object.
    pub fn invalidate(&self) {
        *self.cache.write().expect("acl cache lock") = None;
    }

    /// Resolve `user` against the current object map. Unknown or malformed
    /// users resolve to the empty-permission subject.
    pub fn resolve(&self, user: &str, objects: &BTreeMap<String, Value>) -> Arc<Subject> {
        {
            let cache = self.cache.read().expect("acl cache lock");
            if let Some(table) = cache.as_ref() {
                if let Some(subject) = table.get(user) {
                    return subject.clone();
                }
            }
        }

        let mut cache = self.cache.write().expect("acl cache lock");
        let table = cache.get_or_insert_with(|| build_table(objects));
        if let Some(subject) = table.get(user) {
            return subject.clone();
        }

        if !user.starts_with("system.user.") {
            tracing::warn!(user, "unknown or malformed user, default permissions apply");
        } else {
            tracing::warn!(user, "user object not found, default permissions apply");
        }
        let subject = Arc::new(Subject::empty(user));
        table.insert(user.to_string(), subject.clone());
        subject
    }
}

fn build_table(objects: &BTreeMap<String, Value>) -> HashMap<String, Arc<Subject>> {
    let mut subjects: HashMap<String, Subject> = HashMap::new();

    for (id, _) in range_scan(objects, "system.user.") {
        let subject = if id.as_str() == ADMIN_USER {
            Subject::admin()
        } else {
            Subject::empty(id)
        };
        subjects.insert(id.clone(), subject);
    }

    for (group_id, group) in range_scan(objects, "system.group.") {
        let acl = group
            .pointer("/common/acl")
            .map(|acl| SubjectAcl {
                file: acl.get("file").map(OpSet::from_value).unwrap_or_default(),
                object: acl.get("object").map(OpSet::from_value).unwrap_or_default(),
                users: acl.get("users").map(OpSet::from_value).unwrap_or_default(),
            })
            .unwrap_or_default();

        let members = group
            .pointer("/common/members")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for member in members {
            let Some(member) = member.as_str() else {
                continue;
            };
            let subject = subjects
                .entry(member.to_string())
                .or_insert_with(|| Subject::empty(member));
            subject.groups.push(group_id.clone());
            if group_id.as_str() == ADMIN_GROUP {
                subject.acl = SubjectAcl::all();
            } else {
                subject.acl.file.merge(acl.file);
                subject.acl.object.merge(acl.object);
                subject.acl.users.merge(acl.users);
            }
        }
    }

    // Admin keeps everything even without a group membership entry.
    subjects
        .entry(ADMIN_USER.to_string())
        .or_insert_with(Subject::admin);

    subjects
        .into_iter()
        .map(|(id, s)| (id, Arc::new(s)))
        .collect()
}

fn range_scan<'a>(
    objects: &'a BTreeMap<String, Value>,
    prefix: &str,
) -> Vec<(&'a String, &'a Value)> {
    objects
        .range(prefix.to_string()..)
        .take_while(|(id, _)| id.starts_with(prefix))
        .collect()
}

/// Evaluate the shifted permission word of an existing object or file.
fn word_allows(perms: u16, owner: &str, owner_group: &str, subject: &Subject, bit: u16) -> bool {
    let shift = if subject.user == owner {
        SHIFT_USER
    } else if subject.groups.iter().any(|g| g == owner_group) {
        SHIFT_GROUP
    } else {
        SHIFT_EVERYONE
    };
    (perms >> shift) & bit != 0
}

/// Is `op` on object `id` permitted? `existing` is the stored value, if any.
pub fn object_permitted(id: &str, existing: Option<&Value>, subject: &Subject, op: Op) -> bool {
    if subject.is_admin() {
        return true;
    }

    // User and group objects are additionally gated by the users realm.
    if (id.starts_with("system.user.") || id.starts_with("system.group."))
        && !subject.acl.users.allows(op)
    {
        return false;
    }

    if !subject.acl.object.allows(op) {
        return false;
    }

    match existing {
        Some(obj) => match obj.get("acl") {
            Some(acl) => {
                let owner = acl.get("owner").and_then(Value::as_str).unwrap_or("");
                let group = acl.get("ownerGroup").and_then(Value::as_str).unwrap_or("");
                let perms = acl
                    .get("object")
                    .and_then(Value::as_u64)
                    .unwrap_or(u64::from(crate::storage::DEFAULT_PERMS))
                    as u16;
                word_allows(perms, owner, group, subject, op.required_bit())
            }
            None => true,
        },
        // Listing a non-existent id is only gated by the realm bits above.
        None => true,
    }
}

pub fn check_object(
    id: &str,
    existing: Option<&Value>,
    subject: &Subject,
    op: Op,
) -> Result<(), StoreError> {
    if object_permitted(id, existing, subject, op) {
        Ok(())
    } else {
        Err(StoreError::Permission)
    }
}

/// Is access with `flag` (read or write bit) to file `name` under `id`
/// permitted? `entry` is the sidecar descriptor ACL, if the file exists.
pub fn file_permitted(entry: Option<&FileAcl>, subject: &Subject, flag: u16) -> bool {
    if subject.is_admin() {
        return true;
    }

    let realm_ok = match flag {
        PERM_READ => subject.acl.file.read,
        PERM_WRITE => subject.acl.file.write,
        _ => false,
    };
    if !realm_ok {
        return false;
    }

    match entry {
        // The file does not exist yet; creation is governed separately.
        None => true,
        Some(acl) => word_allows(acl.permissions, &acl.owner, &acl.owner_group, subject, flag),
    }
}

pub fn check_file(entry: Option<&FileAcl>, subject: &Subject, flag: u16) -> Result<(), StoreError> {
    if file_permitted(entry, subject, flag) {
        Ok(())
    } else {
        Err(StoreError::Permission)
    }
}
