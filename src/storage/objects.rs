//! The in-memory object database.
//!
//! Objects are JSON values keyed by dotted hierarchical ids in a `BTreeMap`,
//! which gives the lexicographic range scans the list operations and the ACL
//! engine rely on. Mutations apply under the write lock, publish to
//! subscribers before the lock is released, and arm the debounced snapshot.

use std::collections::BTreeMap;
use std::ops::Bound::{Included, Unbounded};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use crate::acl::{self, AclEngine, Op, Subject};
use crate::glob::glob_to_regex;
use crate::pubsub::{Dispatcher, Realm};
use crate::storage::snapshot::{self, SnapshotConfig, SnapshotWriter};
use crate::storage::{ObjectAcl, StoreError};

/// Characters that may not appear in an object id.
const INVALID_ID_CHARS: &str = "][*,;'\"`<>\\?";

pub const SYSTEM_CONFIG_ID: &str = "system.config";

/// Decides whether a `nonEdit` protected object may be replaced. Receives
/// the stored object and the candidate replacement.
pub type NonEditGuard = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Token based default: the candidate must carry the stored token under
/// `common.nonEdit.passHash`.
pub fn default_non_edit_guard(old: &Value, candidate: &Value) -> bool {
    let Some(lock) = old.pointer("/common/nonEdit") else {
        return true;
    };
    match (
        lock.get("passHash"),
        candidate.pointer("/common/nonEdit/password"),
    ) {
        (Some(hash), Some(token)) => hash == token,
        _ => false,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectListParams {
    pub startkey: Option<String>,
    pub endkey: Option<String>,
    #[serde(default)]
    pub include_docs: bool,
    #[serde(default)]
    pub sorted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectListRow {
    pub id: String,
    pub value: Value,
    pub doc: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectList {
    pub rows: Vec<ObjectListRow>,
}

/// Per-call options forwarded by the request façade.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub owner: Option<String>,
    pub owner_group: Option<String>,
    pub preserve_settings: Vec<String>,
}

pub struct ObjectDb {
    map: Arc<RwLock<BTreeMap<String, Value>>>,
    default_acl: std::sync::RwLock<ObjectAcl>,
    dispatcher: Arc<Dispatcher>,
    snapshot: SnapshotWriter,
    acl: Arc<AclEngine>,
    non_edit_guard: NonEditGuard,
}

impl ObjectDb {
    /// Load the snapshot from `data_dir` and start the write-behind task.
    pub fn open(
        data_dir: &Path,
        config: SnapshotConfig,
        dispatcher: Arc<Dispatcher>,
        acl: Arc<AclEngine>,
        configured_default_acl: Option<ObjectAcl>,
        non_edit_guard: Option<NonEditGuard>,
    ) -> Self {
        let loaded = snapshot::load(data_dir);

        // The persisted template wins over the configured one.
        let template = loaded
            .get(SYSTEM_CONFIG_ID)
            .and_then(|cfg| cfg.pointer("/common/defaultNewAcl"))
            .and_then(|acl| serde_json::from_value::<ObjectAcl>(acl.clone()).ok())
            .or(configured_default_acl)
            .unwrap_or_default();

        tracing::info!(objects = loaded.len(), "object database loaded");

        let map = Arc::new(RwLock::new(loaded));
        let snapshot = SnapshotWriter::new(data_dir, map.clone(), config);

        Self {
            map,
            default_acl: std::sync::RwLock::new(template),
            dispatcher,
            snapshot,
            acl,
            non_edit_guard: non_edit_guard.unwrap_or_else(|| Arc::new(default_non_edit_guard)),
        }
    }

    /// Resolve a caller against the current object map.
    pub async fn resolve_subject(&self, user: &str) -> Arc<Subject> {
        let map = self.map.read().await;
        self.acl.resolve(user, &map)
    }

    pub fn default_acl(&self) -> ObjectAcl {
        self.default_acl.read().expect("default acl lock").clone()
    }

    /// Write the snapshot immediately and stop the write-behind task.
    pub async fn destroy(&self) {
        self.snapshot.flush().await;
        self.snapshot.stop().await;
    }

    pub async fn get_object(&self, id: &str, subject: &Subject) -> Result<Option<Value>, StoreError> {
        validate_id(id)?;
        let map = self.map.read().await;
        let existing = map.get(id);
        acl::check_object(id, existing, subject, Op::Read)?;
        Ok(existing.cloned())
    }

    pub async fn get_keys(&self, pattern: &str, subject: &Subject) -> Result<Vec<String>, StoreError> {
        let regex = glob_to_regex(pattern);
        let map = self.map.read().await;
        Ok(map
            .iter()
            .filter(|(id, _)| regex.is_match(id))
            .filter(|(id, obj)| acl::object_permitted(id, Some(obj), subject, Op::List))
            .map(|(id, _)| id.clone())
            .collect())
    }

    pub async fn get_objects(
        &self,
        keys: Option<&[String]>,
        subject: &Subject,
    ) -> Result<Vec<Value>, StoreError> {
        let keys = keys.ok_or(StoreError::NoKeys)?;
        let map = self.map.read().await;
        Ok(keys
            .iter()
            .map(|id| match map.get(id) {
                Some(obj) if acl::object_permitted(id, Some(obj), subject, Op::Read) => obj.clone(),
                Some(_) => json!({"error": "permissionError"}),
                None => Value::Null,
            })
            .collect())
    }

    pub async fn get_objects_by_pattern(
        &self,
        pattern: &str,
        subject: &Subject,
    ) -> Result<Vec<Value>, StoreError> {
        let regex = glob_to_regex(pattern);
        let map = self.map.read().await;
        Ok(map
            .iter()
            .filter(|(id, _)| regex.is_match(id))
            .filter(|(id, obj)| acl::object_permitted(id, Some(obj), subject, Op::Read))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    pub async fn get_object_list(
        &self,
        params: &ObjectListParams,
        subject: &Subject,
    ) -> Result<ObjectList, StoreError> {
        let map = self.map.read().await;
        let start = params
            .startkey
            .as_ref()
            .map(|k| Included(k.clone()))
            .unwrap_or(Unbounded);
        let end = params
            .endkey
            .as_ref()
            .map(|k| Included(k.clone()))
            .unwrap_or(Unbounded);

        let rows = map
            .range((start, end))
            .filter(|(id, _)| params.include_docs || !id.starts_with('_'))
            .filter(|(id, obj)| acl::object_permitted(id, Some(obj), subject, Op::List))
            .map(|(id, obj)| ObjectListRow {
                id: id.clone(),
                value: obj.clone(),
                doc: obj.clone(),
            })
            .collect();
        // BTreeMap iteration is lexicographic, so `sorted` holds either way.
        Ok(ObjectList { rows })
    }

    pub async fn set_object(
        &self,
        id: &str,
        obj: Value,
        options: &WriteOptions,
        subject: &Subject,
    ) -> Result<(), StoreError> {
        validate_id(id)?;
        if obj.is_null() {
            return Err(StoreError::NullObject);
        }

        let mut map = self.map.write().await;
        acl::check_object(id, map.get(id), subject, Op::Write)?;

        // A changed defaultNewAcl template is adopted and back-propagated to
        // every object that has no explicit ACL, then the set proceeds.
        if id == SYSTEM_CONFIG_ID {
            if let Some(new_template) = obj
                .pointer("/common/defaultNewAcl")
                .and_then(|acl| serde_json::from_value::<ObjectAcl>(acl.clone()).ok())
            {
                let changed = {
                    let current = self.default_acl.read().expect("default acl lock");
                    *current != new_template
                };
                if changed {
                    *self.default_acl.write().expect("default acl lock") = new_template;
                    self.propagate_default_acl(&mut map);
                }
            }
        }

        let old = map.get(id).cloned();
        let obj = self.prepare_object(id, obj, old.as_ref(), options, &map);
        self.apply(&mut map, id, obj);
        Ok(())
    }

    pub async fn extend_object(
        &self,
        id: &str,
        partial: Value,
        options: &WriteOptions,
        subject: &Subject,
    ) -> Result<Value, StoreError> {
        validate_id(id)?;
        if partial.is_null() {
            return Err(StoreError::NullObject);
        }

        let mut map = self.map.write().await;
        acl::check_object(id, map.get(id), subject, Op::Write)?;

        let old = map.get(id).cloned();
        let base = old.clone().unwrap_or_else(|| json!({}));
        let mut merged = deep_merge(base, partial);

        if let Some(old) = &old {
            if old.pointer("/common/nonEdit").is_some() {
                if !(self.non_edit_guard)(old, &merged) {
                    return Err(StoreError::NonEditable);
                }
                // The stored protection block survives the merge untouched.
                if let Some(common) = merged.get_mut("common").and_then(Value::as_object_mut) {
                    common.insert(
                        "nonEdit".to_string(),
                        old.pointer("/common/nonEdit").cloned().unwrap_or(Value::Null),
                    );
                }
            }
        }

        let empty = WriteOptions {
            preserve_settings: Vec::new(),
            ..options.clone()
        };
        merged = self.prepare_object(id, merged, old.as_ref(), &empty, &map);
        let result = merged.clone();
        self.apply(&mut map, id, merged);
        Ok(result)
    }

    pub async fn del_object(&self, id: &str, subject: &Subject) -> Result<(), StoreError> {
        validate_id(id)?;
        let mut map = self.map.write().await;
        let existing = map.get(id).ok_or(StoreError::NotExists)?;
        acl::check_object(id, Some(existing), subject, Op::Delete)?;

        if existing
            .pointer("/common/dontDelete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(StoreError::DontDelete);
        }

        map.remove(id);
        if is_subject_object(id) {
            self.acl.invalidate();
        }
        self.dispatcher.publish_all(Realm::Objects, id, None);
        self.snapshot.schedule();
        Ok(())
    }

    pub async fn chown_object(
        &self,
        pattern: &str,
        options: &WriteOptions,
        subject: &Subject,
    ) -> Result<Vec<Value>, StoreError> {
        let owner = options.owner.clone().ok_or(StoreError::InvalidParameter)?;
        let mut map = self.map.write().await;
        let group = match &options.owner_group {
            Some(g) => g.clone(),
            None => self.first_group_of(&owner, &map),
        };

        let regex = glob_to_regex(pattern);
        let keys: Vec<String> = map
            .iter()
            .filter(|(id, obj)| {
                regex.is_match(id) && acl::object_permitted(id, Some(obj), subject, Op::List)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let template = self.default_acl();
        let mut modified = Vec::new();
        for id in keys {
            let Some(obj) = map.get(&id) else { continue };
            if !acl::object_permitted(&id, Some(obj), subject, Op::Write) {
                continue;
            }
            let mut obj = obj.clone();
            {
                let acl = materialize_acl(&mut obj, &template);
                acl.insert("owner".to_string(), json!(owner));
                acl.insert("ownerGroup".to_string(), json!(group));
            }
            map.insert(id.clone(), obj.clone());
            self.dispatcher.publish_all(Realm::Objects, &id, Some(&obj));
            modified.push(obj);
        }

        if !modified.is_empty() {
            self.snapshot.schedule();
        }
        Ok(modified)
    }

    pub async fn chmod_object(
        &self,
        pattern: &str,
        object_perms: Option<u16>,
        state_perms: Option<u16>,
        subject: &Subject,
    ) -> Result<Vec<Value>, StoreError> {
        if object_perms.is_none() && state_perms.is_none() {
            return Err(StoreError::InvalidParameter);
        }

        let mut map = self.map.write().await;
        let regex = glob_to_regex(pattern);
        let keys: Vec<String> = map
            .iter()
            .filter(|(id, obj)| {
                regex.is_match(id) && acl::object_permitted(id, Some(obj), subject, Op::List)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let template = self.default_acl();
        let mut modified = Vec::new();
        for id in keys {
            let Some(obj) = map.get(&id) else { continue };
            if !acl::object_permitted(&id, Some(obj), subject, Op::Write) {
                continue;
            }
            let mut obj = obj.clone();
            {
                let acl = materialize_acl(&mut obj, &template);
                if let Some(perms) = object_perms {
                    acl.insert("object".to_string(), json!(perms));
                }
                if let Some(perms) = state_perms {
                    acl.insert("state".to_string(), json!(perms));
                }
            }
            map.insert(id.clone(), obj.clone());
            self.dispatcher.publish_all(Realm::Objects, &id, Some(&obj));
            modified.push(obj);
        }

        if !modified.is_empty() {
            self.snapshot.schedule();
        }
        Ok(modified)
    }

    /// Exact id match wins; otherwise the first object whose `common.name`
    /// equals `id_or_name` (and `common.type` when given).
    pub async fn find_object(
        &self,
        id_or_name: &str,
        type_filter: Option<&str>,
        subject: &Subject,
    ) -> Result<Option<String>, StoreError> {
        let map = self.map.read().await;
        if let Some(obj) = map.get(id_or_name) {
            acl::check_object(id_or_name, Some(obj), subject, Op::Read)?;
            return Ok(Some(id_or_name.to_string()));
        }

        for (id, obj) in map.iter() {
            let name_matches = obj
                .pointer("/common/name")
                .and_then(Value::as_str)
                .map(|n| n == id_or_name)
                .unwrap_or(false);
            if !name_matches {
                continue;
            }
            if let Some(wanted) = type_filter {
                let type_matches = obj
                    .pointer("/common/type")
                    .and_then(Value::as_str)
                    .map(|t| t == wanted)
                    .unwrap_or(false);
                if !type_matches {
                    continue;
                }
            }
            if acl::object_permitted(id, Some(obj), subject, Op::Read) {
                return Ok(Some(id.clone()));
            }
        }
        Ok(None)
    }

    /// Delete the canonical snapshot file. The in-memory map stays intact,
    /// so a graceful shutdown re-materializes it; a crash comes up empty.
    pub async fn destroy_db(&self, subject: &Subject) -> Result<(), StoreError> {
        if !subject.is_admin() && !subject.acl.object.write {
            return Err(StoreError::Permission);
        }
        self.snapshot.delete_snapshot().await;
        Ok(())
    }

    /// Range scan over the raw map for the view executor.
    pub(crate) async fn scan_range(
        &self,
        startkey: Option<&str>,
        endkey: Option<&str>,
    ) -> Vec<(String, Value)> {
        let map = self.map.read().await;
        let start = startkey.map(|k| Included(k.to_string())).unwrap_or(Unbounded);
        let end = endkey.map(|k| Included(k.to_string())).unwrap_or(Unbounded);
        map.range((start, end))
            .map(|(id, obj)| (id.clone(), obj.clone()))
            .collect()
    }

    /// Stamp `default_acl` onto every object without one. Runs while the
    /// write lock is already held by the caller.
    fn propagate_default_acl(&self, map: &mut BTreeMap<String, Value>) {
        let template = self.default_acl();
        let ids: Vec<String> = map
            .iter()
            .filter(|(_, obj)| obj.get("acl").is_none())
            .map(|(id, _)| id.clone())
            .collect();
        tracing::info!(objects = ids.len(), "re-stamping default ACL");
        for id in ids {
            if let Some(obj) = map.get_mut(&id) {
                let stamped = stamp_acl(&template, is_state_object(obj));
                if let Some(slot) = obj.as_object_mut() {
                    slot.insert("acl".to_string(), stamped);
                }
            }
        }
        self.snapshot.schedule();
    }

    /// Shared tail of set/extend: preservation, ACL inheritance, `_id`.
    fn prepare_object(
        &self,
        id: &str,
        mut obj: Value,
        old: Option<&Value>,
        options: &WriteOptions,
        map: &BTreeMap<String, Value>,
    ) -> Value {
        if !obj.is_object() {
            obj = json!({ "value": obj });
        }

        apply_preserve_settings(&mut obj, old, &options.preserve_settings);

        if obj.get("acl").is_none() {
            let inherited = old.and_then(|o| o.get("acl")).cloned();
            let acl = inherited
                .unwrap_or_else(|| stamp_acl(&self.default_acl(), is_state_object(&obj)));
            obj.as_object_mut()
                .expect("object payload")
                .insert("acl".to_string(), acl);
        }

        // An object never carries file permissions, and only state objects
        // carry the state word.
        let is_state = is_state_object(&obj);
        if let Some(acl) = obj.get_mut("acl").and_then(Value::as_object_mut) {
            acl.remove("file");
            if !is_state {
                acl.remove("state");
            }
            if let Some(owner) = &options.owner {
                acl.insert("owner".to_string(), json!(owner));
                let group = options
                    .owner_group
                    .clone()
                    .unwrap_or_else(|| self.first_group_of(owner, map));
                acl.insert("ownerGroup".to_string(), json!(group));
            }
        }

        obj.as_object_mut()
            .expect("object payload")
            .insert("_id".to_string(), json!(id));
        obj
    }

    /// Insert, publish and arm persistence. Runs under the write lock so a
    /// publish can never observe a half-applied mutation.
    fn apply(&self, map: &mut BTreeMap<String, Value>, id: &str, obj: Value) {
        map.insert(id.to_string(), obj.clone());
        if is_subject_object(id) {
            self.acl.invalidate();
        }
        self.dispatcher.publish_all(Realm::Objects, id, Some(&obj));
        self.snapshot.schedule();
    }

    fn first_group_of(&self, owner: &str, map: &BTreeMap<String, Value>) -> String {
        let subject = self.acl.resolve(owner, map);
        subject
            .groups
            .first()
            .cloned()
            .unwrap_or_else(|| self.default_acl().owner_group)
    }
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.chars().any(|c| INVALID_ID_CHARS.contains(c)) {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn is_subject_object(id: &str) -> bool {
    id.starts_with("system.user.") || id.starts_with("system.group.")
}

fn is_state_object(obj: &Value) -> bool {
    obj.get("type").and_then(Value::as_str) == Some("state")
}

/// Render the template as an object's `acl` field: no file word, state word
/// only for state objects.
fn stamp_acl(template: &ObjectAcl, is_state: bool) -> Value {
    let mut acl = template.clone();
    acl.file = None;
    if !is_state {
        acl.state = None;
    } else if acl.state.is_none() {
        acl.state = Some(acl.object);
    }
    serde_json::to_value(acl).expect("acl serializes")
}

/// Get-or-insert the object's `acl` map, seeding it from the template.
fn materialize_acl<'a>(obj: &'a mut Value, template: &ObjectAcl) -> &'a mut Map<String, Value> {
    let is_state = is_state_object(obj);
    let map = obj.as_object_mut().expect("object payload");
    if !map.contains_key("acl") {
        map.insert("acl".to_string(), stamp_acl(template, is_state));
    }
    map.get_mut("acl")
        .and_then(Value::as_object_mut)
        .expect("acl is an object")
}

/// Recursive merge: objects merge key-wise, arrays and scalars replace.
/// Explicit `null` in the patch is stored as-is.
pub fn deep_merge(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.remove(&key) {
                    Some(existing) => {
                        base.insert(key, deep_merge(existing, value));
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Object(base)
        }
        (_, patch) => patch,
    }
}

/// `preserveSettings` semantics for `setObject`: a listed key under
/// `common` set to `null` is deleted, left absent is copied from the old
/// object, anything else passes through.
fn apply_preserve_settings(obj: &mut Value, old: Option<&Value>, preserve: &[String]) {
    if preserve.is_empty() {
        return;
    }
    for key in preserve {
        let current = obj.pointer(&format!("/common/{key}")).cloned();
        match current {
            Some(Value::Null) => {
                if let Some(common) = obj.get_mut("common").and_then(Value::as_object_mut) {
                    common.remove(key);
                }
            }
            Some(_) => {}
            None => {
                let inherited = old.and_then(|o| o.pointer(&format!("/common/{key}"))).cloned();
                if let Some(value) = inherited {
                    let common = obj
                        .as_object_mut()
                        .expect("object payload")
                        .entry("common")
                        .or_insert_with(|| json!({}));
                    if let Some(common) = common.as_object_mut() {
                        common.insert(key.clone(), value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::SubjectAcl;
    use crate::pubsub::ChangeEvent;
    use tokio::sync::mpsc;

    fn admin_subject() -> Subject {
        Subject {
            user: crate::storage::ADMIN_USER.to_string(),
            groups: vec![crate::storage::ADMIN_GROUP.to_string()],
            acl: SubjectAcl::all(),
        }
    }

    struct Fixture {
        db: ObjectDb,
        _dir: tempfile::TempDir,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (sink, events) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(Some(sink)));
        dispatcher.subscribe_local(Realm::Objects, "*");
        let db = ObjectDb::open(
            dir.path(),
            SnapshotConfig::default(),
            dispatcher,
            Arc::new(AclEngine::new()),
            None,
            None,
        );
        Fixture { db, _dir: dir, events }
    }

    #[tokio::test]
    async fn set_and_get_roundtrip_with_forced_id() {
        let mut fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object(
                "a.b",
                json!({"common": {"name": "X"}, "native": {}}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();

        let obj = fx.db.get_object("a.b", &admin).await.unwrap().unwrap();
        assert_eq!(obj["common"]["name"], "X");
        assert_eq!(obj["_id"], "a.b");
        // ACL stamped from the default template, without file/state words.
        assert_eq!(obj["acl"]["owner"], crate::storage::ADMIN_USER);
        assert!(obj["acl"].get("file").is_none());
        assert!(obj["acl"].get("state").is_none());

        let event = fx.events.try_recv().unwrap();
        assert_eq!(event.id, "a.b");
        assert!(event.obj.is_some());
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let fx = fixture();
        let admin = admin_subject();
        for bad in ["a[b", "a*b", "a?b", "a;b", "", "a<b"] {
            let err = fx
                .db
                .set_object(bad, json!({}), &WriteOptions::default(), &admin)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidId(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn null_object_is_rejected() {
        let fx = fixture();
        let err = fx
            .db
            .set_object("a.b", Value::Null, &WriteOptions::default(), &admin_subject())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NullObject));
    }

    #[tokio::test]
    async fn state_objects_carry_the_state_word() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object("s.x", json!({"type": "state"}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        let obj = fx.db.get_object("s.x", &admin).await.unwrap().unwrap();
        assert!(obj["acl"].get("state").is_some());
        assert!(obj["acl"].get("file").is_none());
    }

    #[tokio::test]
    async fn extend_merges_deeply_and_replaces_arrays() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object(
                "m.x",
                json!({"common": {"name": "X", "nested": {"a": 1, "b": 2}}, "list": [1, 2]}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();
        fx.db
            .extend_object(
                "m.x",
                json!({"common": {"nested": {"b": 3}, "k": 1}, "list": [9]}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();

        let obj = fx.db.get_object("m.x", &admin).await.unwrap().unwrap();
        assert_eq!(obj["common"]["name"], "X");
        assert_eq!(obj["common"]["nested"]["a"], 1);
        assert_eq!(obj["common"]["nested"]["b"], 3);
        assert_eq!(obj["common"]["k"], 1);
        assert_eq!(obj["list"], json!([9]));
    }

    #[tokio::test]
    async fn extend_keeps_null_as_value() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object("n.x", json!({"common": {"name": "X"}}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        fx.db
            .extend_object("n.x", json!({"common": {"name": null}}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        let obj = fx.db.get_object("n.x", &admin).await.unwrap().unwrap();
        assert_eq!(obj["common"]["name"], Value::Null);
    }

    #[tokio::test]
    async fn preserve_settings_null_deletes_absent_copies() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object(
                "p.x",
                json!({"common": {"name": "X", "custom": {"a": 1}}}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();

        // `custom` absent from the new object is copied over; `name: null`
        // deletes the field.
        let options = WriteOptions {
            preserve_settings: vec!["custom".to_string(), "name".to_string()],
            ..WriteOptions::default()
        };
        fx.db
            .set_object("p.x", json!({"common": {"name": null, "k": 1}}), &options, &admin)
            .await
            .unwrap();

        let obj = fx.db.get_object("p.x", &admin).await.unwrap().unwrap();
        assert!(obj["common"].get("name").is_none());
        assert_eq!(obj["common"]["custom"]["a"], 1);
        assert_eq!(obj["common"]["k"], 1);
    }

    #[tokio::test]
    async fn set_without_preserve_replaces_wholesale() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object("w.x", json!({"common": {"name": "X"}}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        fx.db
            .set_object("w.x", json!({"common": {"k": 1}}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        let obj = fx.db.get_object("w.x", &admin).await.unwrap().unwrap();
        assert!(obj["common"].get("name").is_none());
        assert_eq!(obj["common"]["k"], 1);
    }

    #[tokio::test]
    async fn del_object_honors_dont_delete() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object("d.y", json!({"common": {"dontDelete": true}}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        let err = fx.db.del_object("d.y", &admin).await.unwrap_err();
        assert!(matches!(err, StoreError::DontDelete));
        assert!(fx.db.get_object("d.y", &admin).await.unwrap().is_some());

        fx.db
            .set_object("d.z", json!({}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        fx.db.del_object("d.z", &admin).await.unwrap();
        assert!(fx.db.get_object("d.z", &admin).await.unwrap().is_none());
        assert!(matches!(
            fx.db.del_object("d.z", &admin).await.unwrap_err(),
            StoreError::NotExists
        ));
    }

    #[tokio::test]
    async fn deletion_publishes_null() {
        let mut fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object("del.me", json!({}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        let _ = fx.events.try_recv();

        fx.db.del_object("del.me", &admin).await.unwrap();
        let event = fx.events.try_recv().unwrap();
        assert_eq!(event.id, "del.me");
        assert!(event.obj.is_none());
    }

    #[tokio::test]
    async fn get_keys_filters_and_sorts() {
        let fx = fixture();
        let admin = admin_subject();
        for id in ["b.two", "a.one", "a.three"] {
            fx.db
                .set_object(id, json!({}), &WriteOptions::default(), &admin)
                .await
                .unwrap();
        }
        let keys = fx.db.get_keys("a.*", &admin).await.unwrap();
        assert_eq!(keys, vec!["a.one".to_string(), "a.three".to_string()]);
    }

    #[tokio::test]
    async fn get_objects_reports_per_element() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object("g.a", json!({}), &WriteOptions::default(), &admin)
            .await
            .unwrap();

        assert!(matches!(
            fx.db.get_objects(None, &admin).await.unwrap_err(),
            StoreError::NoKeys
        ));

        let keys = vec!["g.a".to_string(), "g.missing".to_string()];
        let values = fx.db.get_objects(Some(&keys), &admin).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["_id"], "g.a");
        assert!(values[1].is_null());
    }

    #[tokio::test]
    async fn object_list_range_and_underscore_rule() {
        let fx = fixture();
        let admin = admin_subject();
        for id in ["k.a", "k.b", "k.c", "_design.x"] {
            fx.db
                .set_object(id, json!({}), &WriteOptions::default(), &admin)
                .await
                .unwrap();
        }

        let list = fx
            .db
            .get_object_list(
                &ObjectListParams {
                    startkey: Some("k.a".to_string()),
                    endkey: Some("k.b".to_string()),
                    sorted: true,
                    ..ObjectListParams::default()
                },
                &admin,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = list.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["k.a", "k.b"]);

        let all = fx
            .db
            .get_object_list(&ObjectListParams::default(), &admin)
            .await
            .unwrap();
        assert!(all.rows.iter().all(|r| !r.id.starts_with('_')));

        let with_docs = fx
            .db
            .get_object_list(
                &ObjectListParams {
                    include_docs: true,
                    ..ObjectListParams::default()
                },
                &admin,
            )
            .await
            .unwrap();
        assert!(with_docs.rows.iter().any(|r| r.id == "_design.x"));
    }

    #[tokio::test]
    async fn chown_and_chmod_apply_to_matching_objects() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object("c.a", json!({}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        fx.db
            .set_object("c.b", json!({}), &WriteOptions::default(), &admin)
            .await
            .unwrap();

        let err = fx
            .db
            .chown_object("c.*", &WriteOptions::default(), &admin)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidParameter));

        let options = WriteOptions {
            owner: Some("system.user.alice".to_string()),
            owner_group: Some("system.group.operator".to_string()),
            ..WriteOptions::default()
        };
        let modified = fx.db.chown_object("c.*", &options, &admin).await.unwrap();
        assert_eq!(modified.len(), 2);
        assert!(modified
            .iter()
            .all(|o| o["acl"]["owner"] == "system.user.alice"));

        let modified = fx
            .db
            .chmod_object("c.a", Some(0x600), None, &admin)
            .await
            .unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0]["acl"]["object"], 0x600);
    }

    #[tokio::test]
    async fn find_object_by_id_then_name() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object(
                "f.a",
                json!({"common": {"name": "Thermostat", "type": "device"}}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();

        assert_eq!(
            fx.db.find_object("f.a", None, &admin).await.unwrap(),
            Some("f.a".to_string())
        );
        assert_eq!(
            fx.db.find_object("Thermostat", None, &admin).await.unwrap(),
            Some("f.a".to_string())
        );
        assert_eq!(
            fx.db
                .find_object("Thermostat", Some("device"), &admin)
                .await
                .unwrap(),
            Some("f.a".to_string())
        );
        assert_eq!(
            fx.db
                .find_object("Thermostat", Some("sensor"), &admin)
                .await
                .unwrap(),
            None
        );
        assert_eq!(fx.db.find_object("nope", None, &admin).await.unwrap(), None);
    }

    #[tokio::test]
    async fn default_acl_change_back_propagates() {
        let fx = fixture();
        let admin = admin_subject();
        // An object written before the template change, stripped of its ACL
        // to simulate a legacy record.
        fx.db
            .set_object("legacy.x", json!({}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        {
            let mut map = fx.db.map.write().await;
            if let Some(obj) = map.get_mut("legacy.x") {
                obj.as_object_mut().unwrap().remove("acl");
            }
        }

        fx.db
            .set_object(
                SYSTEM_CONFIG_ID,
                json!({"common": {"defaultNewAcl": {
                    "owner": "system.user.u",
                    "ownerGroup": "system.group.g",
                    "object": 0x664,
                    "state": 0x664,
                    "file": 0x664
                }}}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();

        let obj = fx.db.get_object("legacy.x", &admin).await.unwrap().unwrap();
        assert_eq!(obj["acl"]["owner"], "system.user.u");
        assert!(obj["acl"].get("file").is_none());

        // New objects now use the new template too.
        fx.db
            .set_object("fresh.x", json!({"type": "state"}), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        let obj = fx.db.get_object("fresh.x", &admin).await.unwrap().unwrap();
        assert_eq!(obj["acl"]["ownerGroup"], "system.group.g");
        assert_eq!(obj["acl"]["state"], 0x664);
    }

    #[tokio::test]
    async fn non_edit_requires_token() {
        let fx = fixture();
        let admin = admin_subject();
        fx.db
            .set_object(
                "vendor.info",
                json!({"common": {"nonEdit": {"passHash": "secret"}, "name": "V"}}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();

        let err = fx
            .db
            .extend_object(
                "vendor.info",
                json!({"common": {"name": "Hacked"}}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonEditable));
        let obj = fx.db.get_object("vendor.info", &admin).await.unwrap().unwrap();
        assert_eq!(obj["common"]["name"], "V");

        fx.db
            .extend_object(
                "vendor.info",
                json!({"common": {"name": "Updated", "nonEdit": {"password": "secret"}}}),
                &WriteOptions::default(),
                &admin,
            )
            .await
            .unwrap();
        let obj = fx.db.get_object("vendor.info", &admin).await.unwrap().unwrap();
        assert_eq!(obj["common"]["name"], "Updated");
        // The stored protection block is preserved verbatim.
        assert_eq!(obj["common"]["nonEdit"]["passHash"], "secret");
        assert!(obj["common"]["nonEdit"].get("password").is_none());
    }

    #[tokio::test]
    async fn clone_independence() {
        let fx = fixture();
        let admin = admin_subject();
        let mut payload = json!({"common": {"name": "X"}});
        fx.db
            .set_object("i.x", payload.clone(), &WriteOptions::default(), &admin)
            .await
            .unwrap();
        payload["common"]["name"] = json!("mutated");

        let obj = fx.db.get_object("i.x", &admin).await.unwrap().unwrap();
        assert_eq!(obj["common"]["name"], "X");
    }

    #[test]
    fn deep_merge_rules() {
        let merged = deep_merge(
            json!({"a": {"x": 1, "y": 2}, "arr": [1, 2], "s": "old"}),
            json!({"a": {"y": 3}, "arr": [9], "s": "new", "extra": null}),
        );
        assert_eq!(merged["a"]["x"], 1);
        assert_eq!(merged["a"]["y"], 3);
        assert_eq!(merged["arr"], json!([9]));
        assert_eq!(merged["s"], "new");
        assert_eq!(merged["extra"], Value::Null);
    }
}
