//! Per-object blob store with sidecar descriptors.
//!
//! Every object id with files owns a directory `<root>/files/<id>/` holding
//! the blobs plus one `_data.json` sidecar mapping each relative path to its
//! descriptor (MIME type, binary flag, timestamps, ACL). The sidecar is the
//! source of truth for ACL purposes: bytes on disk without a sidecar entry
//! do not exist as far as permissions are concerned. Sidecars are lazy
//! loaded and written back by a debounced task batching all dirty ids.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::acl::{self, Subject};
use crate::glob::glob_to_regex;
use crate::pubsub::{Dispatcher, Realm};
use crate::storage::mime::mime_for_name;
use crate::storage::{FileAcl, StoreError, PERM_READ, PERM_WRITE};

pub const SIDECAR_FILE: &str = "_data.json";

/// Debounce window for sidecar write-back.
const SIDECAR_FLUSH_DELAY: Duration = Duration::from_secs(1);

/// Descriptor of one stored file, as persisted in the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(default)]
    pub binary: bool,
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,
    #[serde(rename = "modifiedAt", default)]
    pub modified_at: i64,
    #[serde(default)]
    pub acl: FileAcl,
}

/// One row returned by `read_dir`.
#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub file: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    pub stats: FileStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<EntryAcl>,
    #[serde(rename = "modifiedAt", skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileStats {
    pub size: u64,
}

/// Sidecar ACL enriched with the caller's effective rights.
#[derive(Debug, Clone, Serialize)]
pub struct EntryAcl {
    pub owner: String,
    #[serde(rename = "ownerGroup")]
    pub owner_group: String,
    pub permissions: u16,
    pub read: bool,
    pub write: bool,
}

/// Per-call options forwarded by the request façade.
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    pub mime_type: Option<String>,
    pub mode: Option<u16>,
    pub owner: Option<String>,
    pub owner_group: Option<String>,
    /// `read_dir` only: prune entries the caller may not access.
    pub filter: bool,
}

type Sidecar = BTreeMap<String, FileMeta>;

#[derive(Default)]
struct FileState {
    /// Loaded sidecars by object id. Presence means loaded, possibly empty.
    sidecars: HashMap<String, Sidecar>,
    /// Object ids whose sidecar needs writing back.
    dirty: HashSet<String>,
    /// Decoded text cache keyed by `<id>/<path>`.
    cache: HashMap<String, String>,
}

struct Inner {
    root: PathBuf,
    state: Mutex<FileState>,
    dispatcher: Arc<Dispatcher>,
    default_acl: std::sync::RwLock<FileAcl>,
    cache_enabled: AtomicBool,
    shutdown: AtomicBool,
}

pub struct FileDb {
    inner: Arc<Inner>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FileDb {
    /// `root` is the data directory; blobs live under `<root>/files/`.
    pub fn new(
        root: impl Into<PathBuf>,
        dispatcher: Arc<Dispatcher>,
        default_acl: FileAcl,
        no_file_cache: bool,
    ) -> Self {
        let inner = Arc::new(Inner {
            root: root.into().join("files"),
            state: Mutex::new(FileState::default()),
            dispatcher,
            default_acl: std::sync::RwLock::new(default_acl),
            cache_enabled: AtomicBool::new(!no_file_cache),
            shutdown: AtomicBool::new(false),
        });

        let task = {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut ticker = interval(SIDECAR_FLUSH_DELAY);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if inner.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    inner.flush_dirty().await;
                }
            })
        };

        Self {
            inner,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Template applied to files written without an explicit ACL. Updated
    /// when `system.config.common.defaultNewAcl` changes.
    pub fn set_default_acl(&self, acl: FileAcl) {
        *self.inner.default_acl.write().expect("file acl lock") = acl;
    }

    /// Flush all dirty sidecars and stop the write-back task.
    pub async fn destroy(&self) {
        self.inner.flush_dirty().await;
        self.inner.shutdown.store(true, Ordering::Relaxed);
        let handle = self.task.lock().expect("sidecar task lock").take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn write_file(
        &self,
        id: &str,
        name: &str,
        data: Bytes,
        options: &FileOptions,
        subject: &Subject,
    ) -> Result<(), StoreError> {
        let id = sanitize_id(id)?;
        let name = sanitize_path(name)?;

        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;
        let entry_acl = state
            .sidecars
            .get(&id)
            .and_then(|s| s.get(&name))
            .map(|m| m.acl.clone());
        acl::check_file(entry_acl.as_ref(), subject, PERM_WRITE)?;

        let (table_mime, table_binary) = mime_for_name(&name);
        let mime_type = options
            .mime_type
            .clone()
            .unwrap_or_else(|| table_mime.to_string());

        let path = self.inner.file_path(&id, &name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;

        let now = Utc::now().timestamp_millis();
        let template = self.inner.default_acl();
        let sidecar = state.sidecars.entry(id.clone()).or_default();
        let meta = sidecar.entry(name.clone()).or_insert_with(|| FileMeta {
            mime_type: mime_type.clone(),
            binary: table_binary,
            created_at: now,
            modified_at: now,
            acl: FileAcl {
                owner: options.owner.clone().unwrap_or(template.owner),
                owner_group: options.owner_group.clone().unwrap_or(template.owner_group),
                permissions: options.mode.unwrap_or(template.permissions),
            },
        });
        meta.mime_type = mime_type;
        meta.binary = table_binary;
        meta.modified_at = now;
        if let Some(mode) = options.mode {
            meta.acl.permissions = mode;
        }
        let published = meta.clone();

        let cache_key = cache_key(&id, &name);
        if !table_binary && self.inner.cache_enabled.load(Ordering::Relaxed) {
            match std::str::from_utf8(&data) {
                Ok(text) => {
                    state.cache.insert(cache_key, text.to_string());
                }
                Err(_) => {
                    state.cache.remove(&cache_key);
                }
            }
        } else {
            state.cache.remove(&cache_key);
        }

        state.dirty.insert(id.clone());
        self.publish(&id, &name, Some(&published));
        Ok(())
    }

    pub async fn read_file(
        &self,
        id: &str,
        name: &str,
        subject: &Subject,
    ) -> Result<(Bytes, String), StoreError> {
        let id = sanitize_id(id)?;
        let name = sanitize_path(name)?;

        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;
        let meta = state.sidecars.get(&id).and_then(|s| s.get(&name)).cloned();
        acl::check_file(meta.as_ref().map(|m| &m.acl), subject, PERM_READ)?;

        let mime_type = meta
            .as_ref()
            .map(|m| m.mime_type.clone())
            .unwrap_or_else(|| mime_for_name(&name).0.to_string());

        let key = cache_key(&id, &name);
        if self.inner.cache_enabled.load(Ordering::Relaxed) {
            if let Some(text) = state.cache.get(&key) {
                return Ok((Bytes::from(text.clone().into_bytes()), mime_type));
            }
        }

        let path = self.inner.file_path(&id, &name);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotExists)
            }
            Err(e) => return Err(e.into()),
        };

        let binary = meta.map(|m| m.binary).unwrap_or_else(|| mime_for_name(&name).1);
        if !binary && self.inner.cache_enabled.load(Ordering::Relaxed) {
            if let Ok(text) = std::str::from_utf8(&data) {
                state.cache.insert(key, text.to_string());
            }
        }
        Ok((data, mime_type))
    }

    pub async fn unlink(&self, id: &str, name: &str, subject: &Subject) -> Result<(), StoreError> {
        let id = sanitize_id(id)?;
        let name = sanitize_path(name)?;

        if !subject.is_admin() && !subject.acl.file.delete {
            return Err(StoreError::Permission);
        }

        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;
        let entry_acl = state
            .sidecars
            .get(&id)
            .and_then(|s| s.get(&name))
            .map(|m| m.acl.clone());
        acl::check_file(entry_acl.as_ref(), subject, PERM_WRITE)?;

        let path = self.inner.file_path(&id, &name);
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

        if is_dir {
            // Remove every contained entry first, then the directory itself.
            let prefix = format!("{name}/");
            let removed: Vec<String> = state
                .sidecars
                .get(&id)
                .map(|s| {
                    s.keys()
                        .filter(|k| k.starts_with(&prefix))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if let Some(sidecar) = state.sidecars.get_mut(&id) {
                sidecar.retain(|k, _| !k.starts_with(&prefix));
            }
            for gone in &removed {
                state.cache.remove(&cache_key(&id, gone));
                self.publish(&id, gone, None);
            }
            // Entries are already gone from memory; arm the flush before
            // touching the disk.
            state.dirty.insert(id.clone());
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            let had_entry = state
                .sidecars
                .get_mut(&id)
                .map(|s| s.remove(&name).is_some())
                .unwrap_or(false);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !had_entry {
                        return Err(StoreError::NotExists);
                    }
                }
                Err(e) => return Err(e.into()),
            }
            state.cache.remove(&cache_key(&id, &name));
            self.publish(&id, &name, None);
        }

        state.dirty.insert(id.clone());
        Ok(())
    }

    pub async fn read_dir(
        &self,
        id: &str,
        name: &str,
        options: &FileOptions,
        subject: &Subject,
    ) -> Result<Vec<DirEntry>, StoreError> {
        let id = sanitize_id(id)?;
        let name = sanitize_path(name)?;

        if !subject.is_admin() && (!subject.acl.file.list || !subject.acl.file.read) {
            return Err(StoreError::Permission);
        }

        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;

        // Children are the union of sidecar keys below `name` (collapsed to
        // their first segment) and on-disk directory entries.
        let prefix = if name.is_empty() {
            String::new()
        } else {
            format!("{name}/")
        };
        let mut children: BTreeSet<String> = state
            .sidecars
            .get(&id)
            .map(|s| {
                s.keys()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
                    .collect()
            })
            .unwrap_or_default();

        let dir_path = self.inner.file_path(&id, &name);
        if let Ok(mut entries) = tokio::fs::read_dir(&dir_path).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(file_name) = entry.file_name().into_string() {
                    if file_name != SIDECAR_FILE && file_name != "." && file_name != ".." {
                        children.insert(file_name);
                    }
                }
            }
        }

        let mut rows = Vec::with_capacity(children.len());
        for child in children {
            let rel = if prefix.is_empty() {
                child.clone()
            } else {
                format!("{prefix}{child}")
            };
            let meta = state.sidecars.get(&id).and_then(|s| s.get(&rel));

            let fs_meta = tokio::fs::metadata(self.inner.file_path(&id, &rel)).await.ok();
            let is_dir = fs_meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
            let size = fs_meta.as_ref().map(|m| m.len()).unwrap_or(0);

            let acl = meta.map(|m| EntryAcl {
                owner: m.acl.owner.clone(),
                owner_group: m.acl.owner_group.clone(),
                permissions: m.acl.permissions,
                read: acl::file_permitted(Some(&m.acl), subject, PERM_READ),
                write: acl::file_permitted(Some(&m.acl), subject, PERM_WRITE),
            });

            if options.filter {
                if let Some(acl) = &acl {
                    if !acl.read && !acl.write {
                        continue;
                    }
                }
            }

            rows.push(DirEntry {
                file: child,
                is_dir,
                stats: FileStats { size },
                modified_at: meta.map(|m| m.modified_at),
                created_at: meta.map(|m| m.created_at),
                acl,
            });
        }
        Ok(rows)
    }

    pub async fn rename(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        subject: &Subject,
    ) -> Result<(), StoreError> {
        let id = sanitize_id(id)?;
        let old_name = sanitize_path(old_name)?;
        let new_name = sanitize_path(new_name)?;

        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;
        let entry_acl = state
            .sidecars
            .get(&id)
            .and_then(|s| s.get(&old_name))
            .map(|m| m.acl.clone());
        acl::check_file(entry_acl.as_ref(), subject, PERM_WRITE)?;

        let from = self.inner.file_path(&id, &old_name);
        let to = self.inner.file_path(&id, &new_name);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotExists)
            }
            Err(e) => return Err(e.into()),
        }

        let moved = state
            .sidecars
            .get_mut(&id)
            .and_then(|s| s.remove(&old_name));
        if let Some(meta) = moved {
            let published = meta.clone();
            state
                .sidecars
                .entry(id.clone())
                .or_default()
                .insert(new_name.clone(), meta);
            self.publish(&id, &old_name, None);
            self.publish(&id, &new_name, Some(&published));
        }
        if let Some(text) = state.cache.remove(&cache_key(&id, &old_name)) {
            state.cache.insert(cache_key(&id, &new_name), text);
        }
        state.dirty.insert(id.clone());
        Ok(())
    }

    /// Refresh `modifiedAt` of every writable sidecar entry matching the
    /// glob, synthesizing descriptor defaults where absent.
    pub async fn touch(
        &self,
        id: &str,
        pattern: &str,
        subject: &Subject,
    ) -> Result<Vec<Value>, StoreError> {
        let id = sanitize_id(id)?;
        if !subject.is_admin() && !subject.acl.file.write {
            return Err(StoreError::Permission);
        }

        let regex = glob_to_regex(pattern);
        let now = Utc::now().timestamp_millis();
        let template = self.inner.default_acl();

        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;

        let mut touched = Vec::new();
        if let Some(sidecar) = state.sidecars.get_mut(&id) {
            for (name, meta) in sidecar.iter_mut() {
                if !regex.is_match(name) {
                    continue;
                }
                if !acl::file_permitted(Some(&meta.acl), subject, PERM_WRITE) {
                    continue;
                }
                meta.modified_at = now;
                if meta.created_at == 0 {
                    meta.created_at = now;
                }
                if meta.mime_type.is_empty() {
                    meta.mime_type = mime_for_name(name).0.to_string();
                }
                if meta.acl.owner.is_empty() {
                    meta.acl = template.clone();
                }
                let mut row = serde_json::to_value(&*meta).expect("meta serializes");
                row["file"] = json!(name);
                touched.push(row);
            }
        }

        if !touched.is_empty() {
            state.dirty.insert(id.clone());
        }
        Ok(touched)
    }

    /// Remove every matching sidecar entry and its bytes, then prune any
    /// directories left empty.
    pub async fn rm(
        &self,
        id: &str,
        pattern: &str,
        subject: &Subject,
    ) -> Result<Vec<String>, StoreError> {
        let id = sanitize_id(id)?;
        if !subject.is_admin() && !subject.acl.file.delete {
            return Err(StoreError::Permission);
        }

        let regex = glob_to_regex(pattern);
        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;

        let victims: Vec<String> = state
            .sidecars
            .get(&id)
            .map(|s| {
                s.iter()
                    .filter(|(name, meta)| {
                        regex.is_match(name)
                            && acl::file_permitted(Some(&meta.acl), subject, PERM_WRITE)
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut removed = Vec::with_capacity(victims.len());
        for name in victims {
            if let Some(sidecar) = state.sidecars.get_mut(&id) {
                sidecar.remove(&name);
            }
            state.cache.remove(&cache_key(&id, &name));
            let path = self.inner.file_path(&id, &name);
            let _ = tokio::fs::remove_file(&path).await;
            self.prune_empty_parents(&id, &name).await;
            self.publish(&id, &name, None);
            removed.push(name);
        }

        if !removed.is_empty() {
            state.dirty.insert(id.clone());
        }
        Ok(removed)
    }

    pub async fn mkdir(&self, id: &str, dirname: &str, subject: &Subject) -> Result<(), StoreError> {
        let id = sanitize_id(id)?;
        let dirname = sanitize_path(dirname)?;
        if !subject.is_admin() && !subject.acl.file.write {
            return Err(StoreError::Permission);
        }

        let path = self.inner.file_path(&id, &dirname);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Err(StoreError::YetExists);
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    pub async fn chown_file(
        &self,
        id: &str,
        pattern: &str,
        options: &FileOptions,
        subject: &Subject,
    ) -> Result<Vec<Value>, StoreError> {
        let owner = options.owner.clone().ok_or(StoreError::InvalidParameter)?;
        let owner_group = options
            .owner_group
            .clone()
            .unwrap_or_else(|| self.inner.default_acl().owner_group);
        self.update_matching(id, pattern, subject, move |meta| {
            meta.acl.owner = owner.clone();
            meta.acl.owner_group = owner_group.clone();
        })
        .await
    }

    pub async fn chmod_file(
        &self,
        id: &str,
        pattern: &str,
        options: &FileOptions,
        subject: &Subject,
    ) -> Result<Vec<Value>, StoreError> {
        let mode = options.mode.ok_or(StoreError::InvalidParameter)?;
        self.update_matching(id, pattern, subject, move |meta| {
            meta.acl.permissions = mode;
        })
        .await
    }

    /// Flip the decoded-text cache. Disabling drops all cached content.
    pub async fn enable_file_cache(&self, enabled: bool) {
        self.inner.cache_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.inner.state.lock().await.cache.clear();
        }
    }

    async fn update_matching(
        &self,
        id: &str,
        pattern: &str,
        subject: &Subject,
        apply: impl Fn(&mut FileMeta),
    ) -> Result<Vec<Value>, StoreError> {
        let id = sanitize_id(id)?;
        if !subject.is_admin() && !subject.acl.file.write {
            return Err(StoreError::Permission);
        }

        let regex = glob_to_regex(pattern);
        let mut state = self.inner.state.lock().await;
        self.inner.ensure_loaded(&mut state, &id).await;

        let mut modified = Vec::new();
        if let Some(sidecar) = state.sidecars.get_mut(&id) {
            for (name, meta) in sidecar.iter_mut() {
                if !regex.is_match(name) {
                    continue;
                }
                if !acl::file_permitted(Some(&meta.acl), subject, PERM_WRITE) {
                    continue;
                }
                apply(meta);
                let mut row = serde_json::to_value(&*meta).expect("meta serializes");
                row["file"] = json!(name);
                modified.push(row);
            }
        }

        if !modified.is_empty() {
            state.dirty.insert(id.clone());
        }
        Ok(modified)
    }

    async fn prune_empty_parents(&self, id: &str, name: &str) {
        let mut rel = Path::new(name).parent();
        while let Some(parent) = rel {
            if parent.as_os_str().is_empty() {
                break;
            }
            let dir = self
                .inner
                .file_path(id, &parent.to_string_lossy());
            if tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            rel = parent.parent();
        }
    }

    fn publish(&self, id: &str, name: &str, meta: Option<&FileMeta>) {
        let topic = format!("{id}/{name}");
        let payload = meta.map(|m| {
            let mut v = serde_json::to_value(m).expect("meta serializes");
            v["file"] = json!(name);
            v
        });
        self.inner
            .dispatcher
            .publish_all(Realm::Files, &topic, payload.as_ref());
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().expect("sidecar task lock").take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn default_acl(&self) -> FileAcl {
        self.default_acl.read().expect("file acl lock").clone()
    }

    fn id_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn file_path(&self, id: &str, name: &str) -> PathBuf {
        let mut path = self.id_dir(id);
        for part in name.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    async fn ensure_loaded(&self, state: &mut FileState, id: &str) {
        if state.sidecars.contains_key(id) {
            return;
        }
        let sidecar = match tokio::fs::read(self.id_dir(id).join(SIDECAR_FILE)).await {
            Ok(bytes) => match serde_json::from_slice::<Sidecar>(&bytes) {
                Ok(sidecar) => sidecar,
                Err(e) => {
                    tracing::error!(%id, error = %e, "sidecar unreadable, starting empty");
                    Sidecar::new()
                }
            },
            Err(_) => Sidecar::new(),
        };
        state.sidecars.insert(id.to_string(), sidecar);
    }

    async fn flush_dirty(&self) {
        let to_write: Vec<(String, Sidecar)> = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state.dirty.drain().collect();
            ids.into_iter()
                .filter_map(|id| state.sidecars.get(&id).map(|s| (id, s.clone())))
                .collect()
        };

        for (id, sidecar) in to_write {
            let dir = self.id_dir(&id);
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                tracing::error!(%id, error = %e, "failed to create file directory");
                continue;
            }
            let bytes = match serde_json::to_vec(&sidecar) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(%id, error = %e, "failed to serialize sidecar");
                    continue;
                }
            };
            if let Err(e) = tokio::fs::write(dir.join(SIDECAR_FILE), bytes).await {
                tracing::error!(%id, error = %e, "failed to write sidecar");
            }
        }
    }
}

/// Streaming variant of `write_file`: accumulates chunks and commits them
/// as one write on finish.
pub struct FileSink {
    db: Arc<FileDb>,
    id: String,
    name: String,
    options: FileOptions,
    buf: Vec<u8>,
}

impl FileSink {
    pub fn new(db: Arc<FileDb>, id: &str, name: &str, options: FileOptions) -> Self {
        Self {
            db,
            id: id.to_string(),
            name: name.to_string(),
            options,
            buf: Vec::new(),
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub async fn finish(self, subject: &Subject) -> Result<(), StoreError> {
        self.db
            .write_file(
                &self.id,
                &self.name,
                Bytes::from(self.buf),
                &self.options,
                subject,
            )
            .await
    }
}

fn sanitize_id(id: &str) -> Result<String, StoreError> {
    if id.is_empty() {
        return Err(StoreError::EmptyId);
    }
    if id.contains("..") {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(id.to_string())
}

/// Strip a leading slash and eliminate traversal segments.
fn sanitize_path(name: &str) -> Result<String, StoreError> {
    Ok(name
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("/"))
}

fn cache_key(id: &str, name: &str) -> String {
    format!("{id}/{name}")
}
