//! The request façade.
//!
//! Every externally callable operation enters here with the same shape:
//! normalize the options (caller-supplied ACLs are stripped), sanitize ids
//! and paths, resolve the caller to a subject, check permissions, then
//! delegate to the realm implementation. Failures short-circuit before
//! anything is published.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::acl::{AclEngine, Subject};
use crate::pubsub::{ChangeEvent, Dispatcher, Realm};
use crate::storage::files::{DirEntry, FileDb, FileOptions, FileSink};
use crate::storage::objects::{NonEditGuard, ObjectDb, ObjectList, ObjectListParams, WriteOptions};
use crate::storage::snapshot::SnapshotConfig;
use crate::storage::views::{self, ViewResult};
use crate::storage::{FileAcl, ObjectAcl, StoreError, ADMIN_USER, DEFAULT_PERMS};

/// Options accepted on any operation. Unknown fields are dropped during
/// deserialization, which is also what strips a caller-supplied `acl`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallOptions {
    pub user: Option<String>,
    pub owner: Option<String>,
    #[serde(rename = "ownerGroup")]
    pub owner_group: Option<String>,
    #[serde(rename = "preserveSettings", default)]
    pub preserve_settings: Vec<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub mode: Option<u16>,
    pub object: Option<u16>,
    pub state: Option<u16>,
    #[serde(default)]
    pub filter: bool,
}

impl CallOptions {
    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            owner: self.owner.clone(),
            owner_group: self.owner_group.clone(),
            preserve_settings: self.preserve_settings.clone(),
        }
    }

    fn file_options(&self) -> FileOptions {
        FileOptions {
            mime_type: self.mime_type.clone(),
            mode: self.mode,
            owner: self.owner.clone(),
            owner_group: self.owner_group.clone(),
            filter: self.filter,
        }
    }
}

/// Construction options for [`Db`].
pub struct DbOptions {
    pub data_dir: PathBuf,
    pub namespace: String,
    pub default_new_acl: Option<ObjectAcl>,
    pub no_file_cache: bool,
    pub snapshot: SnapshotConfig,
    /// Process-local change sink; receives every change matching a local
    /// subscription.
    pub change_sink: Option<mpsc::UnboundedSender<ChangeEvent>>,
    pub non_edit_guard: Option<NonEditGuard>,
}

impl DbOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            namespace: "confdb".to_string(),
            default_new_acl: None,
            no_file_cache: false,
            snapshot: SnapshotConfig::default(),
            change_sink: None,
            non_edit_guard: None,
        }
    }
}

/// The database façade shared by every connection.
pub struct Db {
    pub objects: ObjectDb,
    pub files: Arc<FileDb>,
    pub dispatcher: Arc<Dispatcher>,
    namespace: String,
}

impl Db {
    /// Open (or create) the data directory and bring both realms up.
    /// An unwritable data directory is fatal.
    pub fn open(options: DbOptions) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&options.data_dir)?;

        let dispatcher = Arc::new(Dispatcher::new(options.change_sink));
        let acl = Arc::new(AclEngine::new());
        let objects = ObjectDb::open(
            &options.data_dir,
            options.snapshot,
            dispatcher.clone(),
            acl.clone(),
            options.default_new_acl,
            options.non_edit_guard,
        );
        let files = Arc::new(FileDb::new(
            &options.data_dir,
            dispatcher.clone(),
            file_acl_of(&objects.default_acl()),
            options.no_file_cache,
        ));

        tracing::info!(namespace = %options.namespace, data_dir = %options.data_dir.display(), "database open");
        Ok(Arc::new(Self {
            objects,
            files,
            dispatcher,
            namespace: options.namespace,
        }))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Flush all pending persistence and stop the background tasks.
    pub async fn destroy(&self) {
        self.files.destroy().await;
        self.objects.destroy().await;
        tracing::info!("database closed");
    }

    /// Resolve the caller; absent user means the hosting process itself.
    async fn subject(&self, options: &CallOptions) -> Arc<Subject> {
        let user = options.user.as_deref().unwrap_or(ADMIN_USER);
        self.objects.resolve_subject(user).await
    }

    // ---- object realm -----------------------------------------------------

    pub async fn get_object(
        &self,
        id: &str,
        options: &CallOptions,
    ) -> Result<Option<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.objects.get_object(id, &subject).await
    }

    pub async fn set_object(
        &self,
        id: &str,
        obj: Value,
        options: &CallOptions,
    ) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        self.objects
            .set_object(id, obj, &options.write_options(), &subject)
            .await?;
        if id == crate::storage::objects::SYSTEM_CONFIG_ID {
            // The file realm shares the (possibly re-seeded) template.
            self.files.set_default_acl(file_acl_of(&self.objects.default_acl()));
        }
        Ok(())
    }

    pub async fn extend_object(
        &self,
        id: &str,
        partial: Value,
        options: &CallOptions,
    ) -> Result<Value, StoreError> {
        let subject = self.subject(options).await;
        self.objects
            .extend_object(id, partial, &options.write_options(), &subject)
            .await
    }

    pub async fn del_object(&self, id: &str, options: &CallOptions) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        self.objects.del_object(id, &subject).await
    }

    pub async fn get_keys(
        &self,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<String>, StoreError> {
        let subject = self.subject(options).await;
        self.objects.get_keys(pattern, &subject).await
    }

    pub async fn get_objects(
        &self,
        keys: Option<&[String]>,
        options: &CallOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.objects.get_objects(keys, &subject).await
    }

    pub async fn get_objects_by_pattern(
        &self,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.objects.get_objects_by_pattern(pattern, &subject).await
    }

    pub async fn get_object_list(
        &self,
        params: &ObjectListParams,
        options: &CallOptions,
    ) -> Result<ObjectList, StoreError> {
        let subject = self.subject(options).await;
        self.objects.get_object_list(params, &subject).await
    }

    pub async fn chown_object(
        &self,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.objects
            .chown_object(pattern, &options.write_options(), &subject)
            .await
    }

    pub async fn chmod_object(
        &self,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.objects
            .chmod_object(pattern, options.object, options.state, &subject)
            .await
    }

    pub async fn find_object(
        &self,
        id_or_name: &str,
        type_filter: Option<&str>,
        options: &CallOptions,
    ) -> Result<Option<String>, StoreError> {
        let subject = self.subject(options).await;
        self.objects.find_object(id_or_name, type_filter, &subject).await
    }

    pub async fn destroy_db(&self, options: &CallOptions) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        self.objects.destroy_db(&subject).await
    }

    pub async fn get_object_view(
        &self,
        design: &str,
        search: &str,
        params: &ObjectListParams,
        options: &CallOptions,
    ) -> Result<ViewResult, StoreError> {
        let subject = self.subject(options).await;
        if !subject.is_admin() && !subject.acl.object.list {
            return Err(StoreError::Permission);
        }
        views::get_object_view(&self.objects, &subject, design, search, params).await
    }

    // ---- file realm -------------------------------------------------------

    pub async fn write_file(
        &self,
        id: &str,
        name: &str,
        data: Bytes,
        options: &CallOptions,
    ) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        self.files
            .write_file(id, name, data, &options.file_options(), &subject)
            .await
    }

    pub async fn read_file(
        &self,
        id: &str,
        name: &str,
        options: &CallOptions,
    ) -> Result<(Bytes, String), StoreError> {
        let subject = self.subject(options).await;
        self.files.read_file(id, name, &subject).await
    }

    pub async fn unlink(&self, id: &str, name: &str, options: &CallOptions) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        self.files.unlink(id, name, &subject).await
    }

    pub async fn read_dir(
        &self,
        id: &str,
        name: &str,
        options: &CallOptions,
    ) -> Result<Vec<DirEntry>, StoreError> {
        let subject = self.subject(options).await;
        self.files
            .read_dir(id, name, &options.file_options(), &subject)
            .await
    }

    pub async fn rename(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        options: &CallOptions,
    ) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        self.files.rename(id, old_name, new_name, &subject).await
    }

    pub async fn touch(
        &self,
        id: &str,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.files.touch(id, pattern, &subject).await
    }

    pub async fn rm(
        &self,
        id: &str,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<String>, StoreError> {
        let subject = self.subject(options).await;
        self.files.rm(id, pattern, &subject).await
    }

    pub async fn mkdir(&self, id: &str, dirname: &str, options: &CallOptions) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        self.files.mkdir(id, dirname, &subject).await
    }

    pub async fn chown_file(
        &self,
        id: &str,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.files
            .chown_file(id, pattern, &options.file_options(), &subject)
            .await
    }

    pub async fn chmod_file(
        &self,
        id: &str,
        pattern: &str,
        options: &CallOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let subject = self.subject(options).await;
        self.files
            .chmod_file(id, pattern, &options.file_options(), &subject)
            .await
    }

    pub async fn enable_file_cache(
        &self,
        enabled: bool,
        options: &CallOptions,
    ) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        if !subject.is_admin() && !subject.acl.object.write {
            return Err(StoreError::Permission);
        }
        self.files.enable_file_cache(enabled).await;
        Ok(())
    }

    pub fn insert(&self, id: &str, name: &str, options: &CallOptions) -> FileSink {
        FileSink::new(self.files.clone(), id, name, options.file_options())
    }

    // ---- subscriptions ----------------------------------------------------

    /// Subscribing requires the list bit on the realm.
    pub async fn check_subscribe(&self, realm: Realm, options: &CallOptions) -> Result<(), StoreError> {
        let subject = self.subject(options).await;
        if subject.is_admin() {
            return Ok(());
        }
        let allowed = match realm {
            Realm::Objects => subject.acl.object.list,
            Realm::Files => subject.acl.file.list,
        };
        if allowed {
            Ok(())
        } else {
            Err(StoreError::Permission)
        }
    }

    pub fn subscribe_local(&self, realm: Realm, pattern: &str) {
        self.dispatcher.subscribe_local(realm, pattern);
    }

    pub fn unsubscribe_local(&self, realm: Realm, pattern: &str) {
        self.dispatcher.unsubscribe_local(realm, pattern);
    }
}

/// Project the object template onto the file realm.
fn file_acl_of(template: &ObjectAcl) -> FileAcl {
    FileAcl {
        owner: template.owner.clone(),
        owner_group: template.owner_group.clone(),
        permissions: template.file.unwrap_or(DEFAULT_PERMS),
    }
}
