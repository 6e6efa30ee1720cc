use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod files;
pub mod mime;
pub mod objects;
pub mod snapshot;
pub mod views;

/// Permission bits inside one triple of the 12-bit permission word.
pub const PERM_READ: u16 = 0x4;
pub const PERM_WRITE: u16 = 0x2;
pub const PERM_EXEC: u16 = 0x1;

/// Triple positions inside the permission word.
pub const SHIFT_USER: u16 = 8;
pub const SHIFT_GROUP: u16 = 4;
pub const SHIFT_EVERYONE: u16 = 0;

/// rw-rw-r-- in permission-word form, the conventional default.
pub const DEFAULT_PERMS: u16 = 0x664;

pub const ADMIN_USER: &str = "system.user.admin";
pub const ADMIN_GROUP: &str = "system.group.administrator";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid ID: {0}")]
    InvalidId(String),
    #[error("Empty ID")]
    EmptyId,
    #[error("permissionError")]
    Permission,
    #[error("Not exists")]
    NotExists,
    #[error("Yet exists")]
    YetExists,
    #[error("Invalid password for update of vendor information")]
    NonEditable,
    #[error("obj is null")]
    NullObject,
    #[error("Object is marked as non deletable")]
    DontDelete,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("no keys")]
    NoKeys,
    #[error("Cannot find view \"{search}\" of design \"{design}\"")]
    ViewNotFound { design: String, search: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// ACL attached to a stored object. `state` is only present on objects of
/// `type == "state"`; `file` only ever appears on the template
/// (`system.config.common.defaultNewAcl`), never on an object itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAcl {
    pub owner: String,
    #[serde(rename = "ownerGroup")]
    pub owner_group: String,
    pub object: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<u16>,
}

impl Default for ObjectAcl {
    fn default() -> Self {
        Self {
            owner: ADMIN_USER.to_string(),
            owner_group: ADMIN_GROUP.to_string(),
            object: DEFAULT_PERMS,
            state: Some(DEFAULT_PERMS),
            file: Some(DEFAULT_PERMS),
        }
    }
}

/// ACL carried by a single file descriptor in the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAcl {
    pub owner: String,
    #[serde(rename = "ownerGroup")]
    pub owner_group: String,
    pub permissions: u16,
}

impl Default for FileAcl {
    fn default() -> Self {
        Self {
            owner: ADMIN_USER.to_string(),
            owner_group: ADMIN_GROUP.to_string(),
            permissions: DEFAULT_PERMS,
        }
    }
}
