// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::storage::snapshot::BackupConfig;
use crate::storage::ObjectAcl;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Namespace reported to clients (used for log correlation)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub backup: BackupSection,

    /// Template for objects and files written without an explicit ACL.
    /// Overridden by a persisted `system.config.common.defaultNewAcl`.
    #[serde(default)]
    pub default_new_acl: Option<ObjectAcl>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            connection: ConnectionConfig::default(),
            backup: BackupSection::default(),
            default_new_acl: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Disable the decoded-text file cache
    #[serde(default)]
    pub no_file_cache: bool,

    /// Serve over TLS; requires public_cert and private_key
    #[serde(default)]
    pub secure: bool,

    #[serde(default)]
    pub public_cert: Option<PathBuf>,

    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            host: default_host(),
            port: default_port(),
            no_file_cache: false,
            secure: false,
            public_cert: None,
            private_key: None,
        }
    }
}

impl ConnectionConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupSection {
    /// Disable gzipped backups entirely
    #[serde(default)]
    pub disabled: bool,

    /// Minimum number of backups retained regardless of age
    #[serde(default = "default_backup_files")]
    pub files: usize,

    /// Backups beyond the minimum are deleted once older than this (hours)
    #[serde(default = "default_backup_hours")]
    pub hours: i64,

    /// Minutes between two backups
    #[serde(default = "default_backup_period")]
    pub period: i64,

    /// Override for the backup directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            disabled: false,
            files: default_backup_files(),
            hours: default_backup_hours(),
            period: default_backup_period(),
            path: None,
        }
    }
}

impl From<BackupSection> for BackupConfig {
    fn from(section: BackupSection) -> Self {
        Self {
            disabled: section.disabled,
            files: section.files,
            hours: section.hours,
            period: section.period,
            path: section.path,
        }
    }
}

impl Config {
    pub fn from_path(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }
}

fn default_namespace() -> String {
    "confdb".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_backup_files() -> usize {
    24
}

fn default_backup_hours() -> i64 {
    48
}

fn default_backup_period() -> i64 {
    120
}
