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

use clap::Parser;
use confdb::config::Config;
use confdb::handler::{Db, DbOptions};
use confdb::observability::tracing_setup;
use confdb::server::{ConnectionManager, WsConnectionManager};
use confdb::storage::snapshot::SnapshotConfig;
use std::net::SocketAddr;

/// Exit code used when the listen port cannot be bound.
const EXIT_PORT_IN_USE: i32 = 24;

#[derive(Parser, Debug)]
#[command(name = "confdb")]
#[command(about = "In-memory configuration metadata database with a per-object file store", long_about = None)]
struct Args {
    /// Address to listen on (e.g., 0.0.0.0:9001, 127.0.0.1:9001)
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Data directory (overrides the configuration file)
    #[arg(short, long)]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with format from environment
    tracing_setup::init_tracing_from_env();

    let args = Args::parse();

    let cfg = if std::path::Path::new(&args.config).exists() {
        Config::from_path(&args.config).map_err(|e| anyhow::anyhow!("{e}"))?
    } else {
        tracing::info!(config = %args.config, "configuration file not found, using defaults");
        Config::default()
    };

    // Command line args override config file
    let addr: SocketAddr = match &args.listen {
        Some(listen) => listen.parse()?,
        None => cfg.connection.listen_addr()?,
    };
    let data_dir = args
        .data_dir
        .map(Into::into)
        .unwrap_or_else(|| cfg.connection.data_dir.clone());

    let db = Db::open(DbOptions {
        data_dir,
        namespace: cfg.namespace.clone(),
        default_new_acl: cfg.default_new_acl.clone(),
        no_file_cache: cfg.connection.no_file_cache,
        snapshot: SnapshotConfig {
            backup: cfg.backup.clone().into(),
            ..SnapshotConfig::default()
        },
        change_sink: None,
        non_edit_guard: None,
    })?;

    let server = if cfg.connection.secure {
        let (Some(cert), Some(key)) = (&cfg.connection.public_cert, &cfg.connection.private_key)
        else {
            anyhow::bail!("secure = true requires public_cert and private_key");
        };
        WsConnectionManager::new(db.clone()).with_tls(cert, key)?
    } else {
        WsConnectionManager::new(db.clone())
    };

    tracing::info!("confdb server listening on {}", addr);

    tokio::select! {
        r = server.serve(addr) => {
            if let Err(e) = r {
                tracing::error!("server exited with error: {e}");
                db.destroy().await;
                std::process::exit(EXIT_PORT_IN_USE);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("ctrl-c received, shutting down");
        }
    }

    db.destroy().await;
    Ok(())
}
