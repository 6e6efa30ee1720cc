//! Pattern subscriptions and change fan-out.
//!
//! Each connection owns an ordered subscription list per realm; one more
//! list serves the hosting process itself. A change is delivered to each
//! connection at most once, through the first subscription that matches
//! (insertion order). The connection list is snapshotted before fan-out so
//! connects and disconnects during a publish cannot skew delivery.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::glob::glob_to_regex;
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Realm {
    Objects,
    Files,
}

impl Realm {
    pub fn as_str(self) -> &'static str {
        match self {
            Realm::Objects => "objects",
            Realm::Files => "files",
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Realm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "objects" => Ok(Realm::Objects),
            "files" => Ok(Realm::Files),
            _ => Err(StoreError::InvalidParameter),
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub pattern: String,
    pub regex: Regex,
    pub options: Value,
}

/// Ordered subscription lists of one connection (or of the process).
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    objects: Vec<Subscription>,
    files: Vec<Subscription>,
}

impl SubscriptionTable {
    fn list(&self, realm: Realm) -> &Vec<Subscription> {
        match realm {
            Realm::Objects => &self.objects,
            Realm::Files => &self.files,
        }
    }

    fn list_mut(&mut self, realm: Realm) -> &mut Vec<Subscription> {
        match realm {
            Realm::Objects => &mut self.objects,
            Realm::Files => &mut self.files,
        }
    }

    /// Append `pattern` unless it is already subscribed.
    pub fn subscribe(&mut self, realm: Realm, pattern: &str, options: Value) {
        let list = self.list_mut(realm);
        if list.iter().any(|s| s.pattern == pattern) {
            return;
        }
        list.push(Subscription {
            pattern: pattern.to_string(),
            regex: glob_to_regex(pattern),
            options,
        });
    }

    /// Remove the first entry with this pattern.
    pub fn unsubscribe(&mut self, realm: Realm, pattern: &str) {
        let list = self.list_mut(realm);
        if let Some(pos) = list.iter().position(|s| s.pattern == pattern) {
            list.remove(pos);
        }
    }

    /// First subscription matching `id`, in insertion order.
    pub fn first_match(&self, realm: Realm, id: &str) -> Option<&Subscription> {
        self.list(realm).iter().find(|s| s.regex.is_match(id))
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.files.is_empty()
    }
}

/// One change notification as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub realm: Realm,
    pub pattern: String,
    pub id: String,
    /// `None` signals deletion.
    pub obj: Option<Value>,
}

pub type ConnId = u64;

struct ConnEntry {
    tx: mpsc::UnboundedSender<ChangeEvent>,
    subs: SubscriptionTable,
}

/// Routes changes to connection subscribers and the process-local sink.
pub struct Dispatcher {
    connections: RwLock<HashMap<ConnId, ConnEntry>>,
    local: RwLock<SubscriptionTable>,
    sink: Option<mpsc::UnboundedSender<ChangeEvent>>,
}

impl Dispatcher {
    pub fn new(sink: Option<mpsc::UnboundedSender<ChangeEvent>>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            local: RwLock::new(SubscriptionTable::default()),
            sink,
        }
    }

    pub fn register(&self, conn: ConnId, tx: mpsc::UnboundedSender<ChangeEvent>) {
        self.connections.write().expect("conn lock").insert(
            conn,
            ConnEntry {
                tx,
                subs: SubscriptionTable::default(),
            },
        );
    }

    /// Drops the connection's subscription table along with the connection.
    pub fn unregister(&self, conn: ConnId) {
        self.connections.write().expect("conn lock").remove(&conn);
    }

    pub fn subscribe(&self, conn: ConnId, realm: Realm, pattern: &str, options: Value) {
        if let Some(entry) = self.connections.write().expect("conn lock").get_mut(&conn) {
            entry.subs.subscribe(realm, pattern, options);
        }
    }

    pub fn unsubscribe(&self, conn: ConnId, realm: Realm, pattern: &str) {
        if let Some(entry) = self.connections.write().expect("conn lock").get_mut(&conn) {
            entry.subs.unsubscribe(realm, pattern);
        }
    }

    pub fn subscribe_local(&self, realm: Realm, pattern: &str) {
        self.local
            .write()
            .expect("local subs lock")
            .subscribe(realm, pattern, Value::Null);
    }

    pub fn unsubscribe_local(&self, realm: Realm, pattern: &str) {
        self.local
            .write()
            .expect("local subs lock")
            .unsubscribe(realm, pattern);
    }

    /// Fan a change out: one event per connection through its first
    /// matching subscription, plus one to the local sink if any local
    /// pattern matches.
    pub fn publish_all(&self, realm: Realm, id: &str, obj: Option<&Value>) {
        let targets: Vec<(mpsc::UnboundedSender<ChangeEvent>, String)> = {
            let connections = self.connections.read().expect("conn lock");
            connections
                .values()
                .filter_map(|entry| {
                    entry
                        .subs
                        .first_match(realm, id)
                        .map(|s| (entry.tx.clone(), s.pattern.clone()))
                })
                .collect()
        };

        for (tx, pattern) in targets {
            let event = ChangeEvent {
                realm,
                pattern,
                id: id.to_string(),
                obj: obj.cloned(),
            };
            // A closed receiver just means the connection is going away.
            let _ = tx.send(event);
        }

        if let Some(sink) = &self.sink {
            let local = self.local.read().expect("local subs lock");
            if let Some(sub) = local.first_match(realm, id) {
                let _ = sink.send(ChangeEvent {
                    realm,
                    pattern: sub.pattern.clone(),
                    id: id.to_string(),
                    obj: obj.cloned(),
                });
            }
        }
    }
}
