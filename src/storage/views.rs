//! Map/reduce views over the object range.
//!
//! View definitions live in `_design/<name>` objects under `views.<search>`
//! as `{map, reduce?}`. Map bodies are written in the historical
//! `function (doc) { if (doc.type === '...') emit(doc._id, doc); }` idiom,
//! but are never executed as code: the body is parsed into a restricted map
//! program (equality guards on document fields plus one `emit` with
//! field-path expressions). Anything the grammar cannot express fails the
//! parse, and a map program has no way to reach back into the store.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::storage::objects::{ObjectDb, ObjectListParams};
use crate::storage::StoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct ViewFunction {
    pub map: String,
    #[serde(default)]
    pub reduce: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ViewRow {
    pub id: Value,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ViewResult {
    pub rows: Vec<ViewRow>,
}

/// One field access or the whole document.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Doc,
    Field(String),
}

impl Expr {
    fn parse(src: &str) -> Option<Self> {
        let src = src.trim();
        if src == "doc" {
            return Some(Expr::Doc);
        }
        let path = src.strip_prefix("doc.")?;
        if path.is_empty() || !path.chars().all(|c| c.is_alphanumeric() || c == '.' || c == '_') {
            return None;
        }
        Some(Expr::Field(path.replace('.', "/")))
    }

    fn eval<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        match self {
            Expr::Doc => Some(doc),
            Expr::Field(path) => doc.pointer(&format!("/{path}")),
        }
    }
}

/// Parsed restricted form of a map body.
#[derive(Debug, Clone)]
pub struct MapProgram {
    guards: Vec<(String, Value)>,
    key: Expr,
    value: Expr,
}

impl MapProgram {
    /// Parse a map body. Returns `None` when the body falls outside the
    /// supported grammar.
    pub fn parse(source: &str) -> Option<Self> {
        let guard_re =
            Regex::new(r#"doc((?:\.\w+)+)\s*[!=]?==?\s*['"]([^'"]*)['"]"#).expect("static regex");
        let emit_re = Regex::new(r"emit\(\s*([^,]+)\s*,\s*([^)]+?)\s*\)").expect("static regex");

        let emit = emit_re.captures(source)?;
        let key = Expr::parse(&emit[1])?;
        let value = Expr::parse(&emit[2])?;

        let mut guards = Vec::new();
        for cap in guard_re.captures_iter(source) {
            // Only equality guards are supported; a negated comparison is
            // outside the grammar.
            if cap.get(0).map(|m| m.as_str().contains("!=")).unwrap_or(false) {
                return None;
            }
            let path = cap[1].trim_start_matches('.').replace('.', "/");
            guards.push((path, Value::String(cap[2].to_string())));
        }

        Some(Self { guards, key, value })
    }

    /// Run against one document; `None` when a guard misses or an
    /// expression does not resolve.
    fn run(&self, doc: &Value) -> Option<ViewRow> {
        for (path, expected) in &self.guards {
            if doc.pointer(&format!("/{path}")) != Some(expected) {
                return None;
            }
        }
        Some(ViewRow {
            id: self.key.eval(doc)?.clone(),
            value: self.value.eval(doc)?.clone(),
        })
    }
}

/// Apply `func` over the objects in `[startkey, endkey]`.
pub async fn apply_view(
    db: &ObjectDb,
    func: &ViewFunction,
    params: &ObjectListParams,
) -> Result<ViewResult, StoreError> {
    let Some(program) = MapProgram::parse(&func.map) else {
        tracing::warn!(map = %func.map, "map body outside the supported grammar");
        return Ok(ViewResult::default());
    };

    let docs = db
        .scan_range(params.startkey.as_deref(), params.endkey.as_deref())
        .await;

    let mut rows = Vec::new();
    for (id, doc) in docs {
        match program.run(&doc) {
            Some(row) => rows.push(row),
            None => {
                tracing::trace!(%id, "document skipped by view map");
            }
        }
    }

    if func.reduce.as_deref() == Some("_stats") {
        return Ok(reduce_stats(rows));
    }
    Ok(ViewResult { rows })
}

/// Look up `_design/<design>.views[<search>]` and apply it.
pub async fn get_object_view(
    db: &ObjectDb,
    subject: &crate::acl::Subject,
    design: &str,
    search: &str,
    params: &ObjectListParams,
) -> Result<ViewResult, StoreError> {
    let not_found = || StoreError::ViewNotFound {
        design: design.to_string(),
        search: search.to_string(),
    };

    let design_doc = db
        .get_object(&format!("_design/{design}"), subject)
        .await?
        .ok_or_else(not_found)?;
    let func = design_doc
        .pointer(&format!("/views/{search}"))
        .cloned()
        .ok_or_else(not_found)?;
    let func: ViewFunction = serde_json::from_value(func).map_err(|_| not_found())?;

    apply_view(db, &func, params).await
}

/// `_stats` keeps the greatest emitted numeric value. Empty input reduces
/// to no rows at all.
fn reduce_stats(rows: Vec<ViewRow>) -> ViewResult {
    let max = rows
        .iter()
        .filter_map(|r| r.value.as_f64())
        .fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        });
    match max {
        Some(max) => ViewResult {
            rows: vec![ViewRow {
                id: json!("_stats"),
                value: json!({ "max": max }),
            }],
        },
        None => ViewResult::default(),
    }
}
