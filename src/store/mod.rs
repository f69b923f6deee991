//! The bitemporal worksheet store.
//!
//! A `Store` pairs definitions with a storage backend; a `Session` is one
//! transaction's view of it. Saving walks the reachable graph and inserts
//! worksheets the store has never seen while updating the ones whose diff
//! is nonempty; updating bumps the version, closes the superseded value
//! intervals, and opens new ones. The `worksheets.version` column is the
//! optimistic-concurrency token: a mismatch aborts with a conflict.

mod codec;
mod mem;
mod pg;
mod row;

pub use mem::MemStore;
pub use pg::{ensure_schema, PgRowStore, SCHEMA};
pub use row::{RowStore, ValueRow, WorksheetRow, MAX_VERSION};

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::definitions::Definitions;
use crate::error::{SchemaError, StorageError, WorksheetError};
use crate::types::Type;
use crate::value::{PinnedRef, Slice, Value};
use crate::worksheet::Worksheet;

use codec::Loaded;

/// Definitions plus a place to put them.
pub struct Store {
    defs: Definitions,
}

impl Store {
    pub fn new(defs: Definitions) -> Store {
        Store { defs }
    }

    pub fn defs(&self) -> &Definitions {
        &self.defs
    }

    /// Opens a session over a transaction-scoped backend. All operations
    /// commit or abort with the host transaction.
    pub fn open<R: RowStore>(&self, tx: R) -> Session<R> {
        Session { defs: self.defs.clone(), tx, loaded: HashMap::new() }
    }
}

/// One transaction's worth of store operations, with a session-scoped
/// identity map so graphs with shared references and cycles stay finite.
pub struct Session<R: RowStore> {
    defs: Definitions,
    tx: R,
    loaded: HashMap<Uuid, Worksheet>,
}

impl<R: RowStore> Session<R> {
    /// Persists every worksheet reachable from `root`: unknown worksheets
    /// are inserted, known-and-changed worksheets are updated.
    pub async fn save(&mut self, root: &Worksheet) -> Result<(), WorksheetError> {
        self.persist(root).await
    }

    /// Like [`Session::save`], but requires `root` to be known already.
    pub async fn update(&mut self, root: &Worksheet) -> Result<(), WorksheetError> {
        if root.orig_is_empty() {
            return Err(StorageError::NotFound { id: root.id() }.into());
        }
        self.persist(root).await
    }

    async fn persist(&mut self, root: &Worksheet) -> Result<(), WorksheetError> {
        let graph = reachable(root);
        let mut written = Vec::new();
        for ws in &graph {
            if ws.orig_is_empty() {
                let id = ws.id();
                if self.tx.find_worksheet(id).await?.is_some() {
                    debug!(%id, "worksheet already present, skipping insert");
                    continue;
                }
                self.insert_worksheet(ws).await?;
                written.push(ws.clone());
            } else if !ws.diff().is_empty() {
                self.update_worksheet(ws).await?;
                written.push(ws.clone());
            }
        }
        // orig moves only once every write of the batch has gone through
        for ws in written {
            ws.mark_saved();
        }
        Ok(())
    }

    async fn insert_worksheet(&mut self, ws: &Worksheet) -> Result<(), WorksheetError> {
        let id = ws.id();
        let version = ws.version();
        debug!(%id, name = %ws.name(), version, "inserting worksheet");

        self.tx
            .insert_worksheet(&WorksheetRow { id, version, name: ws.name() })
            .await?;
        for (index, value) in ws.data_snapshot() {
            self.tx
                .insert_value(&ValueRow {
                    worksheet_id: id,
                    index,
                    from_version: version,
                    to_version: MAX_VERSION,
                    value: codec::encode(&value),
                })
                .await?;
        }
        self.loaded.insert(id, ws.clone());
        Ok(())
    }

    async fn update_worksheet(&mut self, ws: &Worksheet) -> Result<(), WorksheetError> {
        let id = ws.id();
        let old_version = ws.version();

        let row = self
            .tx
            .find_worksheet(id)
            .await?
            .ok_or(StorageError::NotFound { id })?;
        if row.version != old_version {
            warn!(%id, memory = old_version, store = row.version, "optimistic version conflict");
            return Err(StorageError::Conflict {
                id,
                expected: old_version,
                found: row.version,
            }
            .into());
        }

        let new_version = old_version + 1;
        debug!(%id, name = %ws.name(), old_version, new_version, "updating worksheet");
        ws.set_version_raw(new_version);
        let result = self.write_update(ws, id, old_version, new_version).await;
        if result.is_err() {
            ws.set_version_raw(old_version);
        }
        result
    }

    async fn write_update(
        &mut self,
        ws: &Worksheet,
        id: Uuid,
        old_version: i32,
        new_version: i32,
    ) -> Result<(), WorksheetError> {
        for (index, value) in ws.diff() {
            self.tx.close_interval(id, index, old_version).await?;
            if !value.is_undefined() {
                self.tx
                    .insert_value(&ValueRow {
                        worksheet_id: id,
                        index,
                        from_version: new_version,
                        to_version: MAX_VERSION,
                        value: codec::encode(&value),
                    })
                    .await?;
            }
        }
        if !self.tx.bump_version(id, old_version, new_version).await? {
            let found = self
                .tx
                .find_worksheet(id)
                .await?
                .map(|r| r.version)
                .unwrap_or(0);
            return Err(StorageError::Conflict { id, expected: old_version, found }.into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Loads the worksheet `name(id)` at its current version, together with
    /// everything it references. Shared references resolve to shared
    /// instances through the session's identity map.
    pub async fn load(&mut self, name: &str, id: Uuid) -> Result<Worksheet, WorksheetError> {
        let ws = self.load_graph(id, None).await?;
        if ws.name() != name {
            return Err(StorageError::NotFound { id }.into());
        }
        Ok(ws)
    }

    /// Historical read: loads `name(id)` as of `version`. Referenced
    /// worksheets come back pinned (`Value::WsRef`) and are excluded from
    /// cascading saves.
    pub async fn load_at_version(
        &mut self,
        name: &str,
        id: Uuid,
        version: i32,
    ) -> Result<Worksheet, WorksheetError> {
        let ws = self.load_graph(id, Some(version)).await?;
        if ws.name() != name {
            return Err(StorageError::NotFound { id }.into());
        }
        Ok(ws)
    }

    async fn load_graph(
        &mut self,
        root_id: Uuid,
        at_version: Option<i32>,
    ) -> Result<Worksheet, WorksheetError> {
        let pinned = at_version.is_some();
        if !pinned {
            if let Some(ws) = self.loaded.get(&root_id) {
                return Ok(ws.clone());
            }
        }

        // phase 1: materialize every reachable worksheet's rows
        let mut fresh: HashMap<Uuid, Worksheet> = HashMap::new();
        let mut versions: HashMap<Uuid, i32> = HashMap::new();
        let mut mats: Vec<(Worksheet, Vec<(i32, Loaded)>)> = Vec::new();
        let mut queue: VecDeque<Uuid> = VecDeque::from([root_id]);

        while let Some(id) = queue.pop_front() {
            if fresh.contains_key(&id) || (!pinned && self.loaded.contains_key(&id)) {
                continue;
            }
            let row = self
                .tx
                .find_worksheet(id)
                .await?
                .ok_or(StorageError::NotFound { id })?;
            // children of a historical root still load at their own
            // current version; the pin is recorded on the reference
            let version = if id == root_id { at_version.unwrap_or(row.version) } else { row.version };
            let def = self
                .defs
                .def(&row.name)
                .ok_or(SchemaError::UnknownWorksheet { name: row.name.clone() })?;
            debug!(%id, name = %row.name, version, "loading worksheet");

            let ws = Worksheet::uninitialized(def);
            let mut fields = Vec::new();
            for value_row in self.tx.values_at(id, version).await? {
                let loaded = codec::decode(&value_row.value)?;
                let mut refs = Vec::new();
                loaded.collect_refs(&mut refs);
                queue.extend(refs);
                fields.push((value_row.index, loaded));
            }
            fresh.insert(id, ws.clone());
            versions.insert(id, version);
            mats.push((ws, fields));
        }

        // phase 2: resolve references through the identity maps and wire
        // values in; parents rebuild as a side effect
        for (ws, fields) in &mats {
            let def = ws.def();
            for (index, loaded) in fields {
                let field = def
                    .field_by_index(*index)
                    .ok_or(StorageError::UnknownFieldIndex { id: root_id, index: *index })?;
                let value = self.realize(loaded, &field.typ, pinned, &fresh, &versions)?;
                ws.load_insert(*index, value)?;
            }
            if !ws.has_id() {
                return Err(StorageError::NotFound { id: root_id }.into());
            }
            ws.mark_saved();
        }

        let root = fresh
            .get(&root_id)
            .cloned()
            .or_else(|| self.loaded.get(&root_id).cloned())
            .expect("root was materialized or already loaded");
        if !pinned {
            self.loaded.extend(fresh);
        }
        Ok(root)
    }

    fn realize(
        &self,
        loaded: &Loaded,
        typ: &Type,
        pinned: bool,
        fresh: &HashMap<Uuid, Worksheet>,
        versions: &HashMap<Uuid, i32>,
    ) -> Result<Value, WorksheetError> {
        match loaded {
            Loaded::Value(v) => Ok(v.clone()),
            Loaded::Ref(id) => {
                let child = fresh
                    .get(id)
                    .or_else(|| if pinned { None } else { self.loaded.get(id) })
                    .cloned()
                    .ok_or(StorageError::NotFound { id: *id })?;
                if pinned {
                    let version = versions.get(id).copied().unwrap_or_else(|| child.version());
                    Ok(Value::WsRef(PinnedRef { ws: child, version }))
                } else {
                    Ok(Value::Ws(child))
                }
            }
            Loaded::Slice(elems) => {
                let elem_type = match typ {
                    Type::Slice(elem) => (**elem).clone(),
                    _ => Type::Undefined,
                };
                let mut slice = Slice::new(elem_type.clone());
                for (rank, elem) in elems {
                    let value = self.realize(elem, &elem_type, pinned, fresh, versions)?;
                    slice.push_ranked(*rank, value);
                }
                Ok(Value::Slice(slice))
            }
        }
    }
}

/// Every worksheet reachable from `root` through live references, in
/// depth-first pre-order. Pinned references do not cascade.
fn reachable(root: &Worksheet) -> Vec<Worksheet> {
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(ws) = stack.pop() {
        if !seen.insert(ws.id()) {
            continue;
        }
        let mut children = Vec::new();
        for value in ws.data_snapshot().values() {
            live_children(value, &mut children);
        }
        for child in children {
            if !seen.contains(&child.id()) {
                stack.push(child);
            }
        }
        out.push(ws);
    }
    out
}

fn live_children(value: &Value, out: &mut Vec<Worksheet>) {
    match value {
        Value::Ws(ws) => out.push(ws.clone()),
        Value::Slice(s) => {
            for elem in s.elements() {
                live_children(&elem.value, out);
            }
        }
        _ => {}
    }
}
