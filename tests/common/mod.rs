//! Shared fixtures for the integration suites.

use uuid::Uuid;
use worksheets::{Definitions, MemStore, ValueRow};

pub fn defs() -> Definitions {
    Definitions::new(
        "worksheet simple {83:name text 91:age number[0]} \
         worksheet with_refs {87:simple simple}",
    )
    .unwrap()
}

pub fn vrow(ws: Uuid, index: i32, from: i32, to: i32, value: &str) -> ValueRow {
    ValueRow {
        worksheet_id: ws,
        index,
        from_version: from,
        to_version: to,
        value: value.to_string(),
    }
}

pub fn id_literal(id: Uuid) -> String {
    format!("\"{}\"", id)
}

pub fn rows_for(mem: &MemStore, ws: Uuid) -> Vec<ValueRow> {
    mem.value_rows().into_iter().filter(|r| r.worksheet_id == ws).collect()
}
