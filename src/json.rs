//! Flattened JSON rendering of a worksheet graph.
//!
//! The result is one object keyed by worksheet id; each worksheet's fields
//! serialize by name. Numbers render as JSON strings to preserve scale and
//! avoid binary rounding; references render as the referenced id, with the
//! child included at top level exactly once, so even cyclic graphs render
//! finitely.

use serde_json::{Map, Value as Json};

use crate::value::Value;
use crate::worksheet::Worksheet;

/// Renders `ws` and every worksheet it references.
pub fn marshal(ws: &Worksheet) -> Json {
    let mut graph = Map::new();
    marshal_into(ws, &mut graph);
    Json::Object(graph)
}

fn marshal_into(ws: &Worksheet, graph: &mut Map<String, Json>) {
    let key = ws.id().to_string();
    if graph.contains_key(&key) {
        return;
    }
    // placeholder first so cycles terminate
    graph.insert(key.clone(), Json::Null);

    let def = ws.def();
    let mut fields = Map::new();
    for (index, value) in ws.data_snapshot() {
        if let Some(field) = def.field_by_index(index) {
            fields.insert(field.name.clone(), value_json(&value, graph));
        }
    }
    graph.insert(key, Json::Object(fields));
}

fn value_json(value: &Value, graph: &mut Map<String, Json>) -> Json {
    match value {
        Value::Undefined => Json::Null,
        Value::Text(s) => Json::String(s.clone()),
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => Json::String(n.to_string()),
        Value::Slice(s) => {
            Json::Array(s.elements().iter().map(|e| value_json(&e.value, graph)).collect())
        }
        Value::Ws(child) => {
            marshal_into(child, graph);
            Json::String(child.id().to_string())
        }
        Value::WsRef(r) => {
            marshal_into(r.worksheet(), graph);
            Json::String(r.worksheet().id().to_string())
        }
    }
}
