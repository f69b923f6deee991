//! Reference graphs: parent-ref consistency, propagation across worksheet
//! boundaries, and persistence of referenced worksheets.

mod common;

use common::{defs, id_literal, rows_for, vrow};
use worksheets::{
    Definitions, MemStore, Store, Value, WorksheetRow, INDEX_ID, INDEX_VERSION, MAX_VERSION,
};

#[test]
fn parent_refs_follow_reference_writes() -> anyhow::Result<()> {
    let d = defs();
    let parent = d.new_worksheet("with_refs")?;
    let child = d.new_worksheet("simple")?;
    let other = d.new_worksheet("simple")?;

    assert!(!parent.is_set("simple")?);
    parent.set("simple", Value::Ws(child.clone()))?;
    assert!(child.has_parent(&parent, 87));

    parent.set("simple", Value::Ws(other.clone()))?;
    assert!(!child.has_parent(&parent, 87));
    assert!(other.has_parent(&parent, 87));

    parent.unset("simple")?;
    assert!(!other.has_parent(&parent, 87));
    Ok(())
}

#[test]
fn parent_refs_through_slices() -> anyhow::Result<()> {
    let d = Definitions::new(
        "worksheet simple {83:name text} worksheet holder {1:items []simple}",
    )?;
    let holder = d.new_worksheet("holder")?;
    let a = d.new_worksheet("simple")?;
    let b = d.new_worksheet("simple")?;

    holder.append("items", Value::Ws(a.clone()))?;
    holder.append("items", Value::Ws(b.clone()))?;
    assert!(a.has_parent(&holder, 1));
    assert!(b.has_parent(&holder, 1));

    holder.del("items", 0)?;
    assert!(!a.has_parent(&holder, 1));
    assert!(b.has_parent(&holder, 1));
    Ok(())
}

#[test]
fn cross_worksheet_propagation() -> anyhow::Result<()> {
    let d = Definitions::new(
        "worksheet child {1:amount number[0]} \
         worksheet parent {1:child child 2:total number[0] computed_by { return child.amount * 2 }}",
    )?;
    let parent = d.new_worksheet("parent")?;
    let child = d.new_worksheet("child")?;
    parent.set("child", Value::Ws(child.clone()))?;

    child.set("amount", Value::int(21))?;
    assert_eq!(parent.get("total")?, Value::int(42));

    child.set("amount", Value::int(5))?;
    assert_eq!(parent.get("total")?, Value::int(10));
    Ok(())
}

#[test]
fn propagation_across_slices_of_references() -> anyhow::Result<()> {
    let d = Definitions::new(
        "worksheet item {1:price number[2]} \
         worksheet cart {1:items []item 2:total number[2] computed_by { return sum(items.price) }}",
    )?;
    let cart = d.new_worksheet("cart")?;
    let x = d.new_worksheet("item")?;
    let y = d.new_worksheet("item")?;
    x.set("price", Value::number(150, 2))?;
    y.set("price", Value::number(250, 2))?;

    cart.append("items", Value::Ws(x.clone()))?;
    cart.append("items", Value::Ws(y.clone()))?;
    assert_eq!(cart.get("total")?, Value::number(400, 2));

    // mutating a child recomputes through the parent index
    x.set("price", Value::number(350, 2))?;
    assert_eq!(cart.get("total")?, Value::number(600, 2));

    cart.del("items", 1)?;
    assert_eq!(cart.get("total")?, Value::number(350, 2));
    Ok(())
}

#[tokio::test]
async fn save_ref_without_data_in_child() -> anyhow::Result<()> {
    let store = Store::new(defs());
    let ws = store.defs().new_worksheet("with_refs")?;
    let simple = store.defs().new_worksheet("simple")?;
    ws.set("simple", Value::Ws(simple.clone()))?;

    let mut mem = MemStore::new();
    {
        let mut session = store.open(&mut mem);
        session.save(&ws).await?;
    }

    let mut expected = vec![
        WorksheetRow { id: ws.id(), version: 1, name: "with_refs".to_string() },
        WorksheetRow { id: simple.id(), version: 1, name: "simple".to_string() },
    ];
    expected.sort_by_key(|r| r.id);
    assert_eq!(mem.worksheet_rows(), expected);

    assert_eq!(
        rows_for(&mem, ws.id()),
        vec![
            vrow(ws.id(), INDEX_ID, 1, MAX_VERSION, &id_literal(ws.id())),
            vrow(ws.id(), INDEX_VERSION, 1, MAX_VERSION, "1"),
            vrow(ws.id(), 87, 1, MAX_VERSION, &format!("*:{}", simple.id())),
        ]
    );
    // no row for simple.name because it is undefined
    assert_eq!(
        rows_for(&mem, simple.id()),
        vec![
            vrow(simple.id(), INDEX_ID, 1, MAX_VERSION, &id_literal(simple.id())),
            vrow(simple.id(), INDEX_VERSION, 1, MAX_VERSION, "1"),
        ]
    );
    assert!(ws.diff().is_empty());
    Ok(())
}

#[tokio::test]
async fn save_ref_with_data_in_child() -> anyhow::Result<()> {
    let store = Store::new(defs());
    let ws = store.defs().new_worksheet("with_refs")?;
    let simple = store.defs().new_worksheet("simple")?;
    ws.set("simple", Value::Ws(simple.clone()))?;
    simple.set("name", Value::text("Alice"))?;
    simple.set("age", Value::parse("120")?)?;

    let mut mem = MemStore::new();
    {
        let mut session = store.open(&mut mem);
        session.save(&ws).await?;
    }

    assert_eq!(
        rows_for(&mem, simple.id()),
        vec![
            vrow(simple.id(), INDEX_ID, 1, MAX_VERSION, &id_literal(simple.id())),
            vrow(simple.id(), INDEX_VERSION, 1, MAX_VERSION, "1"),
            vrow(simple.id(), 83, 1, MAX_VERSION, "\"Alice\""),
            vrow(simple.id(), 91, 1, MAX_VERSION, "120"),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn already_saved_child_is_not_reinserted() -> anyhow::Result<()> {
    let store = Store::new(defs());
    let ws = store.defs().new_worksheet("with_refs")?;
    let simple = store.defs().new_worksheet("simple")?;
    ws.set("simple", Value::Ws(simple.clone()))?;

    let mut mem = MemStore::new();
    {
        let mut session = store.open(&mut mem);
        session.save(&simple).await?;
    }
    {
        let mut session = store.open(&mut mem);
        session.save(&ws).await?;
    }

    // one row each; simple kept version 1
    let mut expected = vec![
        WorksheetRow { id: ws.id(), version: 1, name: "with_refs".to_string() },
        WorksheetRow { id: simple.id(), version: 1, name: "simple".to_string() },
    ];
    expected.sort_by_key(|r| r.id);
    assert_eq!(mem.worksheet_rows(), expected);
    assert_eq!(
        rows_for(&mem, ws.id())[2],
        vrow(ws.id(), 87, 1, MAX_VERSION, &format!("*:{}", simple.id()))
    );
    assert!(ws.diff().is_empty());
    Ok(())
}

#[tokio::test]
async fn saving_a_parent_cascades_child_updates() -> anyhow::Result<()> {
    let store = Store::new(defs());
    let ws = store.defs().new_worksheet("with_refs")?;
    let simple = store.defs().new_worksheet("simple")?;
    ws.set("simple", Value::Ws(simple.clone()))?;
    simple.set("name", Value::text("Bob"))?;

    let mut mem = MemStore::new();
    {
        let mut session = store.open(&mut mem);
        session.save(&simple).await?;
    }
    simple.set("name", Value::text("Carol"))?;
    {
        let mut session = store.open(&mut mem);
        session.save(&ws).await?;
    }

    let mut expected = vec![
        WorksheetRow { id: ws.id(), version: 1, name: "with_refs".to_string() },
        WorksheetRow { id: simple.id(), version: 2, name: "simple".to_string() },
    ];
    expected.sort_by_key(|r| r.id);
    assert_eq!(mem.worksheet_rows(), expected);

    assert_eq!(
        rows_for(&mem, simple.id()),
        vec![
            vrow(simple.id(), INDEX_ID, 1, MAX_VERSION, &id_literal(simple.id())),
            vrow(simple.id(), INDEX_VERSION, 1, 1, "1"),
            vrow(simple.id(), INDEX_VERSION, 2, MAX_VERSION, "2"),
            vrow(simple.id(), 83, 1, 1, "\"Bob\""),
            vrow(simple.id(), 83, 2, MAX_VERSION, "\"Carol\""),
        ]
    );
    assert!(ws.diff().is_empty());
    assert!(simple.diff().is_empty());
    Ok(())
}

#[tokio::test]
async fn load_resolves_references_to_live_worksheets() -> anyhow::Result<()> {
    let store = Store::new(defs());
    let ws = store.defs().new_worksheet("with_refs")?;
    let simple = store.defs().new_worksheet("simple")?;
    ws.set("simple", Value::Ws(simple.clone()))?;
    simple.set("name", Value::text("Alice"))?;

    let mut mem = MemStore::new();
    {
        let mut session = store.open(&mut mem);
        session.save(&ws).await?;
    }

    let mut session = store.open(&mut mem);
    let loaded = session.load("with_refs", ws.id()).await?;
    let child = loaded.get("simple")?.as_worksheet()?;
    assert_eq!(child.id(), simple.id());
    assert_eq!(child.get("name")?, Value::text("Alice"));

    // the identity map collapses a direct load of the child too
    let direct = session.load("simple", simple.id()).await?;
    assert!(child.same_as(&direct));
    Ok(())
}

#[tokio::test]
async fn cyclic_graph_round_trips_to_shared_instances() -> anyhow::Result<()> {
    let cyc = Definitions::new("worksheet a {1:to_b b} worksheet b {1:to_a a}")?;
    let store = Store::new(cyc);
    let a = store.defs().new_worksheet("a")?;
    let b = store.defs().new_worksheet("b")?;
    a.set("to_b", Value::Ws(b.clone()))?;
    b.set("to_a", Value::Ws(a.clone()))?;

    let mut mem = MemStore::new();
    {
        let mut session = store.open(&mut mem);
        session.save(&a).await?;
    }
    assert_eq!(mem.worksheet_rows().len(), 2);

    let mut session = store.open(&mut mem);
    let loaded_a = session.load("a", a.id()).await?;
    let loaded_b = loaded_a.get("to_b")?.as_worksheet()?;
    let back = loaded_b.get("to_a")?.as_worksheet()?;
    assert!(back.same_as(&loaded_a));
    Ok(())
}
