//! Worksheets: schema-driven, versioned, reference-linked documents.
//!
//! A worksheet type is declared in a small DSL with typed fields, computed
//! fields (`computed_by`), and constrained fields (`constrained_by`):
//!
//! ```text
//! worksheet person {
//!     1:first_name text
//!     2:last_name  text
//!     3:age        number[0] constrained_by { return age >= 0 }
//!     4:bio        text      computed_by    { return first_name + " " + last_name }
//! }
//! ```
//!
//! Instances carry a UUID identity and a version, reference each other
//! (including cycles and shared children), and recompute derived fields as
//! their arguments change, across worksheet boundaries. A [`Session`]
//! persists whole graphs through a bitemporal value-interval log with
//! optimistic concurrency; historical versions stay readable.
//!
//! ```no_run
//! use worksheets::{Definitions, MemStore, Store, Value};
//!
//! # async fn demo() -> Result<(), worksheets::WorksheetError> {
//! let defs = Definitions::new("worksheet simple {83:name text 91:age number[0]}")?;
//! let ws = defs.new_worksheet("simple")?;
//! ws.set("name", Value::text("Alice"))?;
//!
//! let store = Store::new(defs);
//! let mut session = store.open(MemStore::new());
//! session.save(&ws).await?;
//! # Ok(())
//! # }
//! ```

mod ast;
mod definitions;
mod diff;
mod error;
mod eval;
mod json;
mod lexer;
mod mapper;
mod number;
mod parser;
mod store;
mod types;
mod value;
mod worksheet;

pub use ast::{BinaryOp, Expr, Lit, Round, Selector, UnaryOp};
pub use definitions::{ComputedBy, Definitions, Options};
pub use error::{
    ConstraintViolation, EvalError, ParseError, SchemaError, StorageError, TypeError, UsageError,
    WorksheetError,
};
pub use json::marshal;
pub use mapper::{struct_scan, FromWorksheet, StructScanner, ToWorksheet};
pub use number::{Number, RoundingMode, MAX_SCALE};
pub use store::{
    ensure_schema, MemStore, PgRowStore, RowStore, Session, Store, ValueRow, WorksheetRow,
    MAX_VERSION, SCHEMA,
};
pub use types::{Definition, EnumType, Field, Type, INDEX_ID, INDEX_VERSION};
pub use value::{PinnedRef, Slice, SliceElement, Value};
pub use worksheet::Worksheet;
