//! Mapping worksheets onto host structs.
//!
//! There is no reflection here: a target type implements [`FromWorksheet`]
//! and pulls its fields out of the worksheet explicitly. The scanner keeps
//! an identity map keyed by worksheet id, so shared references and cycles
//! map to shared `Rc<RefCell<_>>` instances, mirroring how the in-memory
//! graph shares worksheets.
//!
//! Scalar conversions live on [`Value`](crate::Value): numbers convert to
//! integers only at scale zero and in range, text to `String`, booleans to
//! `bool`; slices convert element-wise.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use uuid::Uuid;

use crate::error::{TypeError, WorksheetError};
use crate::worksheet::Worksheet;

/// A host type a worksheet can be scanned into.
pub trait FromWorksheet: Default + 'static {
    /// Populates `self` from `ws`. Use the scanner to resolve referenced
    /// worksheets so shared children stay shared.
    fn fill(&mut self, ws: &Worksheet, scanner: &mut StructScanner) -> Result<(), WorksheetError>;
}

/// Scans worksheets into host structs, reusing destinations per worksheet
/// id.
#[derive(Default)]
pub struct StructScanner {
    seen: HashMap<Uuid, Rc<dyn Any>>,
}

impl StructScanner {
    pub fn new() -> StructScanner {
        StructScanner::default()
    }

    /// Converts `ws` into `T`, returning the shared instance if this
    /// worksheet was scanned before. The destination registers before
    /// `fill` runs, so cyclic graphs terminate.
    pub fn scan<T: FromWorksheet>(
        &mut self,
        ws: &Worksheet,
    ) -> Result<Rc<RefCell<T>>, WorksheetError> {
        let id = ws.id();
        if let Some(existing) = self.seen.get(&id) {
            return existing.clone().downcast::<RefCell<T>>().map_err(|_| {
                TypeError::CannotConvert {
                    from: ws.name(),
                    to: std::any::type_name::<T>().to_string(),
                }
                .into()
            });
        }
        let cell = Rc::new(RefCell::new(T::default()));
        self.seen.insert(id, cell.clone());
        cell.borrow_mut().fill(ws, self)?;
        Ok(cell)
    }
}

/// One-shot scan with a fresh scanner.
pub fn struct_scan<T: FromWorksheet>(ws: &Worksheet) -> Result<Rc<RefCell<T>>, WorksheetError> {
    StructScanner::new().scan(ws)
}

/// The write-back direction: a host value copies itself into a worksheet
/// through the ordinary typed setters, so constraints and computed fields
/// apply as usual.
pub trait ToWorksheet {
    fn store_into(&self, ws: &Worksheet) -> Result<(), WorksheetError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::Definitions;
    use crate::value::Value;

    #[derive(Default)]
    struct Person {
        name: String,
        age: i64,
        happy: bool,
        nicknames: Vec<String>,
    }

    impl FromWorksheet for Person {
        fn fill(&mut self, ws: &Worksheet, _: &mut StructScanner) -> Result<(), WorksheetError> {
            self.name = ws.get("name")?.as_text()?;
            self.age = ws.get("age")?.as_i64()?;
            self.happy = ws.get("happy")?.as_bool()?;
            self.nicknames = ws
                .get_slice("nicknames")?
                .iter()
                .map(Value::as_text)
                .collect::<Result<_, _>>()?;
            Ok(())
        }
    }

    fn person_defs() -> Definitions {
        Definitions::new(
            "worksheet person {1:name text 2:age number[0] 3:happy bool 4:nicknames []text}",
        )
        .unwrap()
    }

    #[test]
    fn write_back_goes_through_typed_setters() {
        impl ToWorksheet for Person {
            fn store_into(&self, ws: &Worksheet) -> Result<(), WorksheetError> {
                ws.set("name", Value::text(&self.name))?;
                ws.set("age", Value::int(self.age))?;
                ws.set("happy", Value::Bool(self.happy))?;
                for nickname in &self.nicknames {
                    ws.append("nicknames", Value::text(nickname))?;
                }
                Ok(())
            }
        }

        let person = Person {
            name: "Grace".to_string(),
            age: 85,
            happy: true,
            nicknames: vec!["amazing".to_string()],
        };
        let defs = person_defs();
        let ws = defs.new_worksheet("person").unwrap();
        person.store_into(&ws).unwrap();
        assert_eq!(ws.get("name").unwrap(), Value::text("Grace"));
        assert_eq!(ws.get_slice("nicknames").unwrap(), vec![Value::text("amazing")]);
    }

    #[test]
    fn scalar_scan() {
        let defs = person_defs();
        let ws = defs.new_worksheet("person").unwrap();
        ws.set("name", Value::text("Ada")).unwrap();
        ws.set("age", Value::int(36)).unwrap();
        ws.set("happy", Value::Bool(true)).unwrap();
        ws.append("nicknames", Value::text("countess")).unwrap();

        let person = struct_scan::<Person>(&ws).unwrap();
        let person = person.borrow();
        assert_eq!(person.name, "Ada");
        assert_eq!(person.age, 36);
        assert!(person.happy);
        assert_eq!(person.nicknames, vec!["countess".to_string()]);
    }

    #[test]
    fn fractional_number_does_not_scan_to_integer() {
        let defs = Definitions::new("worksheet w {1:v number[2]}").unwrap();
        let ws = defs.new_worksheet("w").unwrap();
        ws.set("v", Value::number(125, 2)).unwrap();

        #[derive(Default, Debug)]
        struct Target {
            v: i64,
        }
        impl FromWorksheet for Target {
            fn fill(&mut self, ws: &Worksheet, _: &mut StructScanner) -> Result<(), WorksheetError> {
                self.v = ws.get("v")?.as_i64()?;
                Ok(())
            }
        }

        let err = struct_scan::<Target>(&ws).unwrap_err();
        assert_eq!(err.to_string(), "cannot convert number[2] to i64");
    }

    #[test]
    fn cyclic_graphs_share_instances() {
        #[derive(Default)]
        struct Node {
            label: String,
            next: Option<Rc<RefCell<Node>>>,
        }
        impl FromWorksheet for Node {
            fn fill(
                &mut self,
                ws: &Worksheet,
                scanner: &mut StructScanner,
            ) -> Result<(), WorksheetError> {
                self.label = ws.get("label")?.as_text()?;
                self.next = match ws.get("next")? {
                    Value::Undefined => None,
                    value => Some(scanner.scan::<Node>(&value.as_worksheet()?)?),
                };
                Ok(())
            }
        }

        let defs = Definitions::new("worksheet node {1:label text 2:next node}").unwrap();
        let a = defs.new_worksheet("node").unwrap();
        let b = defs.new_worksheet("node").unwrap();
        a.set("label", Value::text("a")).unwrap();
        b.set("label", Value::text("b")).unwrap();
        a.set("next", Value::Ws(b.clone())).unwrap();
        b.set("next", Value::Ws(a.clone())).unwrap();

        let scanned = struct_scan::<Node>(&a).unwrap();
        let b_node = scanned.borrow().next.clone().unwrap();
        assert_eq!(b_node.borrow().label, "b");
        let back = b_node.borrow().next.clone().unwrap();
        // the cycle resolves to the same instance, not a copy
        assert!(Rc::ptr_eq(&scanned, &back));
        assert_eq!(back.borrow().label, "a");
    }
}
