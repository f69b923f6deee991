//! The diff between a worksheet's persisted snapshot and its current data.

use std::collections::BTreeMap;

use crate::value::Value;
use crate::worksheet::Worksheet;

impl Worksheet {
    /// Every index where `orig` and `data` disagree, mapped to the current
    /// value; an index that disappeared maps to `Undefined`. A freshly
    /// saved or loaded worksheet has an empty diff.
    pub fn diff(&self) -> BTreeMap<i32, Value> {
        let orig = self.orig_snapshot();
        let data = self.data_snapshot();

        let mut diff = BTreeMap::new();
        for (index, old) in &orig {
            match data.get(index) {
                Some(new) => {
                    if !old.equal(new) {
                        diff.insert(*index, new.clone());
                    }
                }
                None => {
                    diff.insert(*index, Value::Undefined);
                }
            }
        }
        for (index, new) in &data {
            if !orig.contains_key(index) {
                diff.insert(*index, new.clone());
            }
        }
        diff
    }
}
