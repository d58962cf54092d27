use std::cmp::Ordering;

use fanin_store::{fold, Combine, Snapshot};
use serde_json::{Map, Value};

/// Where a run stands, given a snapshot and its width.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Waiting { arrived: i64 },
    /// `merged` is the contributions folded in sequence order, with `id` set
    /// to the width.
    Complete { merged: Value },
    Overrun { arrived: i64 },
}

/// Pure completion check. No I/O.
pub fn evaluate<C: Combine + ?Sized>(snapshot: &Snapshot, width: i64, combine: &C) -> Evaluation {
    match snapshot.count.cmp(&width) {
        Ordering::Less => Evaluation::Waiting {
            arrived: snapshot.count,
        },
        Ordering::Greater => Evaluation::Overrun {
            arrived: snapshot.count,
        },
        Ordering::Equal => {
            let mut merged = match fold(combine, &snapshot.contributions) {
                Some(Value::Object(map)) => map,
                Some(other) => {
                    let mut map = Map::new();
                    map.insert("value".into(), other);
                    map
                }
                None => Map::new(),
            };
            merged.insert("id".into(), Value::from(width));
            Evaluation::Complete {
                merged: Value::Object(merged),
            }
        }
    }
}
