//! Merge operators over contribution payloads.

use serde_json::{Map, Value};

use crate::types::Contribution;

/// Associative combine over payloads: `combine(combine(a, b), c)` must equal
/// `combine(a, combine(b, c))`.
pub trait Combine: Send + Sync {
    fn combine(&self, acc: Value, next: &Value) -> Value;
}

/// Concatenates the `message` string fields, joined by `separator`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Concat {
    pub separator: String,
}

impl Concat {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    /// Space-joined, the way the file-backed aggregator merges.
    pub fn spaced() -> Self {
        Self::new(" ")
    }
}

impl Combine for Concat {
    fn combine(&self, acc: Value, next: &Value) -> Value {
        let mut out = match acc {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let head = out
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let tail = next
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = format!("{head}{}{tail}", self.separator);
        out.insert("message".into(), Value::String(message));
        Value::Object(out)
    }
}

/// Shallow-merges `payload` objects. Later contributions win on collision.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePayload;

impl Combine for MergePayload {
    fn combine(&self, acc: Value, next: &Value) -> Value {
        let mut out = match acc {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut payload = match out.remove("payload") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(Value::Object(incoming)) = next.get("payload") {
            for (k, v) in incoming {
                payload.insert(k.clone(), v.clone());
            }
        }
        out.insert("payload".into(), Value::Object(payload));
        Value::Object(out)
    }
}

impl<C: Combine + ?Sized> Combine for std::sync::Arc<C> {
    fn combine(&self, acc: Value, next: &Value) -> Value {
        (**self).combine(acc, next)
    }
}

impl<C: Combine + ?Sized> Combine for Box<C> {
    fn combine(&self, acc: Value, next: &Value) -> Value {
        (**self).combine(acc, next)
    }
}

/// Fold contributions in the order given, seeded with the first payload.
pub fn fold<C: Combine + ?Sized>(combine: &C, contributions: &[Contribution]) -> Option<Value> {
    let (first, rest) = contributions.split_first()?;
    Some(
        rest.iter()
            .fold(first.payload.clone(), |acc, c| combine.combine(acc, &c.payload)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(s: &str) -> Contribution {
        Contribution::new(json!({"id": 0, "message": s}))
    }

    #[test]
    fn concat_joins_in_given_order() {
        let merged = fold(&Concat::default(), &[msg("a"), msg("b"), msg("c")]).unwrap();
        assert_eq!(merged["message"], "abc");
    }

    #[test]
    fn spaced_concat_matches_file_layout() {
        let merged = fold(&Concat::spaced(), &[msg("x"), msg("y")]).unwrap();
        assert_eq!(merged["message"], "x y");
    }

    #[test]
    fn concat_is_associative() {
        let c = Concat::new("-");
        let (a, b, d) = (msg("a").payload, msg("b").payload, msg("d").payload);
        let left = c.combine(c.combine(a.clone(), &b), &d);
        let right = c.combine(a, &c.combine(b, &d));
        assert_eq!(left["message"], right["message"]);
    }

    #[test]
    fn fold_of_nothing_is_none() {
        assert!(fold(&Concat::default(), &[]).is_none());
    }

    #[test]
    fn single_contribution_folds_to_itself() {
        let merged = fold(&Concat::spaced(), &[msg("only")]).unwrap();
        assert_eq!(merged["message"], "only");
    }

    #[test]
    fn merge_payload_unions_keys_later_wins() {
        let parts = [
            Contribution::new(json!({"id": 1, "payload": {"body": "init", "first": 1}})),
            Contribution::new(json!({"id": 2, "payload": {"second": 2, "first": 10}})),
        ];
        let merged = fold(&MergePayload, &parts).unwrap();
        assert_eq!(
            merged["payload"],
            json!({"body": "init", "first": 10, "second": 2})
        );
    }
}
