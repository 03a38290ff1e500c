//! Parsing of the legacy local data shape into remote batch operations.
//!
//! Saved items were a JSON array of objects carrying an `id`; watch progress
//! was a JSON object keyed by item id. Remote document ids are derived as
//! `{identity}_{item}` so a repeated migration overwrites rather than
//! duplicates.

use crate::config::RemoteCollections;
use crate::remote::{BatchOp, Fields};
use serde_json::{Value, json};

/// Field tagging every migrated document with the run that wrote it.
pub const RUN_ID_FIELD: &str = "migrationRunId";

/// Trims whitespace and stray JSON quoting from a legacy identity value.
pub fn normalize_legacy_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('"').trim();
    if trimmed.is_empty() || trimmed == "null" || trimmed == "undefined" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LegacyPlan {
    pub ops: Vec<BatchOp>,
    pub saved_items: usize,
    pub progress_entries: usize,
    /// Records that could not be interpreted and were left behind.
    pub skipped: usize,
}

pub struct LegacyPlanner<'a> {
    pub collections: &'a RemoteCollections,
    pub identity: &'a str,
    pub run_id: &'a str,
    pub migrated_at: &'a str,
}

impl LegacyPlanner<'_> {
    fn item_id(value: &Value) -> Option<String> {
        match value {
            Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    fn document_id(&self, item: &str) -> String {
        format!("{}_{}", self.identity, item)
    }

    fn tag(&self, fields: &mut Fields, item: &str) {
        fields.insert(self.collections.owner_field.clone(), json!(self.identity));
        fields.insert("itemId".to_string(), json!(item));
        fields.insert(RUN_ID_FIELD.to_string(), json!(self.run_id));
        fields.insert("migratedAt".to_string(), json!(self.migrated_at));
    }

    pub fn saved_items(&self, raw: &str, plan: &mut LegacyPlan) {
        let items = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items,
            Ok(_) | Err(_) => {
                plan.skipped += 1;
                return;
            }
        };

        for item in items {
            let Value::Object(mut fields) = item else {
                plan.skipped += 1;
                continue;
            };
            let Some(item_id) = fields.get("id").and_then(Self::item_id) else {
                plan.skipped += 1;
                continue;
            };
            fields.remove("id");
            self.tag(&mut fields, &item_id);
            plan.ops.push(BatchOp::Upsert {
                collection: self.collections.saved_items.clone(),
                id: self.document_id(&item_id),
                fields,
            });
            plan.saved_items += 1;
        }
    }

    pub fn progress(&self, raw: &str, plan: &mut LegacyPlan) {
        let entries = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(entries)) => entries,
            Ok(_) | Err(_) => {
                plan.skipped += 1;
                return;
            }
        };

        for (item_id, value) in entries {
            let item_id = item_id.trim().to_string();
            if item_id.is_empty() {
                plan.skipped += 1;
                continue;
            }
            let mut fields = match value {
                Value::Object(fields) => fields,
                Value::Null => {
                    plan.skipped += 1;
                    continue;
                }
                other => {
                    let mut fields = Fields::new();
                    fields.insert("progress".to_string(), other);
                    fields
                }
            };
            self.tag(&mut fields, &item_id);
            plan.ops.push(BatchOp::Upsert {
                collection: self.collections.watch_progress.clone(),
                id: self.document_id(&item_id),
                fields,
            });
            plan.progress_entries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(collections: &RemoteCollections) -> LegacyPlanner<'_> {
        LegacyPlanner {
            collections,
            identity: "fp_abc",
            run_id: "run1",
            migrated_at: "2024-01-01T00:00:00.000Z",
        }
    }

    #[test]
    fn test_normalize_legacy_id() {
        assert_eq!(normalize_legacy_id(" \"id_42\" "), Some("id_42".to_string()));
        assert_eq!(normalize_legacy_id("null"), None);
        assert_eq!(normalize_legacy_id("   "), None);
    }

    #[test]
    fn test_saved_items_skip_malformed_entries() {
        let collections = RemoteCollections::default();
        let mut plan = LegacyPlan::default();
        planner(&collections).saved_items(
            r#"[{"id":"m1","title":"Heat"},{"title":"no id"},7,{"id":12}]"#,
            &mut plan,
        );
        assert_eq!(plan.saved_items, 2);
        assert_eq!(plan.skipped, 2);
        match &plan.ops[0] {
            BatchOp::Upsert { id, fields, .. } => {
                assert_eq!(id, "fp_abc_m1");
                assert_eq!(fields.get("userId"), Some(&json!("fp_abc")));
                assert_eq!(fields.get(RUN_ID_FIELD), Some(&json!("run1")));
                assert!(fields.get("id").is_none());
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_progress_wraps_scalars() {
        let collections = RemoteCollections::default();
        let mut plan = LegacyPlan::default();
        planner(&collections).progress(r#"{"e1": 0.5, "e2": {"seconds": 30}, "e3": null}"#, &mut plan);
        assert_eq!(plan.progress_entries, 2);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.ops[0].collection(), "watch_progress");
    }

    #[test]
    fn test_unparseable_blob_is_skipped() {
        let collections = RemoteCollections::default();
        let mut plan = LegacyPlan::default();
        planner(&collections).saved_items("not json", &mut plan);
        assert!(plan.ops.is_empty());
        assert_eq!(plan.skipped, 1);
    }
}
