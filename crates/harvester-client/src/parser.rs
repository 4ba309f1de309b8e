//! Rule-driven JSON entity parser.
//!
//! Each [`EntityRule`] selects an object or an array of objects with a JSON
//! pointer and emits one entity per object. References are resolved
//! relative to the selected object, the parent reference relative to the
//! payload root.
//!
//! ```
//! use harvester_client::JsonEntityParser;
//! use harvester_core::config::{EntityRule, RefRule};
//! use harvester_core::models::RawPayload;
//! use harvester_core::traits::{EntityParser, ParseResult};
//!
//! let rules = vec![
//!     EntityRule {
//!         kind: "seller".to_string(),
//!         pointer: "/data/seller".to_string(),
//!         id_field: "id".to_string(),
//!         fields: None,
//!         references: vec![],
//!         parent: None,
//!     },
//!     EntityRule {
//!         kind: "product".to_string(),
//!         pointer: "/data".to_string(),
//!         id_field: "id".to_string(),
//!         fields: Some(vec!["title".to_string()]),
//!         references: vec![RefRule { kind: "seller".to_string(), pointer: "/seller/id".to_string() }],
//!         parent: None,
//!     },
//! ];
//! let parser = JsonEntityParser::new(rules).unwrap();
//! let payload = RawPayload::new(r#"{"data":{"id":1,"title":"Kettle","seller":{"id":9}}}"#);
//!
//! match parser.parse(&payload) {
//!     ParseResult::Parsed(entities) => assert_eq!(entities.len(), 2),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use harvester_core::config::{EntityRule, RefRule};
use harvester_core::error::AppError;
use harvester_core::models::{Entity, RawPayload};
use harvester_core::traits::{EntityParser, ParseResult};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct JsonEntityParser {
    rules: Vec<EntityRule>,
    kind_order: Vec<String>,
}

impl JsonEntityParser {
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `rules` is empty.
    pub fn new(rules: Vec<EntityRule>) -> Result<Self, AppError> {
        if rules.is_empty() {
            return Err(AppError::ConfigError(
                "at least one [[sources.entities]] rule is required".to_string(),
            ));
        }

        let mut kind_order: Vec<String> = Vec::new();
        for rule in &rules {
            if !kind_order.contains(&rule.kind) {
                kind_order.push(rule.kind.clone());
            }
        }

        Ok(Self { rules, kind_order })
    }

    fn select<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
        if pointer.is_empty() {
            Some(root)
        } else {
            root.pointer(pointer)
        }
    }

    fn extract(rule: &EntityRule, root: &Value, out: &mut Vec<Entity>) {
        match Self::select(root, &rule.pointer) {
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(entity) = Self::entity_from(rule, root, item) {
                        out.push(entity);
                    }
                }
            }
            Some(item @ Value::Object(_)) => {
                if let Some(entity) = Self::entity_from(rule, root, item) {
                    out.push(entity);
                }
            }
            _ => {}
        }
    }

    fn entity_from(rule: &EntityRule, root: &Value, item: &Value) -> Option<Entity> {
        let object = item.as_object()?;
        let Some(id) = object.get(&rule.id_field).and_then(id_string) else {
            tracing::debug!(kind = %rule.kind, id_field = %rule.id_field, "Skipping object without id");
            return None;
        };

        let mut entity = Entity::new(rule.kind.clone(), id);
        match &rule.fields {
            Some(allowed) => {
                for name in allowed {
                    if let Some(value) = object.get(name) {
                        entity.fields.insert(name.clone(), value.clone());
                    }
                }
            }
            None => {
                for (name, value) in object {
                    if name != &rule.id_field {
                        entity.fields.insert(name.clone(), value.clone());
                    }
                }
            }
        }

        for reference in &rule.references {
            if let Some(target) = resolve_ref(item, reference) {
                entity = entity.with_reference(reference.kind.clone(), target);
            }
        }
        if let Some(parent) = &rule.parent {
            if let Some(target) = resolve_ref(root, parent) {
                entity = entity.with_reference(parent.kind.clone(), target);
            }
        }

        Some(entity)
    }
}

fn resolve_ref(base: &Value, rule: &RefRule) -> Option<String> {
    base.pointer(&rule.pointer).and_then(id_string)
}

/// Ids may be strings or integers upstream; both normalize to a string.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl EntityParser for JsonEntityParser {
    fn parse(&self, payload: &RawPayload) -> ParseResult {
        let root: Value = match serde_json::from_str(&payload.body) {
            Ok(root) => root,
            Err(e) => return ParseResult::Failed(format!("invalid JSON: {}", e)),
        };

        let mut entities = Vec::new();
        for rule in &self.rules {
            Self::extract(rule, &root, &mut entities);
        }

        if entities.is_empty() {
            ParseResult::Empty
        } else {
            ParseResult::Parsed(entities)
        }
    }

    fn kind_order(&self) -> Vec<String> {
        self.kind_order.clone()
    }
}
