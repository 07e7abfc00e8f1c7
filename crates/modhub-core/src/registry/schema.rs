//! JSON Schema checks for module configuration schemas.

use crate::error::{RegistryError, Result};
use serde_json::Value;
use tracing::debug;

/// Check that `schema` parses as JSON and compiles as a draft-07 schema.
pub fn validate_schema(module_name: &str, schema: &str) -> Result<()> {
    let value: Value = serde_json::from_str(schema).map_err(|e| RegistryError::InvalidSchema {
        module_name: module_name.to_string(),
        reason: format!("not valid JSON: {}", e),
    })?;

    jsonschema::draft7::new(&value).map_err(|e| RegistryError::InvalidSchema {
        module_name: module_name.to_string(),
        reason: e.to_string(),
    })?;

    Ok(())
}

/// Structural equality of two schema documents, ignoring key order and
/// whitespace. A document that does not parse is never equivalent to
/// anything, itself included.
pub fn schemas_equivalent(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(left), Ok(right)) => left == right,
        (Err(e), _) | (_, Err(e)) => {
            debug!("Schema comparison failed to parse a document: {}", e);
            false
        }
    }
}

/// A missing schema on either side is always compatible.
pub fn schemas_compatible(existing: Option<&str>, candidate: Option<&str>) -> bool {
    match (existing, candidate) {
        (Some(a), Some(b)) => schemas_equivalent(a, b),
        _ => true,
    }
}
