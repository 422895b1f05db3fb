//! Structural validation of plans and patches against embedded JSON Schemas.

pub mod rules;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shipwright_common::{Patch, Plan};

use crate::errors::SchemaError;

pub const PLAN_SCHEMA: &str = "plan";
pub const PATCH_SCHEMA: &str = "patch";

/// Name, version, source.
const EMBEDDED: &[(&str, &str, &str)] = &[
    (PLAN_SCHEMA, "v1", include_str!("schemas/plan.v1.json")),
    (PATCH_SCHEMA, "v1", include_str!("schemas/patch.v1.json")),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub schema_version: String,
}

struct CompiledSchema {
    version: &'static str,
    schema: JSONSchema,
}

/// Compiles each schema on first use and keeps it.
#[derive(Default)]
pub struct SchemaValidator {
    cache: Mutex<HashMap<&'static str, Arc<CompiledSchema>>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema_names() -> Vec<&'static str> {
        EMBEDDED.iter().map(|(name, _, _)| *name).collect()
    }

    /// Validate `data` against the named schema. Structural mismatches are
    /// reported in the result; only an unknown (or broken) schema is an error.
    pub fn validate(&self, data: &Value, schema_name: &str) -> Result<ValidationResult, SchemaError> {
        let compiled = self.load(schema_name)?;
        let errors: Vec<String> = match compiled.schema.validate(data) {
            Ok(()) => Vec::new(),
            Err(iter) => iter
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect(),
        };
        Ok(ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
            schema_version: compiled.version.to_string(),
        })
    }

    /// Structural validation plus plan rules. Any error fails with
    /// `ValidationFailed`; rule warnings ride along on the result.
    pub fn validate_plan(&self, data: &Value) -> Result<(Plan, ValidationResult), SchemaError> {
        let (plan, mut result) = self.validate_typed::<Plan>(data, PLAN_SCHEMA)?;
        let findings = rules::check_plan(&plan);
        finish(PLAN_SCHEMA, &mut result, findings)?;
        Ok((plan, result))
    }

    pub fn validate_patch(&self, data: &Value) -> Result<(Patch, ValidationResult), SchemaError> {
        let (patch, mut result) = self.validate_typed::<Patch>(data, PATCH_SCHEMA)?;
        let findings = rules::check_patch(&patch);
        finish(PATCH_SCHEMA, &mut result, findings)?;
        Ok((patch, result))
    }

    fn validate_typed<T: DeserializeOwned>(
        &self,
        data: &Value,
        schema_name: &str,
    ) -> Result<(T, ValidationResult), SchemaError> {
        let result = self.validate(data, schema_name)?;
        if !result.is_valid {
            return Err(SchemaError::ValidationFailed {
                schema: schema_name.to_string(),
                errors: result.errors,
            });
        }
        let typed = T::deserialize(data).map_err(|e| SchemaError::ValidationFailed {
            schema: schema_name.to_string(),
            errors: vec![e.to_string()],
        })?;
        Ok((typed, result))
    }

    fn load(&self, name: &str) -> Result<Arc<CompiledSchema>, SchemaError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(compiled) = cache.get(name) {
            return Ok(Arc::clone(compiled));
        }

        let (key, version, source) = EMBEDDED
            .iter()
            .find(|(n, _, _)| *n == name)
            .copied()
            .ok_or_else(|| SchemaError::SchemaNotFound {
                name: name.to_string(),
            })?;
        let invalid = |message: String| SchemaError::InvalidSchema {
            name: name.to_string(),
            message,
        };
        let document: Value = serde_json::from_str(source).map_err(|e| invalid(e.to_string()))?;
        let schema = JSONSchema::compile(&document).map_err(|e| invalid(e.to_string()))?;

        tracing::debug!(schema = name, version, "Compiled schema");
        let compiled = Arc::new(CompiledSchema { version, schema });
        cache.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }
}

fn finish(
    schema: &str,
    result: &mut ValidationResult,
    findings: rules::RuleFindings,
) -> Result<(), SchemaError> {
    if !findings.errors.is_empty() {
        return Err(SchemaError::ValidationFailed {
            schema: schema.to_string(),
            errors: findings.errors,
        });
    }
    result.warnings.extend(findings.warnings);
    Ok(())
}
