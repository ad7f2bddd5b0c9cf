// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use comfy_plugin::{EngineHealth, ExecutionStatus, PluginMetadata, ValidationError};
use schemars::{Schema, schema_for};

use crate::{
    api::{ErrorBody, ExecutionResponse},
    config::ServiceSettings,
    plugin::PluginStatus,
    workflow::FormSchema,
};

/// Every schema `comfyforms schema` emits, by file stem.
pub fn schemas() -> Vec<(&'static str, Schema)> {
    vec![
        ("form-schema", schema_for!(FormSchema)),
        ("execution-response", schema_for!(ExecutionResponse)),
        ("execution-status", schema_for!(ExecutionStatus)),
        ("validation-error", schema_for!(ValidationError)),
        ("error", schema_for!(ErrorBody)),
        ("engine-health", schema_for!(EngineHealth)),
        ("plugin-metadata", schema_for!(PluginMetadata)),
        ("plugin-status", schema_for!(PluginStatus)),
        ("service-settings", schema_for!(ServiceSettings)),
    ]
}

/// Writes `<name>.schema.json` files into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<usize, Error> {
    fs::create_dir_all(out_dir)?;
    let schemas = schemas();
    for (name, schema) in &schemas {
        let json = serde_json::to_string_pretty(schema)?;
        fs::write(out_dir.join(format!("{name}.schema.json")), json)?;
    }
    Ok(schemas.len())
}
