//! Feature value transformers
//!
//! Each feature declares an ordered transformer chain; every stage consumes
//! the full value vector produced by the previous one. An unknown
//! transformer name fails the feature, which in turn fails the evaluation of
//! the model that declared it.

use anyhow::{bail, Result};

use dte_config::FeatureConfiguration;

pub const TRANSFORMER_EXISTS: &str = "Exists";
pub const TRANSFORMER_GET_FIRST_NOT_EMPTY: &str = "GetFirstNotEmpty";
pub const TRANSFORMER_APPLY_MAPPINGS: &str = "ApplyMappings";
pub const TRANSFORMER_CONCATENATE_BY_PAIR: &str = "ConcatenateByPair";

/// A feature's resolved values after extraction and transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFeature {
    pub name: String,
    pub values: Vec<String>,
}

/// Run the feature's transformer chain left to right over the extracted
/// values.
pub fn transform_feature(
    configuration: &FeatureConfiguration,
    values: Vec<String>,
) -> Result<Vec<String>> {
    let mut current = values;
    for transformer_name in &configuration.transformations {
        current = match transformer_name.as_str() {
            TRANSFORMER_EXISTS => exists(current),
            TRANSFORMER_GET_FIRST_NOT_EMPTY => get_first_not_empty(current),
            TRANSFORMER_APPLY_MAPPINGS => apply_mappings(configuration, current),
            TRANSFORMER_CONCATENATE_BY_PAIR => concatenate_by_pair(current),
            other => bail!("transformer [{other}] not found"),
        };
    }
    Ok(current)
}

/// Maps every value to "1" if non-empty, "0" otherwise.
fn exists(values: Vec<String>) -> Vec<String> {
    values
        .iter()
        .map(|value| if value.is_empty() { "0" } else { "1" }.to_string())
        .collect()
}

/// Collapses the vector to its first non-empty value, or the empty string.
fn get_first_not_empty(values: Vec<String>) -> Vec<String> {
    vec![values
        .into_iter()
        .find(|value| !value.is_empty())
        .unwrap_or_default()]
}

/// Replaces each value through the feature's mapping table, falling back to
/// the configured default for unmapped values.
fn apply_mappings(configuration: &FeatureConfiguration, values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| {
            configuration
                .mapping
                .get(&value)
                .cloned()
                .unwrap_or_else(|| configuration.mapping_default_value.clone())
        })
        .collect()
}

/// Joins values pairwise as `<first>x<second>`, dropping pairs with an empty
/// half. A trailing odd element is ignored.
fn concatenate_by_pair(values: Vec<String>) -> Vec<String> {
    (0..values.len() / 2)
        .filter_map(|i| {
            let first = &values[i * 2];
            let second = &values[i * 2 + 1];
            (!first.is_empty() && !second.is_empty()).then(|| format!("{first}x{second}"))
        })
        .collect()
}
