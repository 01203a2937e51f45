use serde::Deserialize;

use crate::diagnostics::Severity;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Severity attached to every data-quality report.
    pub data_quality: Severity,
    /// Run the built-in linkage validator after every push.
    pub validate_documents: bool,
    /// Register the `string`, `number`, `boolean` and `date` transforms.
    pub builtin_transforms: bool,
    /// Prefix of generated local ids.
    pub lid_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_quality: Severity::Warn,
            validate_documents: false,
            builtin_transforms: true,
            lid_prefix: "@lid:".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let json = r#"{ "dataQuality": "error", "validateDocuments": true }"#;
        let config = StoreConfig::from_json(json).unwrap();
        assert_eq!(config.data_quality, Severity::Error);
        assert!(config.validate_documents);
        assert!(config.builtin_transforms);
        assert_eq!(config.lid_prefix, "@lid:");
    }

    #[test]
    fn malformed_config_is_a_json_error() {
        assert!(matches!(
            StoreConfig::from_json(r#"{ "dataQuality": "loud" }"#),
            Err(crate::Error::Json(_))
        ));
    }
}
