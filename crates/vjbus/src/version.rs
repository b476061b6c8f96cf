//! Version information for vjbus.

use crate::envelope::SCHEMA_VERSION;

/// vjbus version from Cargo.toml
pub const VJBUS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the `health` verb.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VersionInfo {
    /// Library version.
    pub vjbus: String,
    /// Envelope schema spoken on the wire.
    pub schema: String,
    /// Version of the worker program embedding the library, if it set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            vjbus: VJBUS_VERSION.to_string(),
            schema: SCHEMA_VERSION.to_string(),
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the embedding worker's own version.
    pub fn with_worker(mut self, version: impl Into<String>) -> Self {
        self.worker = Some(version.into());
        self
    }
}
