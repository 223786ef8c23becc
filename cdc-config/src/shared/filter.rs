use serde::{Deserialize, Serialize};

/// Table-level filtering for change event processing.
///
/// An empty `include` list means every table is accepted. A table listed in
/// `exclude` is rejected even when it also appears in `include`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TableFilterConfig {
    /// Tables to process. Empty means all tables.
    #[serde(default)]
    pub include: Vec<String>,
    /// Tables to skip, applied after `include`.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TableFilterConfig {
    /// Returns whether events for `table_name` should be processed.
    pub fn matches(&self, table_name: &str) -> bool {
        if self.exclude.iter().any(|table| table == table_name) {
            return false;
        }

        self.include.is_empty() || self.include.iter().any(|table| table == table_name)
    }
}
