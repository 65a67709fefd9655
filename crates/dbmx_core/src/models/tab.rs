//! Workspace tab models.

use crate::error::{DbmxError, Result};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Display name given to every new tab.
pub const DEFAULT_TAB_NAME: &str = "SQL Editor";

/// Cached result of the last query run in a tab.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Column names, in result order
    pub columns: Vec<String>,
    /// Row tuples, positionally aligned with `columns`
    pub rows: Vec<Vec<JsonValue>>,
}

impl Output {
    /// Create an output from columns and rows.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<JsonValue>>) -> Self {
        Self { columns, rows }
    }

    /// Parse a serialized cache. An empty cache means "no result yet".
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| DbmxError::deserialize(format!("Cached output is not valid JSON: {e}"), e))
    }

    /// Serialize for storage in the `output` column.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            DbmxError::storage_with_source(format!("Failed to serialize output: {e}"), e)
        })
    }

    /// Number of cached rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Denormalized, unenforced reference from a tab to a saved connection.
///
/// The identifier is resolved through the connection registry at execution
/// time; it may dangle after the connection is removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRef {
    /// Saved connection identifier
    #[serde(rename = "activeDBID", default, deserialize_with = "empty_as_none")]
    pub id: Option<String>,
    /// Connection display name at the time of binding
    #[serde(rename = "activeDBName", default, deserialize_with = "empty_as_none")]
    pub name: Option<String>,
    /// Connection UI colour at the time of binding
    #[serde(rename = "activeDBColour", default, deserialize_with = "empty_as_none")]
    pub colour: Option<String>,
}

impl ConnectionRef {
    /// Build a reference from boundary strings, mapping empty strings to absent.
    pub fn new(id: &str, name: &str, colour: &str) -> Self {
        Self { id: non_empty(id), name: non_empty(name), colour: non_empty(colour) }
    }

    /// A reference to nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// The same reference with empty strings mapped to absent.
    pub fn normalized(&self) -> Self {
        let clean = |field: &Option<String>| field.as_deref().and_then(non_empty);
        Self { id: clean(&self.id), name: clean(&self.name), colour: clean(&self.colour) }
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.colour.is_none()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.as_deref().and_then(non_empty))
}

/// A workspace tab: editor buffer, cached result and connection reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    /// Stable identifier assigned by the metadata store
    pub id: i64,
    /// Display label
    pub name: String,
    /// SQL buffer
    pub editor: String,
    /// Serialized cache of the last result ("" when none)
    pub output: String,
    /// Whether this is the current tab
    pub is_active: bool,
    /// Weak reference to the bound connection
    #[serde(flatten)]
    pub connection: ConnectionRef,
    /// Hydrated form of `output`; only populated for active or fetched tabs
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Output>,
}

impl Tab {
    /// Deserialize `output` into `result`.
    ///
    /// Fails loudly on a malformed cache rather than dropping it.
    pub fn hydrate(&mut self) -> Result<()> {
        self.result = Output::parse(&self.output)?;
        Ok(())
    }

    /// Consume and return the hydrated tab.
    pub fn hydrated(mut self) -> Result<Self> {
        self.hydrate()?;
        Ok(self)
    }

    /// Whether the tab is hydrated with a cached result.
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }
}

/// Result of deleting a tab.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// The deleted tab was active; this other tab was promoted in its place.
    Promoted(Tab),
    /// The deleted tab was inactive; the active tab is unchanged.
    ActiveUnchanged,
    /// The deleted tab was the only tab; the collection is now empty.
    Emptied,
}

impl DeleteOutcome {
    /// The newly promoted tab, if a promotion happened.
    pub fn promoted(&self) -> Option<&Tab> {
        match self {
            Self::Promoted(tab) => Some(tab),
            Self::ActiveUnchanged | Self::Emptied => None,
        }
    }

    /// Take the newly promoted tab, if any.
    pub fn into_promoted(self) -> Option<Tab> {
        match self {
            Self::Promoted(tab) => Some(tab),
            Self::ActiveUnchanged | Self::Emptied => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tab_with_output(output: &str) -> Tab {
        Tab {
            id: 1,
            name: DEFAULT_TAB_NAME.to_string(),
            editor: String::new(),
            output: output.to_string(),
            is_active: true,
            connection: ConnectionRef::none(),
            result: None,
        }
    }

    #[test]
    fn test_connection_ref_normalizes_empty_strings() {
        let reference = ConnectionRef::new("", "", "");
        assert!(reference.is_empty());
        assert_eq!(reference.id, None);

        let reference = ConnectionRef::new("abc", "prod", "");
        assert_eq!(reference.id.as_deref(), Some("abc"));
        assert_eq!(reference.name.as_deref(), Some("prod"));
        assert_eq!(reference.colour, None);
    }

    #[test]
    fn test_connection_ref_deserializes_empty_strings_as_absent() {
        let reference: ConnectionRef = serde_json::from_value(
            json!({"activeDBID": "", "activeDBName": "", "activeDBColour": ""}),
        )
        .unwrap();
        assert!(reference.is_empty());

        let reference: ConnectionRef =
            serde_json::from_value(json!({"activeDBID": "c1", "activeDBColour": null})).unwrap();
        assert_eq!(reference, ConnectionRef::new("c1", "", ""));
    }

    #[test]
    fn test_connection_ref_normalized() {
        let raw = ConnectionRef {
            id: Some("c1".to_string()),
            name: Some(String::new()),
            colour: Some(String::new()),
        };
        assert_eq!(raw.normalized(), ConnectionRef::new("c1", "", ""));
    }

    #[test]
    fn test_hydrate_restores_columns_and_rows() {
        let mut tab = tab_with_output(r#"{"columns":["a","b"],"rows":[[1,2],[3,4]]}"#);
        tab.hydrate().unwrap();

        let output = tab.result.unwrap();
        assert_eq!(output.columns, vec!["a", "b"]);
        assert_eq!(output.rows, vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]]);
    }

    #[test]
    fn test_hydrate_empty_output_is_none() {
        let tab = tab_with_output("").hydrated().unwrap();
        assert!(!tab.has_result());
    }

    #[test]
    fn test_hydrate_malformed_output_fails() {
        let err = tab_with_output("{\"columns\": [").hydrated().unwrap_err();
        assert!(matches!(err, DbmxError::Deserialize { .. }));
    }

    #[test]
    fn test_tab_serializes_reference_fields() {
        let mut tab = tab_with_output("");
        tab.connection = ConnectionRef::new("c1", "local", "#ff0000");
        let value = serde_json::to_value(&tab).unwrap();
        assert_eq!(value["activeDBID"], json!("c1"));
        assert_eq!(value["activeDBName"], json!("local"));
        assert_eq!(value["activeDBColour"], json!("#ff0000"));
        assert_eq!(value["isActive"], json!(true));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_delete_outcome_option_view() {
        assert!(DeleteOutcome::Emptied.promoted().is_none());
        assert!(DeleteOutcome::ActiveUnchanged.into_promoted().is_none());
        let tab = tab_with_output("");
        assert_eq!(DeleteOutcome::Promoted(tab.clone()).promoted(), Some(&tab));
    }
}
