//! Deterministic data source.

use crate::pipeline::{Batch, Record, Source, StageFailure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How raw data is split into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// One record per line, in a `/text` field
    #[default]
    Text,
    /// A single record holding the whole text in `/text`
    WholeText,
    /// One record per JSON value
    Json,
    /// One record per element of a single top-level JSON array
    ArrayObjects,
}

/// Source settings as they appear in scenario files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub data_format: DataFormat,

    pub raw_data: String,

    /// Number of identical batches to emit before finishing
    #[serde(default = "default_batches")]
    pub batches: u32,
}

fn default_batches() -> u32 {
    1
}

impl SourceConfig {
    pub fn build(&self) -> Result<RawDataSource, serde_json::Error> {
        let source = match self.data_format {
            DataFormat::Text => RawDataSource::text(&self.raw_data),
            DataFormat::WholeText => RawDataSource::whole_text(&self.raw_data),
            DataFormat::Json => RawDataSource::json(&self.raw_data)?,
            DataFormat::ArrayObjects => RawDataSource::array_objects(&self.raw_data)?,
        };
        Ok(source.with_batches(self.batches))
    }
}

/// Emits the same records in each of a fixed number of batches.
#[derive(Debug, Clone)]
pub struct RawDataSource {
    records: Vec<Record>,
    batches_remaining: u32,
}

impl RawDataSource {
    /// One record per non-empty line, each with a `/text` field.
    pub fn text(raw: &str) -> Self {
        Self::from_values(
            raw.lines()
                .filter(|line| !line.is_empty())
                .map(|line| json!({ "text": line }))
                .collect(),
        )
    }

    /// One record with the unsplit text.
    pub fn whole_text(raw: &str) -> Self {
        Self::from_values(vec![json!({ "text": raw })])
    }

    /// One record per JSON value in `raw` (whitespace separated).
    pub fn json(raw: &str) -> Result<Self, serde_json::Error> {
        let values = serde_json::Deserializer::from_str(raw)
            .into_iter::<Value>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_values(values))
    }

    /// One record per element of the top-level array in `raw`.
    pub fn array_objects(raw: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Array(items) => Ok(Self::from_values(items)),
            other => Err(serde::de::Error::custom(format!(
                "expected a top-level array, found {}",
                other
            ))),
        }
    }

    /// One record per value.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            records: values.into_iter().map(Record::new).collect(),
            batches_remaining: 1,
        }
    }

    /// Emit `batches` batches instead of stopping after the first.
    pub fn with_batches(mut self, batches: u32) -> Self {
        self.batches_remaining = batches.max(1);
        self
    }

    /// Records in each batch.
    pub fn records_per_batch(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl Source for RawDataSource {
    fn name(&self) -> &str {
        "DevRawDataSource"
    }

    async fn next_batch(&mut self) -> Result<Option<Batch>, StageFailure> {
        if self.batches_remaining == 0 {
            return Ok(None);
        }
        self.batches_remaining -= 1;
        Ok(Some(self.records.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_source_stops_after_first_batch() {
        let mut source = RawDataSource::text("first\n\nsecond");
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].field("/text"), Some(&json!("second")));
        assert!(source.next_batch().await.unwrap().is_none());

        let mut whole = RawDataSource::whole_text("first\nsecond");
        let batch = whole.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].field("/text"), Some(&json!("first\nsecond")));
    }

    #[tokio::test]
    async fn test_json_source_with_batches() {
        let mut source = RawDataSource::json(r#"{"a": 1} {"a": 2}"#)
            .unwrap()
            .with_batches(2);
        assert_eq!(source.records_per_batch(), 2);
        assert!(source.next_batch().await.unwrap().is_some());
        assert!(source.next_batch().await.unwrap().is_some());
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_array_objects_splits_top_level_array() {
        let mut source =
            RawDataSource::array_objects(r#"[{"a": "x"}, {"b": "y"}, {"c": "z"}]"#).unwrap();
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].field("/c"), Some(&json!("z")));

        assert_eq!(RawDataSource::json(r#"[{"a": 1}, {"b": 2}]"#).unwrap().records_per_batch(), 1);
        assert!(RawDataSource::array_objects(r#"{"a": 1}"#).is_err());
    }

    #[test]
    fn test_source_config() {
        let config: SourceConfig =
            serde_yaml::from_str("data_format: json\nraw_data: '{\"city\": \"SF\"}'\n").unwrap();
        assert_eq!(config.batches, 1);
        assert_eq!(config.build().unwrap().records_per_batch(), 1);

        let bad: SourceConfig = serde_yaml::from_str("data_format: json\nraw_data: '{'\n").unwrap();
        assert!(bad.build().is_err());

        let array: SourceConfig =
            serde_yaml::from_str("data_format: array_objects\nraw_data: '[1, 2]'\n").unwrap();
        assert_eq!(array.build().unwrap().records_per_batch(), 2);
    }
}
