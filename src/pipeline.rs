//! Pipeline model: records, stage traits, and the graph builder.
//!
//! Pipelines are directed graphs. Nodes are stages, edges carry record
//! batches, and edges are added with an explicit [`PipelineBuilder::connect`]
//! call:
//!
//! ```no_run
//! # use pipeline_contract_harness::pipeline::PipelineBuilder;
//! # use pipeline_contract_harness::stages::{RawDataSource, Wiretap};
//! let wiretap = Wiretap::new();
//! let mut builder = PipelineBuilder::new();
//! let source = builder.add_source(RawDataSource::text("dummy"));
//! let tap = builder.add_sink(wiretap.clone());
//! builder.connect(source, tap);
//! let pipeline = builder.build("smoke").unwrap();
//! ```

use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Header attribute holding the error code of an error record.
pub const ERROR_CODE_ATTRIBUTE: &str = "errorCode";
/// Header attribute holding the error message of an error record.
pub const ERROR_MESSAGE_ATTRIBUTE: &str = "errorMessage";
/// Header attribute holding the stage that produced an error record.
pub const ERROR_STAGE_ATTRIBUTE: &str = "errorStage";

/// A record flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Root field
    pub value: Value,
    /// Header attributes
    #[serde(default)]
    pub header: BTreeMap<String, String>,
}

impl Record {
    /// Create a record with an empty header.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            header: BTreeMap::new(),
        }
    }

    /// Field at a JSON pointer (`""` or `"/"` is the root).
    pub fn field(&self, pointer: &str) -> Option<&Value> {
        if pointer.is_empty() || pointer == "/" {
            return Some(&self.value);
        }
        self.value.pointer(pointer)
    }

    /// Set the field at a JSON pointer, creating intermediate maps.
    pub fn set_field(&mut self, pointer: &str, value: Value) {
        let segments: Vec<String> = pointer
            .split('/')
            .skip(1)
            .map(|s| s.replace("~1", "/").replace("~0", "~"))
            .collect();

        let Some((last, parents)) = segments.split_last() else {
            self.value = value;
            return;
        };
        if last.is_empty() && parents.is_empty() {
            self.value = value;
            return;
        }

        let mut current = &mut self.value;
        for segment in parents {
            current = as_object(current)
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        as_object(current).insert(last.clone(), value);
    }

    /// Header attribute lookup.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.header.get(name).map(String::as_str)
    }

    /// Set a header attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.header.insert(name.into(), value.into());
    }

    /// Error code of an error record.
    pub fn error_code(&self) -> Option<&str> {
        self.attribute(ERROR_CODE_ATTRIBUTE)
    }

    /// Turn this record into an error record.
    pub fn into_error(mut self, error_code: &str, message: &str) -> Self {
        self.set_attribute(ERROR_CODE_ATTRIBUTE, error_code);
        self.set_attribute(ERROR_MESSAGE_ATTRIBUTE, message);
        self
    }
}

fn as_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

/// A batch of records.
pub type Batch = Vec<Record>;

/// An error raised by a stage, with a stable error code such as `HTTP_14`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{error_code} - {message}")]
pub struct StageFailure {
    pub error_code: String,
    pub message: String,
}

impl StageFailure {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}

/// A non-terminal stage error, tagged with the stage that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageError {
    pub stage: String,
    pub error_code: String,
    pub message: String,
}

/// What a processor produced for one batch.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Records passed downstream
    pub records: Batch,
    /// Records routed to error handling
    pub error_records: Batch,
    /// Stage errors that did not stop the run
    pub stage_errors: Vec<StageFailure>,
}

/// A stage that originates records.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stage type name, e.g. `DevRawDataSource`.
    fn name(&self) -> &str;

    /// Produce the next batch, or `None` once the source is finished.
    async fn next_batch(&mut self) -> Result<Option<Batch>, StageFailure>;
}

/// A stage that transforms batches.
///
/// Returning `Err` is a terminal failure and stops the run.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, batch: Batch) -> Result<StageOutput, StageFailure>;
}

/// A stage that consumes records.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, records: &[Record]);

    /// Error records produced anywhere in the pipeline.
    fn write_errors(&self, _records: &[Record]) {}
}

/// Handle to a node added to a [`PipelineBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum StageNode {
    Source(Box<dyn Source>),
    Processor(Box<dyn Processor>),
    Sink(Box<dyn Sink>),
}

impl StageNode {
    fn kind(&self) -> &'static str {
        match self {
            StageNode::Source(_) => "source",
            StageNode::Processor(_) => "processor",
            StageNode::Sink(_) => "sink",
        }
    }
}

pub(crate) struct Node {
    pub(crate) id: String,
    pub(crate) stage: StageNode,
}

/// Builds a pipeline graph.
#[derive(Default)]
pub struct PipelineBuilder {
    nodes: Vec<Node>,
    edges: Vec<(NodeId, NodeId)>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source stage.
    pub fn add_source(&mut self, source: impl Source + 'static) -> NodeId {
        let name = source.name().to_string();
        self.push(name, StageNode::Source(Box::new(source)))
    }

    /// Add a processor stage.
    pub fn add_processor(&mut self, processor: impl Processor + 'static) -> NodeId {
        let name = processor.name().to_string();
        self.push(name, StageNode::Processor(Box::new(processor)))
    }

    /// Add a sink stage.
    pub fn add_sink(&mut self, sink: impl Sink + 'static) -> NodeId {
        let name = sink.name().to_string();
        self.push(name, StageNode::Sink(Box::new(sink)))
    }

    fn push(&mut self, name: String, stage: StageNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id: format!("{}_{:02}", name, id.0 + 1),
            stage,
        });
        id
    }

    /// Route the records leaving `from` into `to`.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> &mut Self {
        if !self.edges.contains(&(from, to)) {
            self.edges.push((from, to));
        }
        self
    }

    /// Instance id assigned to a node, e.g. `HTTPClient_02`.
    pub fn stage_id(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.0).map(|n| n.id.as_str())
    }

    /// Validate the graph and produce a runnable pipeline.
    pub fn build(self, title: impl Into<String>) -> Result<Pipeline, PipelineError> {
        let count = self.nodes.len();
        let mut downstream = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];

        for &(from, to) in &self.edges {
            let from_node = self.nodes.get(from.0).ok_or(PipelineError::UnknownNode(from.0))?;
            let to_node = self.nodes.get(to.0).ok_or(PipelineError::UnknownNode(to.0))?;

            let reason = if from == to {
                Some("a stage cannot feed itself")
            } else if matches!(from_node.stage, StageNode::Sink(_)) {
                Some("sinks have no output")
            } else if matches!(to_node.stage, StageNode::Source(_)) {
                Some("sources have no input")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(PipelineError::InvalidEdge {
                    from: format!("{} ({})", from_node.id, from_node.stage.kind()),
                    to: format!("{} ({})", to_node.id, to_node.stage.kind()),
                    reason: reason.to_string(),
                });
            }

            downstream[from.0].push(to.0);
            in_degree[to.0] += 1;
        }

        let sources: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.stage, StageNode::Source(_)))
            .map(|(i, _)| i)
            .collect();
        let source = match sources.as_slice() {
            [] => return Err(PipelineError::NoSource),
            [single] => *single,
            many => {
                return Err(PipelineError::MultipleSources(
                    many.iter().map(|&i| self.nodes[i].id.clone()).collect(),
                ))
            }
        };
        if !self
            .nodes
            .iter()
            .any(|n| matches!(n.stage, StageNode::Sink(_)))
        {
            return Err(PipelineError::NoSink);
        }

        let mut reachable = vec![false; count];
        let mut queue = VecDeque::from([source]);
        reachable[source] = true;
        while let Some(node) = queue.pop_front() {
            for &next in &downstream[node] {
                if !reachable[next] {
                    reachable[next] = true;
                    queue.push_back(next);
                }
            }
        }
        if let Some(i) = reachable.iter().position(|r| !r) {
            return Err(PipelineError::Unreachable(self.nodes[i].id.clone()));
        }

        // Kahn's algorithm; every node is reachable from the single source,
        // so an incomplete order means a cycle.
        let mut order = Vec::with_capacity(count);
        let mut ready = VecDeque::from([source]);
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &next in &downstream[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != count {
            return Err(PipelineError::Cycle);
        }

        Ok(Pipeline {
            title: title.into(),
            nodes: self.nodes,
            downstream,
            order,
            source,
        })
    }
}

/// A validated pipeline graph, ready to run.
pub struct Pipeline {
    pub(crate) title: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) downstream: Vec<Vec<usize>>,
    pub(crate) order: Vec<usize>,
    pub(crate) source: usize,
}

impl Pipeline {
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Stage instance ids in execution order.
    pub fn stage_ids(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].id.as_str()).collect()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("title", &self.title)
            .field("stages", &self.stage_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Numbers;

    #[async_trait]
    impl Source for Numbers {
        fn name(&self) -> &str {
            "Numbers"
        }

        async fn next_batch(&mut self) -> Result<Option<Batch>, StageFailure> {
            Ok(None)
        }
    }

    struct Identity;

    #[async_trait]
    impl Processor for Identity {
        fn name(&self) -> &str {
            "Identity"
        }

        async fn process(&self, batch: Batch) -> Result<StageOutput, StageFailure> {
            Ok(StageOutput {
                records: batch,
                ..StageOutput::default()
            })
        }
    }

    struct Discard;

    impl Sink for Discard {
        fn name(&self) -> &str {
            "Discard"
        }

        fn write(&self, _records: &[Record]) {}
    }

    #[test]
    fn test_record_fields() {
        let mut record = Record::new(json!({"text": "dummy"}));
        record.set_field("/result/A", json!(1));
        record.set_field("/text", json!("replaced"));

        assert_eq!(record.field("/result/A"), Some(&json!(1)));
        assert_eq!(record.field("/text"), Some(&json!("replaced")));
        assert_eq!(record.field("/missing"), None);
        assert_eq!(record.field(""), Some(&record.value));
    }

    #[test]
    fn test_set_field_replaces_scalars_and_root() {
        let mut record = Record::new(json!("scalar"));
        record.set_field("/a/b", json!(true));
        assert_eq!(record.value, json!({"a": {"b": true}}));

        record.set_field("/a~1b", json!(2));
        assert_eq!(record.field("/a~1b"), Some(&json!(2)));

        record.set_field("", json!([1, 2]));
        assert_eq!(record.value, json!([1, 2]));
    }

    #[test]
    fn test_error_record_attributes() {
        let record = Record::new(json!({})).into_error("HTTP_68", "empty response");
        assert_eq!(record.error_code(), Some("HTTP_68"));
        assert_eq!(record.attribute(ERROR_MESSAGE_ATTRIBUTE), Some("empty response"));
    }

    #[test]
    fn test_build_linear_pipeline() {
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(Numbers);
        let identity = builder.add_processor(Identity);
        let sink = builder.add_sink(Discard);
        builder.connect(source, identity).connect(identity, sink);

        assert_eq!(builder.stage_id(identity), Some("Identity_02"));
        let pipeline = builder.build("linear").unwrap();
        assert_eq!(pipeline.title(), "linear");
        assert_eq!(
            pipeline.stage_ids(),
            vec!["Numbers_01", "Identity_02", "Discard_03"]
        );
    }

    #[test]
    fn test_build_rejects_missing_source_and_sink() {
        let mut builder = PipelineBuilder::new();
        builder.add_sink(Discard);
        assert_eq!(builder.build("no source").unwrap_err(), PipelineError::NoSource);

        let mut builder = PipelineBuilder::new();
        builder.add_source(Numbers);
        assert_eq!(builder.build("no sink").unwrap_err(), PipelineError::NoSink);
    }

    #[test]
    fn test_build_rejects_bad_edges() {
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(Numbers);
        let sink = builder.add_sink(Discard);
        builder.connect(source, sink).connect(sink, source);
        assert!(matches!(
            builder.build("backwards"),
            Err(PipelineError::InvalidEdge { .. })
        ));
    }

    #[test]
    fn test_build_rejects_unreachable_and_cycles() {
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(Numbers);
        let sink = builder.add_sink(Discard);
        builder.add_processor(Identity);
        builder.connect(source, sink);
        assert_eq!(
            builder.build("orphan").unwrap_err(),
            PipelineError::Unreachable("Identity_03".to_string())
        );

        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(Numbers);
        let a = builder.add_processor(Identity);
        let b = builder.add_processor(Identity);
        let sink = builder.add_sink(Discard);
        builder
            .connect(source, a)
            .connect(a, b)
            .connect(b, a)
            .connect(b, sink);
        assert_eq!(builder.build("cycle").unwrap_err(), PipelineError::Cycle);
    }

    #[test]
    fn test_build_rejects_multiple_sources() {
        let mut builder = PipelineBuilder::new();
        let first = builder.add_source(Numbers);
        let second = builder.add_source(Numbers);
        let sink = builder.add_sink(Discard);
        builder.connect(first, sink).connect(second, sink);
        assert!(matches!(
            builder.build("two sources"),
            Err(PipelineError::MultipleSources(ids)) if ids.len() == 2
        ));
    }
}
