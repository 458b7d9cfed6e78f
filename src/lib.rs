//! Pipeline Contract Harness
//!
//! A mock-driven contract test harness for pipeline stages that talk to HTTP
//! services. Tests stand up a local mock endpoint, program it with sequenced
//! replies, run a pipeline against it, and assert on the records, errors, and
//! requests that came out.
//!
//! # Features
//!
//! - **Mock Endpoint**: Local HTTP server answering from registered rules
//! - **Sequenced Replies**: Each reply answers N requests or every request
//! - **Request Capture**: Every inbound request is logged in arrival order
//! - **Pipeline Graphs**: Sources, processors and sinks joined by explicit edges
//! - **Bounded Runs**: Runs finish, fail with a stage error code, or time out
//! - **Scenario Files**: YAML expectation tables run against fresh endpoints
//!
//! # Example
//!
//! ```no_run
//! use pipeline_contract_harness::{
//!     Harness, HttpLookupConfig, HttpLookupProcessor, MockEndpoint, PipelineBuilder,
//!     RawDataSource, ReplySpec, RuleDefinition, Wiretap,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let endpoint = MockEndpoint::start_default().await?;
//! endpoint.register(
//!     RuleDefinition::when("GET /lookup")?,
//!     ReplySpec::status(200).json(json!({"A": 1})).forever(),
//! )?;
//!
//! let mut builder = PipelineBuilder::new();
//! let source = builder.add_source(RawDataSource::text("dummy"));
//! let lookup = builder.add_processor(HttpLookupProcessor::new(HttpLookupConfig::new(
//!     endpoint.url_for("lookup"),
//! ))?);
//! let tap = builder.add_sink(Wiretap::new());
//! builder.connect(source, lookup).connect(lookup, tap);
//!
//! let result = Harness::new().run(builder.build("lookup")?).await?;
//! result.expect_output_count(1)?;
//! endpoint.teardown().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod harness;
pub mod matcher;
pub mod mock;
pub mod pipeline;
pub mod scenario;
pub mod scope;
pub mod stages;
pub mod template;

pub use capture::CapturedRequest;
pub use config::{MockConfig, ReplySpec, RuleDefinition, Times};
pub use error::{HarnessError, PipelineError};
pub use harness::{Harness, RunResult, RunStatus};
pub use mock::MockEndpoint;
pub use pipeline::{PipelineBuilder, Record};
pub use scenario::Scenario;
pub use scope::ResourceScope;
pub use stages::{HttpLookupConfig, HttpLookupProcessor, RawDataSource, Wiretap};
