//! Fixture stages used to wire pipelines around the component under test.

pub mod http_lookup;
pub mod raw_source;
pub mod wiretap;

pub use http_lookup::{HttpLookupConfig, HttpLookupProcessor};
pub use raw_source::{RawDataSource, SourceConfig};
pub use wiretap::Wiretap;
