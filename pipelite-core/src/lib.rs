// pipelite-core/src/lib.rs
// Pure Rust aggregation pipeline engine

pub mod accumulator;
pub mod collation;
pub mod context;
pub mod document;
pub mod error;
pub mod expression;
pub mod lite_parse;
pub mod logging;
pub mod lookup_cache;
pub mod matcher;
pub mod pipeline;
pub mod sorter;
pub mod stage;
pub mod value;
pub mod view;

#[cfg(test)]
mod value_property_tests;

// Public exports
pub use collation::Collator;
pub use context::{
    CursorEvent, ExpressionContext, Namespace, PipelineOptions, ProcessInterface, RecordCursor,
};
pub use document::{Document, DocumentBuilder};
pub use error::{PipeLiteError, Result};
pub use lite_parse::LiteParsedPipeline;
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use lookup_cache::LookupSetCache;
pub use matcher::{algo::is_subset_of, MatchExpression};
pub use pipeline::{Pipeline, SplitState};
pub use stage::{DocumentSource, GetNextResult};
pub use value::{Value, ValueComparator};
pub use view::{ResolvedView, ViewCatalog, ViewCatalogLoader, ViewDefinition};
