// pipelite-core/src/context.rs
// Shared per-pipeline execution environment and collaborator seams

use crate::collation::Collator;
use crate::document::Document;
use crate::error::{PipeLiteError, Result};
use crate::value::{Value, ValueComparator};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// A fully-qualified collection name, `db.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Namespace {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Sibling collection in the same database, the resolution rule
    /// for $lookup/$graphLookup `from` and view `viewOn` names.
    pub fn with_coll(&self, coll: impl Into<String>) -> Namespace {
        Namespace {
            db: self.db.clone(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Engine-level tunables, one options struct per pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Byte budget for $group's in-memory table before spilling
    pub max_group_memory_bytes: usize,
    /// Byte budget for $sort's in-memory buffer before spilling
    pub max_sort_memory_bytes: usize,
    /// Hard ceiling across $graphLookup frontier + visited + cache
    pub max_graph_lookup_memory_bytes: usize,
    /// Byte ceiling for the shared $lookup cache
    pub lookup_cache_max_bytes: usize,
    /// Whether blocking stages may write temp data to disk
    pub allow_disk_use: bool,
    /// Spill directory; `None` uses the system temp dir
    pub spill_dir: Option<PathBuf>,
    /// Maximum view-resolution hops before reporting a cycle
    pub max_view_depth: usize,
    /// Serialized-size ceiling for a resolved view pipeline
    pub max_view_pipeline_bytes: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            max_group_memory_bytes: 100 * 1024 * 1024,
            max_sort_memory_bytes: 100 * 1024 * 1024,
            max_graph_lookup_memory_bytes: 100 * 1024 * 1024,
            lookup_cache_max_bytes: 100 * 1024 * 1024,
            allow_disk_use: true,
            spill_dir: None,
            max_view_depth: 10,
            max_view_pipeline_bytes: 16 * 1000 * 1000,
        }
    }
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group_memory(mut self, bytes: usize) -> Self {
        self.max_group_memory_bytes = bytes;
        self
    }

    pub fn with_sort_memory(mut self, bytes: usize) -> Self {
        self.max_sort_memory_bytes = bytes;
        self
    }

    pub fn with_graph_lookup_memory(mut self, bytes: usize) -> Self {
        self.max_graph_lookup_memory_bytes = bytes;
        self
    }

    pub fn with_disk_use(mut self, allow: bool) -> Self {
        self.allow_disk_use = allow;
        self
    }

    pub fn with_spill_dir(mut self, dir: PathBuf) -> Self {
        self.spill_dir = Some(dir);
        self
    }
}

/// External storage seam: "give me the next raw record".
///
/// The engine never manages locks, on-disk iteration or index
/// selection; whatever produces the base documents implements this.
/// `Paused` means "no data yet, call again later" and must be
/// propagated unchanged by pass-through stages.
pub trait RecordCursor: Send {
    fn next_record(&mut self) -> Result<CursorEvent>;
}

/// Three-valued pull result from a [`RecordCursor`].
#[derive(Debug, Clone, PartialEq)]
pub enum CursorEvent {
    Advanced(Document),
    Paused,
    Eof,
}

/// Environment delegate answering questions the core cannot answer
/// itself. Injected per [`ExpressionContext`]; every method is an
/// opaque capability as far as the engine is concerned.
pub trait ProcessInterface: Send + Sync {
    /// All foreign documents whose `field` equals `key` under the
    /// pipeline's collation ($lookup / $graphLookup expansion step).
    fn find_by_key(&self, ns: &Namespace, field: &str, key: &Value) -> Result<Vec<Document>>;

    /// Run a raw sub-pipeline against `ns` to completion.
    fn run_pipeline(
        &self,
        ns: &Namespace,
        stages: &[serde_json::Value],
    ) -> Result<Vec<Document>>;

    /// Collection-level statistics snapshot ($collStats).
    fn collection_stats(&self, ns: &Namespace) -> Result<Document>;

    /// Which shard this process is, if any.
    fn shard_name(&self) -> Option<String> {
        None
    }
}

/// Cooperative interruption callback: returns true once cancellation
/// has been requested.
pub type InterruptCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared execution environment for every stage of one pipeline.
///
/// Shared by `Arc` and not safely mutable concurrently; ownership of
/// the pipeline (and thus the context) moves between threads only
/// between `get_next` calls.
pub struct ExpressionContext {
    pub namespace: Namespace,
    pub options: PipelineOptions,
    collator: Option<Arc<Collator>>,
    interrupt: Option<InterruptCheck>,
    deadline: Option<Instant>,
    process: Option<Arc<dyn ProcessInterface>>,
}

impl fmt::Debug for ExpressionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionContext")
            .field("namespace", &self.namespace)
            .field("collator", &self.collator)
            .field("has_interrupt", &self.interrupt.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl ExpressionContext {
    pub fn new(namespace: Namespace) -> ExpressionContext {
        ExpressionContext {
            namespace,
            options: PipelineOptions::default(),
            collator: None,
            interrupt: None,
            deadline: None,
            process: None,
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_collator(mut self, collator: Collator) -> Self {
        self.collator = Some(Arc::new(collator));
        self
    }

    pub fn with_interrupt(mut self, check: InterruptCheck) -> Self {
        self.interrupt = Some(check);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_process_interface(mut self, process: Arc<dyn ProcessInterface>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn collator(&self) -> Option<&Collator> {
        self.collator.as_deref()
    }

    pub fn collator_arc(&self) -> Option<Arc<Collator>> {
        self.collator.clone()
    }

    pub fn value_comparator(&self) -> ValueComparator {
        ValueComparator::new(self.collator.clone())
    }

    /// Every stage calls this at least once per produced result.
    ///
    /// A hard interrupt and the soft deadline share the propagation
    /// path; they differ only in the reported error.
    pub fn check_interrupted(&self) -> Result<()> {
        if let Some(check) = &self.interrupt {
            if check() {
                return Err(PipeLiteError::Interrupted);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(PipeLiteError::ExceededTimeLimit);
            }
        }
        Ok(())
    }

    /// The process delegate, or a clean error for stages that need one
    /// but were constructed without.
    pub fn process_interface(&self) -> Result<&dyn ProcessInterface> {
        self.process.as_deref().ok_or_else(|| {
            PipeLiteError::InvalidPipeline(
                "this pipeline requires a process interface delegate".to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_namespace_display() {
        let ns = Namespace::new("app", "users");
        assert_eq!(ns.to_string(), "app.users");
        assert_eq!(ns.with_coll("orders").to_string(), "app.orders");
    }

    #[test]
    fn test_default_options() {
        let opts = PipelineOptions::default();
        assert!(opts.allow_disk_use);
        assert_eq!(opts.max_view_depth, 10);
        assert!(opts.max_group_memory_bytes > 0);
    }

    #[test]
    fn test_interrupt_check() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let ctx = ExpressionContext::new(Namespace::new("test", "c"))
            .with_interrupt(Arc::new(move || flag2.load(Ordering::Relaxed)));

        assert!(ctx.check_interrupted().is_ok());
        flag.store(true, Ordering::Relaxed);
        let err = ctx.check_interrupted().unwrap_err();
        assert_eq!(err.code(), PipeLiteError::Interrupted.code());
    }

    #[test]
    fn test_deadline_check() {
        let ctx = ExpressionContext::new(Namespace::new("test", "c"))
            .with_deadline(Instant::now() - std::time::Duration::from_millis(1));
        let err = ctx.check_interrupted().unwrap_err();
        assert!(matches!(err, PipeLiteError::ExceededTimeLimit));
    }

    #[test]
    fn test_missing_process_interface_is_clean_error() {
        let ctx = ExpressionContext::new(Namespace::new("test", "c"));
        assert!(ctx.process_interface().is_err());
    }
}
