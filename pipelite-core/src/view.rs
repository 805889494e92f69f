// pipelite-core/src/view.rs
// View catalog: stored pipelines resolved transparently onto their
// base namespace
//
// The catalog is a process-wide cache of the externally-persisted view
// definitions, guarded by one mutex and a valid flag. Any external
// write invalidates the whole cache; the next lookup reloads it from
// the loader under the lock (double-checked, so concurrent lookups
// reload once).

use crate::collation::Collator;
use crate::context::Namespace;
use crate::error::{PipeLiteError, Result};
use crate::lite_parse::LiteParsedPipeline;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// A stored view: name, base target, pipeline, optional collation.
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub view_on: String,
    pub pipeline: Vec<serde_json::Value>,
    pub collation: Option<Collator>,
}

/// The outcome of resolution: a real namespace plus the concatenated
/// pipeline to prepend to the query.
#[derive(Debug, Clone)]
pub struct ResolvedView {
    pub namespace: Namespace,
    pub pipeline: Vec<serde_json::Value>,
    pub collation: Option<Collator>,
}

/// Backing-store access used to (re)load the catalog.
pub trait ViewCatalogLoader: Send + Sync {
    fn load_views(&self) -> Result<Vec<ViewDefinition>>;
}

impl<F> ViewCatalogLoader for F
where
    F: Fn() -> Result<Vec<ViewDefinition>> + Send + Sync,
{
    fn load_views(&self) -> Result<Vec<ViewDefinition>> {
        self()
    }
}

struct CatalogInner {
    valid: bool,
    views: HashMap<String, ViewDefinition>,
}

pub struct ViewCatalog {
    loader: Box<dyn ViewCatalogLoader>,
    inner: Mutex<CatalogInner>,
    max_depth: usize,
    max_pipeline_bytes: usize,
}

impl ViewCatalog {
    pub fn new(loader: Box<dyn ViewCatalogLoader>) -> ViewCatalog {
        ViewCatalog {
            loader,
            inner: Mutex::new(CatalogInner {
                valid: false,
                views: HashMap::new(),
            }),
            max_depth: 10,
            max_pipeline_bytes: 16 * 1000 * 1000,
        }
    }

    pub fn with_limits(mut self, max_depth: usize, max_pipeline_bytes: usize) -> ViewCatalog {
        self.max_depth = max_depth;
        self.max_pipeline_bytes = max_pipeline_bytes;
        self
    }

    /// Mark the cache stale after an external write to the backing
    /// store. The next access reloads wholesale.
    pub fn invalidate(&self) {
        self.inner.lock().valid = false;
    }

    /// Run `f` against the loaded view map, reloading first when the
    /// valid flag is down.
    fn with_loaded<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, ViewDefinition>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        if !inner.valid {
            let loaded = self.loader.load_views()?;
            inner.views = loaded.into_iter().map(|v| (v.name.clone(), v)).collect();
            inner.valid = true;
            crate::log_debug!("view catalog reloaded ({} views)", inner.views.len());
        }
        f(&mut inner.views)
    }

    pub fn lookup(&self, name: &str) -> Result<Option<ViewDefinition>> {
        self.with_loaded(|views| Ok(views.get(name).cloned()))
    }

    /// Resolve a namespace through the view chain.
    ///
    /// Each hop prepends the view's pipeline and retargets to its
    /// viewOn collection, stopping at the first non-view target. A
    /// $collStats-leading query operates on the base namespace
    /// directly, so view pipelines are not accumulated for it.
    pub fn resolve_view(
        &self,
        ns: &Namespace,
        query_pipeline: &[serde_json::Value],
    ) -> Result<ResolvedView> {
        let coll_stats_query = query_pipeline
            .first()
            .and_then(|s| s.as_object())
            .map(|o| o.contains_key("$collStats"))
            .unwrap_or(false);

        self.with_loaded(|views| {
            let mut coll = ns.coll.clone();
            let mut pipeline: Vec<serde_json::Value> = Vec::new();
            let mut collation: Option<Collator> = None;

            for _hop in 0..=self.max_depth {
                let Some(view) = views.get(&coll) else {
                    return Ok(ResolvedView {
                        namespace: ns.with_coll(coll),
                        pipeline,
                        collation,
                    });
                };
                match (&collation, &view.collation) {
                    (None, Some(c)) => collation = Some(c.clone()),
                    (Some(a), Some(b)) if a != b => {
                        return Err(PipeLiteError::ViewCollationMismatch(format!(
                            "view '{}' has a conflicting default collation",
                            view.name
                        )))
                    }
                    _ => {}
                }
                if !coll_stats_query {
                    let mut combined = view.pipeline.clone();
                    combined.extend(pipeline);
                    pipeline = combined;
                    let size = serde_json::to_string(&pipeline)?.len();
                    if size > self.max_pipeline_bytes {
                        return Err(PipeLiteError::ViewPipelineTooLarge(ns.to_string()));
                    }
                }
                coll = view.view_on.clone();
            }
            Err(PipeLiteError::ViewDepthExceeded(ns.to_string()))
        })
    }

    /// Define a new view after validating its pipeline and its effect
    /// on the dependency graph. A rejected definition leaves the
    /// catalog untouched.
    pub fn create_view(&self, def: ViewDefinition) -> Result<()> {
        self.validate_definition(&def)?;
        self.with_loaded(|views| {
            Self::check_graph(views, &def, self.max_depth)?;
            views.insert(def.name.clone(), def);
            Ok(())
        })
    }

    /// Replace an existing view definition, with the same validation
    /// as creation.
    pub fn modify_view(&self, def: ViewDefinition) -> Result<()> {
        self.validate_definition(&def)?;
        self.with_loaded(|views| {
            let previous = views.remove(&def.name);
            match Self::check_graph(views, &def, self.max_depth) {
                Ok(()) => {
                    views.insert(def.name.clone(), def);
                    Ok(())
                }
                Err(e) => {
                    // Roll the original definition back in
                    if let Some(previous) = previous {
                        views.insert(previous.name.clone(), previous);
                    }
                    Err(e)
                }
            }
        })
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        self.with_loaded(|views| {
            views.remove(name);
            Ok(())
        })
    }

    fn validate_definition(&self, def: &ViewDefinition) -> Result<()> {
        if def
            .pipeline
            .first()
            .and_then(|s| s.as_object())
            .map(|o| o.contains_key("$changeStream"))
            .unwrap_or(false)
        {
            return Err(PipeLiteError::InvalidPipeline(
                "$changeStream cannot be the first stage of a view pipeline".into(),
            ));
        }
        LiteParsedPipeline::parse(&def.pipeline)?;
        Ok(())
    }

    /// Dependencies of one view: its base collection plus every
    /// foreign collection its pipeline reads.
    fn dependencies(def: &ViewDefinition) -> Vec<String> {
        let mut deps = vec![def.view_on.clone()];
        if let Ok(lite) = LiteParsedPipeline::parse(&def.pipeline) {
            deps.extend(lite.involved_collections().iter().cloned());
        }
        deps
    }

    /// Walk the dependency graph as it would look with `candidate`
    /// inserted: reject cycles, excessive depth, and collation
    /// mismatches among reachable views. Read-only.
    fn check_graph(
        views: &HashMap<String, ViewDefinition>,
        candidate: &ViewDefinition,
        max_depth: usize,
    ) -> Result<()> {
        let resolve = |name: &str| -> Option<&ViewDefinition> {
            if name == candidate.name {
                Some(candidate)
            } else {
                views.get(name)
            }
        };

        // (name, depth) DFS from the candidate's dependencies
        let mut stack: Vec<(String, usize)> = Self::dependencies(candidate)
            .into_iter()
            .map(|d| (d, 1))
            .collect();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some((name, depth)) = stack.pop() {
            if name == candidate.name {
                return Err(PipeLiteError::ViewCycle(format!(
                    "view '{}' would depend on itself",
                    candidate.name
                )));
            }
            if depth > max_depth {
                return Err(PipeLiteError::ViewDepthExceeded(candidate.name.clone()));
            }
            let Some(view) = resolve(&name) else {
                continue;
            };
            match (&candidate.collation, &view.collation) {
                (Some(a), Some(b)) if a != b => {
                    return Err(PipeLiteError::ViewCollationMismatch(format!(
                        "view '{}' has a conflicting default collation",
                        view.name
                    )))
                }
                _ => {}
            }
            if seen.insert(name) {
                for dep in Self::dependencies(view) {
                    stack.push((dep, depth + 1));
                }
            }
        }
        Ok(())
    }
}
