// tests/aggregation_integration_tests.rs
// End-to-end pipeline tests through the public API

use pipelite_core::stage::source::QueueStage;
use pipelite_core::{
    Document, ExpressionContext, GetNextResult, Namespace, Pipeline, PipeLiteError,
    PipelineOptions, ProcessInterface, Value,
};
use serde_json::json;
use std::sync::Arc;

fn ctx() -> Arc<ExpressionContext> {
    Arc::new(ExpressionContext::new(Namespace::new("testdb", "people")))
}

fn docs(items: Vec<serde_json::Value>) -> Vec<Document> {
    items.iter().map(Document::from_json).collect()
}

fn run_pipeline(
    ctx: &Arc<ExpressionContext>,
    stages: serde_json::Value,
    input: Vec<serde_json::Value>,
) -> Vec<Document> {
    let raw: Vec<serde_json::Value> = stages.as_array().unwrap().clone();
    let mut pipeline = Pipeline::parse(&raw, ctx.clone()).unwrap();
    pipeline.optimize();
    pipeline.add_initial_source(Box::new(QueueStage::with_documents(
        ctx.clone(),
        docs(input),
    )));
    pipeline.run().unwrap()
}

#[test]
fn test_filter_group_sort_project() {
    let ctx = ctx();
    let results = run_pipeline(
        &ctx,
        json!([
            {"$match": {"age": {"$gte": 21}}},
            {"$group": {"_id": "$city", "count": {"$sum": 1}}},
            {"$sort": {"count": -1, "_id": 1}},
            {"$project": {"city": "$_id", "count": 1, "_id": 0}}
        ]),
        vec![
            json!({"name": "a", "age": 25, "city": "NYC"}),
            json!({"name": "b", "age": 18, "city": "NYC"}),
            json!({"name": "c", "age": 32, "city": "NYC"}),
            json!({"name": "d", "age": 40, "city": "LA"}),
        ],
    );
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].get_value("city"), Value::string("NYC"));
    assert_eq!(results[0].get_value("count"), Value::Int64(2));
    assert!(!results[0].contains("_id"));
}

#[test]
fn test_unwind_then_group() {
    let ctx = ctx();
    let results = run_pipeline(
        &ctx,
        json!([
            {"$unwind": "$tags"},
            {"$group": {"_id": "$tags", "n": {"$sum": 1}}},
            {"$sort": {"_id": 1}}
        ]),
        vec![
            json!({"tags": ["red", "blue"]}),
            json!({"tags": ["blue"]}),
            json!({"tags": []}),
        ],
    );
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].get_value("_id"), Value::string("blue"));
    assert_eq!(results[0].get_value("n"), Value::Int64(2));
    assert_eq!(results[1].get_value("_id"), Value::string("red"));
}

#[test]
fn test_group_spills_and_stays_correct() {
    let ctx = Arc::new(
        ExpressionContext::new(Namespace::new("testdb", "people"))
            .with_options(PipelineOptions::default().with_group_memory(4 * 1024)),
    );
    let input: Vec<serde_json::Value> = (0..1000)
        .map(|i| json!({"bucket": format!("bucket-{:03}", i % 100), "v": i}))
        .collect();
    let results = run_pipeline(
        &ctx,
        json!([{"$group": {"_id": "$bucket", "n": {"$sum": 1}, "values": {"$push": "$v"}}}]),
        input,
    );
    assert_eq!(results.len(), 100);
    for group in &results {
        assert_eq!(group.get_value("n"), Value::Int64(10));
        assert_eq!(group.get_value("values").as_array().unwrap().len(), 10);
    }
}

#[test]
fn test_add_to_set_with_collation() {
    let ctx = Arc::new(
        ExpressionContext::new(Namespace::new("testdb", "people"))
            .with_collator(pipelite_core::Collator::case_insensitive()),
    );
    let results = run_pipeline(
        &ctx,
        json!([{"$group": {"_id": null, "names": {"$addToSet": "$name"}}}]),
        vec![
            json!({"name": "Ann"}),
            json!({"name": "ANN"}),
            json!({"name": "bob"}),
        ],
    );
    assert_eq!(results[0].get_value("names").as_array().unwrap().len(), 2);
}

#[test]
fn test_redact_prunes_classified_subtrees() {
    let ctx = ctx();
    let results = run_pipeline(
        &ctx,
        json!([
            {"$redact": {"$cond": [{"$eq": ["$classified", true]}, "$$PRUNE", "$$DESCEND"]}}
        ]),
        vec![json!({
            "title": "report",
            "body": {"text": "public", "classified": false},
            "appendix": {"classified": true, "secret": 42}
        })],
    );
    assert_eq!(results.len(), 1);
    assert!(results[0].contains("body"));
    assert!(!results[0].contains("appendix"));
}

#[test]
fn test_serialize_roundtrip_produces_identical_output() {
    let ctx = ctx();
    let stages = json!([
        {"$match": {"a": {"$gt": 1}}},
        {"$group": {"_id": "$a", "total": {"$sum": 1}}},
        {"$project": {"a": "$_id", "total": 1, "_id": 0}},
        {"$sort": {"a": 1}}
    ]);
    let input = vec![
        json!({"a": 1}),
        json!({"a": 2}),
        json!({"a": 2}),
        json!({"a": 3}),
    ];

    let raw: Vec<serde_json::Value> = stages.as_array().unwrap().clone();
    let serialized = Pipeline::parse(&raw, ctx.clone()).unwrap().serialize();

    let direct = run_pipeline(&ctx, stages, input.clone());
    let reparsed = run_pipeline(&ctx, serde_json::Value::Array(serialized), input);

    let shape = |docs: &[Document]| -> Vec<String> {
        docs.iter().map(|d| d.to_json().to_string()).collect()
    };
    assert_eq!(shape(&direct), shape(&reparsed));
}

#[test]
fn test_pause_pattern_survives_passthrough_stages() {
    let ctx = ctx();
    let doc = Document::from_json(&json!({"a": 1}));
    let events = vec![
        GetNextResult::Advanced(doc.clone()),
        GetNextResult::Paused,
        GetNextResult::Advanced(doc),
        GetNextResult::Paused,
        GetNextResult::Eof,
    ];
    let raw = vec![
        json!({"$addFields": {"b": 1}}),
        json!({"$project": {"a": 1, "b": 1}}),
    ];
    let mut pipeline = Pipeline::parse(&raw, ctx.clone()).unwrap();
    pipeline.add_initial_source(Box::new(QueueStage::with_results(ctx, events)));

    let statuses: Vec<&str> = (0..5)
        .map(|_| match pipeline.get_next().unwrap() {
            GetNextResult::Advanced(_) => "advanced",
            GetNextResult::Paused => "paused",
            GetNextResult::Eof => "eof",
        })
        .collect();
    assert_eq!(
        statuses,
        vec!["advanced", "paused", "advanced", "paused", "eof"]
    );
}

struct JoinFixture {
    orders: Vec<Document>,
}

impl ProcessInterface for JoinFixture {
    fn find_by_key(
        &self,
        _ns: &Namespace,
        field: &str,
        key: &Value,
    ) -> pipelite_core::Result<Vec<Document>> {
        Ok(self
            .orders
            .iter()
            .filter(|d| {
                let v = d.get_path(field);
                let v = if v.is_missing() { Value::Null } else { v };
                v == *key
            })
            .cloned()
            .collect())
    }

    fn run_pipeline(
        &self,
        _ns: &Namespace,
        _stages: &[serde_json::Value],
    ) -> pipelite_core::Result<Vec<Document>> {
        Ok(Vec::new())
    }

    fn collection_stats(&self, _ns: &Namespace) -> pipelite_core::Result<Document> {
        Ok(Document::new())
    }
}

#[test]
fn test_lookup_with_absorbed_unwind() {
    let fixture = Arc::new(JoinFixture {
        orders: docs(vec![
            json!({"user": "ann", "total": 10}),
            json!({"user": "ann", "total": 20}),
            json!({"user": "bob", "total": 5}),
        ]),
    });
    let ctx = Arc::new(
        ExpressionContext::new(Namespace::new("testdb", "people"))
            .with_process_interface(fixture),
    );
    let results = run_pipeline(
        &ctx,
        json!([
            {"$lookup": {"from": "orders", "localField": "name",
                         "foreignField": "user", "as": "orders"}},
            {"$unwind": "$orders"},
            {"$group": {"_id": "$name", "spent": {"$sum": "$orders.total"}}},
            {"$sort": {"_id": 1}}
        ]),
        vec![json!({"name": "ann"}), json!({"name": "bob"})],
    );
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].get_value("spent"), Value::Int64(30));
    assert_eq!(results[1].get_value("spent"), Value::Int64(5));
}

#[test]
fn test_sample_is_uniform_subset() {
    let ctx = ctx();
    let input: Vec<serde_json::Value> = (0..100).map(|i| json!({ "i": i })).collect();
    let results = run_pipeline(&ctx, json!([{"$sample": {"size": 10}}]), input);
    assert_eq!(results.len(), 10);
    for doc in &results {
        let i = doc.get_value("i").as_i64().unwrap();
        assert!((0..100).contains(&i));
    }
}

#[test]
fn test_evaluation_error_aborts_run() {
    let ctx = ctx();
    let raw = vec![json!({"$project": {"bad": {"$divide": ["$a", 0]}}})];
    let mut pipeline = Pipeline::parse(&raw, ctx.clone()).unwrap();
    pipeline.add_initial_source(Box::new(QueueStage::with_documents(
        ctx,
        docs(vec![json!({"a": 1})]),
    )));
    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipeLiteError::Evaluation(_)));
}

#[test]
fn test_spec_errors_surface_before_execution() {
    let ctx = ctx();
    // Unknown stage
    assert!(matches!(
        Pipeline::parse(&[json!({"$frobnicate": {}})], ctx.clone()).unwrap_err(),
        PipeLiteError::UnknownStage(_)
    ));
    // Unknown group operator, with its stable message
    let err =
        Pipeline::parse(&[json!({"$group": {"_id": null, "x": {"$median": 1}}})], ctx.clone())
            .unwrap_err();
    assert_eq!(err.code(), 14);
    // $sample without size
    let err = Pipeline::parse(&[json!({"$sample": {}})], ctx.clone()).unwrap_err();
    assert!(err.to_string().contains("$sample must specify a size"));
    // Conflicting projection paths
    assert!(matches!(
        Pipeline::parse(&[json!({"$project": {"a": 1, "a.b": 1}})], ctx).unwrap_err(),
        PipeLiteError::InvalidProjection(_)
    ));
}
