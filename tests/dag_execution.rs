//! DAG execution behavior: branch skipping, join firing, hook ordering,
//! share-data discipline, sub-DAG nesting, and build-time validation.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::sync::Arc;

use awel::dag::context::DagContext;
use awel::dag::executor::SubDagOperator;
use awel::dag::{Dag, DagBuilder, DagError};
use awel::metadata::ViewMetadata;
use awel::operator::{
    BranchOperator, InputSourceOperator, JoinOperator, MapOperator, OperatorBase, OperatorError,
    OperatorKind,
};
use awel::types::{TaskValue, is_empty_data};

type EventLog = Arc<Mutex<Vec<String>>>;

fn meta(name: &str) -> ViewMetadata {
    ViewMetadata::builder(name, name).build()
}

/// Passes call data through and logs its lifecycle events.
struct Source {
    name: String,
    log: EventLog,
}

#[async_trait]
impl OperatorBase for Source {
    fn metadata(&self) -> ViewMetadata {
        meta(&self.name)
    }

    async fn after_dag_end(&self, _ctx: &DagContext) -> Result<(), OperatorError> {
        self.log.lock().push(format!("{}:end", self.name));
        Ok(())
    }
}

#[async_trait]
impl InputSourceOperator for Source {
    async fn produce(
        &self,
        call_data: TaskValue,
        _ctx: &DagContext,
    ) -> Result<TaskValue, OperatorError> {
        self.log.lock().push(format!("{}:run", self.name));
        Ok(call_data)
    }
}

/// Appends its name to the `"trail"` field of a JSON object.
struct Tag {
    name: String,
    log: EventLog,
    fail: bool,
}

impl Tag {
    fn new(name: &str, log: &EventLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            fail: false,
        }
    }
}

#[async_trait]
impl OperatorBase for Tag {
    fn metadata(&self) -> ViewMetadata {
        meta(&self.name)
    }

    async fn after_dag_end(&self, _ctx: &DagContext) -> Result<(), OperatorError> {
        self.log.lock().push(format!("{}:end", self.name));
        Ok(())
    }
}

#[async_trait]
impl MapOperator for Tag {
    async fn map(&self, input: TaskValue, _ctx: &DagContext) -> Result<TaskValue, OperatorError> {
        self.log.lock().push(format!("{}:run", self.name));
        if self.fail {
            return Err(OperatorError::Internal(format!("{} exploded", self.name)));
        }
        let mut value = input.into_json()?;
        let trail = value["trail"].as_str().unwrap_or_default().to_string();
        value["trail"] = json!(format!("{trail}{}", self.name));
        Ok(TaskValue::Json(value))
    }
}

/// Routes on the `"pick"` field.
struct Pick;

#[async_trait]
impl OperatorBase for Pick {
    fn metadata(&self) -> ViewMetadata {
        meta("pick")
    }
}

#[async_trait]
impl BranchOperator for Pick {
    async fn route(
        &self,
        input: TaskValue,
        _ctx: &DagContext,
    ) -> Result<FxHashMap<String, bool>, OperatorError> {
        let value = input.into_json()?;
        let pick = value["pick"].as_str().unwrap_or("a").to_string();
        let mut decision = FxHashMap::default();
        decision.insert("a".to_string(), pick == "a");
        decision.insert("b".to_string(), pick == "b");
        Ok(decision)
    }
}

/// Join reporting which ports were live; fires even inside a branch.
struct Merge;

#[async_trait]
impl OperatorBase for Merge {
    fn metadata(&self) -> ViewMetadata {
        meta("merge")
    }
}

#[async_trait]
impl JoinOperator for Merge {
    fn can_skip_in_branch(&self) -> bool {
        false
    }

    async fn combine(
        &self,
        inputs: Vec<TaskValue>,
        _ctx: &DagContext,
    ) -> Result<TaskValue, OperatorError> {
        let ports: Vec<Value> = inputs
            .into_iter()
            .map(|input| {
                if is_empty_data(&input) {
                    json!("skipped")
                } else {
                    input.into_json().unwrap_or(Value::Null)
                }
            })
            .collect();
        Ok(TaskValue::Json(json!({ "ports": ports })))
    }
}

fn branch_join_dag(log: &EventLog) -> Dag {
    let builder = DagBuilder::new();
    let source = builder
        .add_operator(
            "source",
            OperatorKind::InputSource(Arc::new(Source {
                name: "source".into(),
                log: log.clone(),
            })),
        )
        .unwrap();
    let pick = builder
        .add_operator("pick", OperatorKind::Branch(Arc::new(Pick)))
        .unwrap();
    let a = builder
        .add_operator("a", OperatorKind::Map(Arc::new(Tag::new("a", log))))
        .unwrap();
    let b = builder
        .add_operator("b", OperatorKind::Map(Arc::new(Tag::new("b", log))))
        .unwrap();
    let merge = builder
        .add_operator("merge", OperatorKind::Join(Arc::new(Merge)))
        .unwrap();

    let (a, b) = source >> pick >> (a, b);
    a >> merge.clone();
    b >> merge;
    builder.build().unwrap()
}

#[tokio::test]
async fn branch_skips_unchosen_arm_and_join_still_fires() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let dag = branch_join_dag(&log);

    let out = dag.call(json!({"pick": "b", "trail": ""})).await.unwrap();
    let ports = out["ports"].as_array().unwrap();
    assert_eq!(ports[0], json!("skipped"));
    assert_eq!(ports[1]["trail"], json!("b"));

    let events = log.lock().clone();
    assert!(events.contains(&"b:run".to_string()));
    assert!(!events.contains(&"a:run".to_string()));
    // Skipped operators get no end hook either.
    assert!(!events.contains(&"a:end".to_string()));
}

#[tokio::test]
async fn end_hooks_run_in_reverse_start_order() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let builder = DagBuilder::new();
    let first = builder
        .add_operator("first", OperatorKind::Map(Arc::new(Tag::new("first", &log))))
        .unwrap();
    let second = builder
        .add_operator(
            "second",
            OperatorKind::Map(Arc::new(Tag::new("second", &log))),
        )
        .unwrap();
    let third = builder
        .add_operator("third", OperatorKind::Map(Arc::new(Tag::new("third", &log))))
        .unwrap();
    let _ = first >> second >> third;
    let dag = builder.build().unwrap();

    dag.call(json!({"trail": ""})).await.unwrap();
    let events = log.lock().clone();
    let ends: Vec<&String> = events.iter().filter(|e| e.ends_with(":end")).collect();
    assert_eq!(ends, ["third:end", "second:end", "first:end"]);
}

#[tokio::test]
async fn failing_operator_aborts_but_hooks_still_run() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let builder = DagBuilder::new();
    let ok = builder
        .add_operator("ok", OperatorKind::Map(Arc::new(Tag::new("ok", &log))))
        .unwrap();
    let boom = builder
        .add_operator(
            "boom",
            OperatorKind::Map(Arc::new(Tag {
                name: "boom".into(),
                log: log.clone(),
                fail: true,
            })),
        )
        .unwrap();
    let after = builder
        .add_operator("after", OperatorKind::Map(Arc::new(Tag::new("after", &log))))
        .unwrap();
    let _ = ok >> boom >> after;
    let dag = builder.build().unwrap();

    let err = dag.call(json!({"trail": ""})).await.unwrap_err();
    assert!(matches!(err, OperatorError::Internal(_)));

    let events = log.lock().clone();
    assert!(!events.contains(&"after:run".to_string()));
    let ends: Vec<&String> = events.iter().filter(|e| e.ends_with(":end")).collect();
    // The failing operator started, so its hook runs too, LIFO.
    assert_eq!(ends, ["boom:end", "ok:end"]);
}

#[tokio::test]
async fn share_data_is_first_writer_wins() {
    struct Writer {
        name: String,
        value: Value,
    }

    #[async_trait]
    impl OperatorBase for Writer {
        fn metadata(&self) -> ViewMetadata {
            meta(&self.name)
        }
    }

    #[async_trait]
    impl MapOperator for Writer {
        async fn map(
            &self,
            input: TaskValue,
            ctx: &DagContext,
        ) -> Result<TaskValue, OperatorError> {
            ctx.save_to_share_data("claim", self.value.clone(), false);
            Ok(input)
        }
    }

    struct Reader;

    #[async_trait]
    impl OperatorBase for Reader {
        fn metadata(&self) -> ViewMetadata {
            meta("reader")
        }
    }

    #[async_trait]
    impl MapOperator for Reader {
        async fn map(
            &self,
            _input: TaskValue,
            ctx: &DagContext,
        ) -> Result<TaskValue, OperatorError> {
            let claim = ctx
                .get_from_share_data("claim")
                .ok_or_else(|| OperatorError::MissingInput {
                    what: "claim".into(),
                })?;
            Ok(TaskValue::Json(claim))
        }
    }

    let builder = DagBuilder::new();
    let w1 = builder
        .add_operator(
            "w1",
            OperatorKind::Map(Arc::new(Writer {
                name: "w1".into(),
                value: json!("first"),
            })),
        )
        .unwrap();
    let w2 = builder
        .add_operator(
            "w2",
            OperatorKind::Map(Arc::new(Writer {
                name: "w2".into(),
                value: json!("second"),
            })),
        )
        .unwrap();
    let reader = builder
        .add_operator("reader", OperatorKind::Map(Arc::new(Reader)))
        .unwrap();
    let _ = w1 >> w2 >> reader;
    let dag = builder.build().unwrap();

    let out = dag.call(json!(null)).await.unwrap();
    assert_eq!(out, json!("first"));
}

#[tokio::test]
async fn sub_dag_shares_data_and_defers_child_hooks() {
    let child_log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let child_builder = DagBuilder::new();
    child_builder
        .add_operator(
            "inner",
            OperatorKind::Map(Arc::new(Tag::new("inner", &child_log))),
        )
        .unwrap();
    let child = Arc::new(child_builder.build().unwrap());

    let parent_log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let builder = DagBuilder::new();
    let pre = builder
        .add_operator(
            "pre",
            OperatorKind::Map(Arc::new(Tag::new("pre", &parent_log))),
        )
        .unwrap();
    let nested = builder
        .add_operator(
            "nested",
            OperatorKind::Map(Arc::new(SubDagOperator::new(child, meta("nested")))),
        )
        .unwrap();
    let post = builder
        .add_operator(
            "post",
            OperatorKind::Map(Arc::new(Tag::new("post", &parent_log))),
        )
        .unwrap();
    let _ = pre >> nested >> post;
    let dag = builder.build().unwrap();

    let out = dag.call(json!({"trail": ""})).await.unwrap();
    assert_eq!(out["trail"], json!("preinnerpost"));

    // The child's hook fired exactly once, driven by the parent wind-down.
    let child_ends: Vec<String> = child_log
        .lock()
        .iter()
        .filter(|e| e.ends_with(":end"))
        .cloned()
        .collect();
    assert_eq!(child_ends, ["inner:end"]);
}

/// Emits a fixed number of JSON frames and logs its end hook.
struct FrameSource {
    log: EventLog,
}

#[async_trait]
impl OperatorBase for FrameSource {
    fn metadata(&self) -> ViewMetadata {
        meta("frames")
    }

    async fn after_dag_end(&self, _ctx: &DagContext) -> Result<(), OperatorError> {
        self.log.lock().push("frames:end".to_string());
        Ok(())
    }
}

#[async_trait]
impl MapOperator for FrameSource {
    async fn map(&self, _input: TaskValue, _ctx: &DagContext) -> Result<TaskValue, OperatorError> {
        let frames: Vec<Result<Value, OperatorError>> = (0..100).map(|i| Ok(json!(i))).collect();
        Ok(TaskValue::Stream(Box::pin(futures_util::stream::iter(
            frames,
        ))))
    }
}

fn frame_dag(log: &EventLog) -> Arc<Dag> {
    let builder = DagBuilder::new();
    builder
        .add_operator(
            "frames",
            OperatorKind::Map(Arc::new(FrameSource { log: log.clone() })),
        )
        .unwrap();
    Arc::new(builder.build().unwrap())
}

#[tokio::test]
async fn consumed_stream_runs_hooks_after_last_frame() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let dag = frame_dag(&log);

    let stream = dag.call_streaming(json!(null)).await.unwrap();
    let frames: Vec<Value> = stream.map(|frame| frame.unwrap()).collect().await;
    assert_eq!(frames.len(), 100);
    assert!(log.lock().contains(&"frames:end".to_string()));
}

#[tokio::test]
async fn dropped_stream_consumer_cancels_and_runs_hooks() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let dag = frame_dag(&log);

    let mut stream = dag.call_streaming(json!(null)).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, json!(0));
    drop(stream);

    // The wind-down runs on a spawned task.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(log.lock().contains(&"frames:end".to_string()));
}

#[test]
fn build_rejects_cycles_and_duplicates() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let builder = DagBuilder::new();
    let a = builder
        .add_operator("a", OperatorKind::Map(Arc::new(Tag::new("a", &log))))
        .unwrap();
    assert!(matches!(
        builder.add_operator("a", OperatorKind::Map(Arc::new(Tag::new("a", &log)))),
        Err(DagError::DuplicateNode { .. })
    ));
    let b = builder
        .add_operator("b", OperatorKind::Map(Arc::new(Tag::new("b", &log))))
        .unwrap();
    let _ = a.clone() >> b.clone();
    let _ = b >> a;
    assert!(matches!(builder.build(), Err(DagError::Cycle { .. })));
}

#[test]
fn build_requires_a_single_terminal() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let builder = DagBuilder::new();
    let root = builder
        .add_operator("root", OperatorKind::Map(Arc::new(Tag::new("root", &log))))
        .unwrap();
    let left = builder
        .add_operator("left", OperatorKind::Map(Arc::new(Tag::new("left", &log))))
        .unwrap();
    let right = builder
        .add_operator("right", OperatorKind::Map(Arc::new(Tag::new("right", &log))))
        .unwrap();
    let _ = root >> (left, right);
    assert!(matches!(
        builder.build(),
        Err(DagError::AmbiguousTerminal { .. })
    ));
}
