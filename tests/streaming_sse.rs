//! SSE stream ordering, including the mid-stream failure path.

use futures_util::StreamExt;
use serde_json::Value;

use awel::dag::context::DagContext;
use awel::model::{MediaContent, ModelOutput};
use awel::operator::{OperatorError, StreamOperator};
use awel::streaming::sse::{parse_sse_data, OpenAiStreamOperator, SSE_DONE};
use awel::types::TaskStream;

fn delta(text: &str) -> Result<Value, OperatorError> {
    serde_json::to_value(ModelOutput {
        content: vec![MediaContent::text(text)],
        incremental: true,
        ..Default::default()
    })
    .map_err(OperatorError::Serde)
}

fn frames(items: Vec<Result<Value, OperatorError>>) -> TaskStream {
    Box::pin(futures_util::stream::iter(items))
}

async fn run_sse(input: TaskStream) -> Vec<String> {
    let op = OpenAiStreamOperator::new("mock/model");
    let ctx = DagContext::new(true);
    let out = op.transform(input, &ctx).await.unwrap();
    out.map(|frame| {
        frame
            .unwrap()
            .as_str()
            .expect("sse frames are strings")
            .to_string()
    })
    .collect()
    .await
}

#[tokio::test]
async fn successful_stream_ends_with_finish_and_done() {
    let sse = run_sse(frames(vec![delta("Hello"), delta(" world")])).await;

    // Head frame announces the assistant role.
    assert!(sse[0].contains("\"role\":\"assistant\""));
    assert!(sse[1].contains("Hello"));
    assert!(sse[2].contains(" world"));
    let finish = &sse[sse.len() - 2];
    assert!(finish.contains("\"finish_reason\":\"stop\""));
    assert_eq!(sse.last().map(String::as_str), Some(SSE_DONE));
}

#[tokio::test]
async fn mid_stream_error_becomes_error_frame_then_done() {
    let failure = serde_json::to_value(ModelOutput::failure(1, "upstream failed")).unwrap();
    let sse = run_sse(frames(vec![
        delta("partial"),
        Ok(failure),
        delta("never sent"),
    ]))
    .await;

    let error_idx = sse
        .iter()
        .position(|f| f.contains("upstream failed"))
        .expect("error frame present");
    assert!(sse[error_idx].contains("\"code\":1"));
    // The sentinel follows the error frame and nothing follows the
    // sentinel.
    assert_eq!(sse[error_idx + 1], SSE_DONE);
    assert_eq!(sse.len(), error_idx + 2);
    assert!(!sse.iter().any(|f| f.contains("never sent")));
}

#[tokio::test]
async fn cumulative_frames_still_yield_deltas() {
    let snapshots: TaskStream = Box::pin(async_stream::stream! {
        for text in ["Hel", "Hello"] {
            yield Ok(serde_json::to_value(ModelOutput::success(text)).unwrap());
        }
    });
    let sse = run_sse(snapshots).await;

    assert!(sse[1].contains("\"content\":\"Hel\""));
    assert!(sse[2].contains("\"content\":\"lo\""));
}

#[test]
fn every_emitted_frame_parses_back() {
    for raw in [
        "data: {\"choices\":[]}\n\n",
        "data: [DONE]\n\n",
        "data:[DONE]",
    ] {
        assert!(parse_sse_data(raw).is_some());
    }
    assert_eq!(parse_sse_data(SSE_DONE), Some("[DONE]"));
}
