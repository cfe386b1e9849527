// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the newline-delimited JSON request server.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::*;
use dispatch_core::server::{self, ResponseLine};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

/// Feed `input` to a server and collect its raw output lines.
async fn serve_lines(ctx: &TestContext, input: &str) -> Vec<String> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mut client, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);

    let state = ctx.runtime.state().clone();
    let handle = tokio::spawn(server::serve(
        state,
        BufReader::new(server_read),
        server_write,
        shutdown_rx,
    ));

    client.write_all(input.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    let mut output = Vec::new();
    let mut lines = BufReader::new(client).lines();
    while let Some(line) = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("server answered in time")
        .unwrap()
    {
        output.push(line);
    }

    handle.await.unwrap().unwrap();
    output
}

/// Feed `input` to a server and collect its responses keyed by request id.
async fn run_server(ctx: &TestContext, input: &str) -> HashMap<String, ResponseLine> {
    let mut responses = HashMap::new();
    for line in serve_lines(ctx, input).await {
        let response: ResponseLine = serde_json::from_str(&line).unwrap();
        let id = match &response.id {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => "-".to_string(),
        };
        responses.insert(id, response);
    }
    responses
}

#[tokio::test]
async fn test_serves_process_requests() {
    let ctx = TestContext::new().await;

    let input = concat!(
        r#"{"id":"a","op":"process","payload":"hello world","task_kind":"uppercase"}"#,
        "\n",
        r#"{"id":"b","op":"process","payload":[1,2]}"#,
        "\n",
        "\n",
        r#"{"id":"c","op":"process","payload":5,"task_kind":"uppercase"}"#,
        "\n",
    );
    let responses = run_server(&ctx, input).await;
    assert_eq!(responses.len(), 3);

    assert_eq!(
        responses["a"].result,
        Some(json!({"task_id": "-", "task_status": "Success", "outcome": "HELLO WORLD"}))
    );
    assert_eq!(
        responses["b"].result.as_ref().unwrap()["outcome"]["count"],
        json!(2)
    );
    let error = responses["c"].error.as_ref().unwrap();
    assert_eq!(error.code, "INVALID_INPUT");
}

#[tokio::test]
async fn test_replayed_response_is_byte_identical() {
    let ctx = TestContext::new().await;

    let first = serve_lines(
        &ctx,
        "{\"id\":1,\"op\":\"process\",\"payload\":2,\"task_kind\":\"square\",\"idempotency_key\":\"k\"}\n",
    )
    .await;
    let second = serve_lines(
        &ctx,
        "{\"id\":1,\"op\":\"process\",\"payload\":3,\"task_kind\":\"square\",\"idempotency_key\":\"k\"}\n",
    )
    .await;

    assert_eq!(first.len(), 1);
    assert_eq!(first, second);
    assert_eq!(
        serde_json::from_str::<Value>(&first[0]).unwrap(),
        json!({"id": 1, "result": {"task_id": "-", "task_status": "Success", "outcome": 4}})
    );

    // Async acceptances replay the same task id, also without any marker.
    let submit = "{\"id\":\"a\",\"op\":\"process_async\",\"payload\":\"x\",\"task_kind\":\"uppercase\",\"idempotency_key\":\"k\"}\n";
    let accepted = serve_lines(&ctx, submit).await;
    let again = serve_lines(&ctx, submit).await;
    assert_eq!(accepted, again);
    assert!(!again[0].contains("replayed"));
}

#[tokio::test]
async fn test_async_task_can_be_polled() {
    let ctx = TestContext::new().await;

    let accepted = run_server(
        &ctx,
        "{\"id\":\"submit\",\"op\":\"process_async\",\"payload\":\"abc\",\"task_kind\":\"reverse\"}\n",
    )
    .await;
    let result = accepted["submit"].result.clone().unwrap();
    assert_eq!(result["task_status"], json!("Processing"));
    let task_id = result["task_id"].as_str().unwrap().to_string();

    let ctx_ref = &ctx;
    let task_id_ref = task_id.as_str();
    let status = eventually("task to finish", || async move {
        let line = format!("{{\"id\":\"poll\",\"op\":\"status\",\"task_id\":\"{task_id_ref}\"}}\n");
        let mut responses = run_server(ctx_ref, &line).await;
        let result = responses.remove("poll")?.result?;
        (result["task_status"] != json!("Processing")).then_some(result)
    })
    .await;
    assert_eq!(status["task_status"], json!("Success"));
    assert_eq!(status["outcome"], json!("cba"));
}

#[tokio::test]
async fn test_bad_lines_get_error_responses() {
    let ctx = TestContext::new().await;

    let input = concat!(
        "{\"id\":\"x\",\"op\":\"explode\"}\n",
        "not json at all\n",
        "{\"id\":\"s\",\"op\":\"status\",\"task_id\":\"nope\"}\n",
        "{\"id\":\"h\",\"op\":\"health\"}\n",
    );
    let responses = run_server(&ctx, input).await;

    assert_eq!(responses["x"].error.as_ref().unwrap().code, "VALIDATION_ERROR");
    assert_eq!(responses["-"].error.as_ref().unwrap().code, "VALIDATION_ERROR");
    assert_eq!(responses["s"].error.as_ref().unwrap().code, "VALIDATION_ERROR");
    assert_eq!(
        responses["h"].result,
        Some(json!({"healthy": true, "pending_calls": 0}))
    );
}

#[tokio::test]
async fn test_metrics_op_reports_json_and_prometheus() {
    let ctx = TestContext::new().await;

    let processed = run_server(
        &ctx,
        "{\"id\":\"p\",\"op\":\"process\",\"payload\":2,\"task_kind\":\"double\"}\n",
    )
    .await;
    assert_eq!(processed["p"].result.as_ref().unwrap()["outcome"], json!(4));

    let input = concat!(
        "{\"id\":\"m\",\"op\":\"metrics\"}\n",
        "{\"id\":\"t\",\"op\":\"metrics\",\"format\":\"prometheus\"}\n",
    );
    let responses = run_server(&ctx, input).await;

    let report = responses["m"].result.clone().unwrap();
    assert_eq!(report["rpc"]["latency_seconds"]["count"], json!(1));
    assert_eq!(report["rpc"]["timeouts_total"], json!(0));
    assert_eq!(
        report["queues"]["data_queue"],
        json!({"messages": 0, "consumers": 2})
    );
    assert_eq!(
        report["queues"]["data_queue_dlq"],
        json!({"messages": 0, "consumers": 0})
    );

    let text = responses["t"].result.clone().unwrap();
    let text = text.as_str().unwrap();
    assert!(text.contains("dispatch_rpc_latency_seconds_count 1"));
    assert!(text.contains("dispatch_rpc_timeouts_total 0"));
    assert!(text.contains(r#"dispatch_queue_messages{queue="data_queue_dlq"} 0"#));
}

