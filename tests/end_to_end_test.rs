#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        extract::State,
        http::{header, Request, StatusCode},
        response::{IntoResponse, Response},
        routing::post,
        Json, Router,
    };
    use clap::Parser;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use toolshim::*;
    use tower::util::ServiceExt;

    const SYSTEM_PROMPT: &str = "You are a coding assistant.\n\n# Tools\n\n## read_file\nDescription: Read a file.\nParameters:\n- path: (required) The path of the file\n\n## write_to_file\nDescription: Write a file.\nParameters:\n- path: (required) Target path\n- content: (required) File content\n\n# Rules\n\nOne tool per message.";

    #[derive(Clone)]
    struct MockUpstream {
        status: StatusCode,
        content_type: &'static str,
        body: String,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    async fn mock_completions(State(mock): State<MockUpstream>, Json(request): Json<Value>) -> Response {
        mock.seen.lock().await.push(request);
        (
            mock.status,
            [(header::CONTENT_TYPE, mock.content_type)],
            mock.body.clone(),
        )
            .into_response()
    }

    /// Serves `body` for every completions request; returns the base URL and the requests seen.
    async fn spawn_upstream(
        status: StatusCode,
        content_type: &'static str,
        body: String,
    ) -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mock = MockUpstream {
            status,
            content_type,
            body,
            seen: seen.clone(),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(mock_completions))
            .with_state(mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn sse(events: &[Value]) -> String {
        let mut body = String::new();
        for event in events {
            body.push_str(&format!("data: {}\n\n", event));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn shim(upstream: &str, extra: &[&str]) -> Router {
        let mut argv = vec!["toolshim", "--upstream", upstream, "--model", "gpt-oss-20b"];
        argv.extend_from_slice(extra);
        let state = AppState::new(Args::parse_from(argv)).unwrap();
        build_router(Arc::new(state))
    }

    fn chat_request(stream: bool) -> Request<Body> {
        let body = json!({
            "stream": stream,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": "Show me src/main.rs\n\n# Current Mode\nACT MODE"}
            ]
        });
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Splits an SSE body into its `data:` payloads.
    async fn sse_payloads(response: Response) -> Vec<String> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .filter_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:")))
            .map(|l| l.trim().to_string())
            .collect()
    }

    fn joined_content(payloads: &[String]) -> String {
        payloads
            .iter()
            .filter(|p| p.as_str() != "[DONE]")
            .filter_map(|p| serde_json::from_str::<Value>(p).ok())
            .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_streamed_tool_call_becomes_xml() {
        let upstream_events = vec![
            json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]}),
            json!({"choices": [{"index": 0, "delta": {"reasoning_content": "User wants the file."}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function", "function": {"name": "read_file", "arguments": ""}}]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"path\":"}}]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"src/main.rs\"}"}}]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ];
        let (url, seen) = spawn_upstream(StatusCode::OK, "text/event-stream", sse(&upstream_events)).await;

        let response = shim(&url, &[]).oneshot(chat_request(true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let payloads = sse_payloads(response).await;
        assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
        assert_eq!(payloads.iter().filter(|p| p.as_str() == "[DONE]").count(), 1);
        let first: Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["model"], "gpt-oss-20b");
        assert_eq!(
            joined_content(&payloads),
            "<read_file><path>src/main.rs</path></read_file>"
        );

        let requests = seen.lock().await;
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert_eq!(sent["model"], "gpt-oss-20b");
        let tool_names: Vec<&str> = sent["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["function"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(tool_names, vec!["read_file", "write_to_file"]);
    }

    #[tokio::test]
    async fn test_streamed_text_is_relayed_in_order() {
        let upstream_events = vec![
            json!({"choices": [{"delta": {"content": "Hello "}}]}),
            json!({"choices": [{"delta": {"content": "there.\nNext"}}]}),
            json!({"choices": [{"delta": {"content": " line"}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        ];
        let (url, _) = spawn_upstream(StatusCode::OK, "text/event-stream", sse(&upstream_events)).await;

        let payloads = sse_payloads(shim(&url, &[]).oneshot(chat_request(true)).await.unwrap()).await;
        assert_eq!(joined_content(&payloads), "Hello there.\nNext line");

        let last_chunk: Value = serde_json::from_str(&payloads[payloads.len() - 2]).unwrap();
        assert_eq!(last_chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(last_chunk["choices"][0]["delta"]["content"], " line");
    }

    #[tokio::test]
    async fn test_empty_stream_synthesizes_question() {
        let upstream_events = vec![json!({"choices": [{"delta": {"role": "assistant"}}]})];
        let (url, _) = spawn_upstream(StatusCode::OK, "text/event-stream", sse(&upstream_events)).await;

        let app = shim(
            &url,
            &["--synthesize-empty-xml", "--fallback-question", "Try again?"],
        );
        let payloads = sse_payloads(app.oneshot(chat_request(true)).await.unwrap()).await;
        assert_eq!(
            joined_content(&payloads),
            "<ask_followup_question><question>Try again?</question></ask_followup_question>"
        );
        assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    }

    #[tokio::test]
    async fn test_failing_upstream_still_yields_terminated_stream() {
        let (url, _) = spawn_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            "model crashed".to_string(),
        )
        .await;

        let response = shim(&url, &[]).oneshot(chat_request(true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payloads = sse_payloads(response).await;
        assert_eq!(joined_content(&payloads), " ");
        assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_still_yields_terminated_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let payloads = sse_payloads(
            shim(&url, &["--synthesize-empty-xml"])
                .oneshot(chat_request(true))
                .await
                .unwrap(),
        )
        .await;
        assert!(joined_content(&payloads).starts_with("<ask_followup_question>"));
        assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    }

    #[tokio::test]
    async fn test_one_shot_tool_calls_are_folded_into_content() {
        let upstream = json!({
            "id": "chatcmpl-up",
            "object": "chat.completion",
            "model": "gpt-oss-20b",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Writing it now.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "write_to_file", "arguments": "{\"content\":\"fn main() {}\",\"path\":\"src/main.rs\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let (url, _) = spawn_upstream(StatusCode::OK, "application/json", upstream.to_string()).await;

        let response = shim(&url, &[]).oneshot(chat_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        let choice = &body["choices"][0];
        assert_eq!(
            choice["message"]["content"],
            "Writing it now.<write_to_file><path>src/main.rs</path><content>fn main() {}</content></write_to_file>"
        );
        assert!(choice["message"].get("tool_calls").is_none());
        assert_eq!(choice["finish_reason"], "stop");
        assert_eq!(body["id"], "chatcmpl-up");
    }

    #[tokio::test]
    async fn test_one_shot_invalid_upstream_json_is_bad_gateway() {
        let (url, _) = spawn_upstream(StatusCode::OK, "application/json", "{truncated".to_string()).await;
        let response = shim(&url, &[]).oneshot(chat_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "bad_upstream_json");
    }

    #[tokio::test]
    async fn test_one_shot_without_choices_passes_through_with_status() {
        let upstream = json!({"error": {"message": "context too long"}});
        let (url, _) = spawn_upstream(StatusCode::BAD_REQUEST, "application/json", upstream.to_string()).await;
        let response = shim(&url, &[]).oneshot(chat_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, upstream);
    }

    #[tokio::test]
    async fn test_composer_settings_reach_upstream() {
        let upstream = json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}]});
        let (url, seen) = spawn_upstream(StatusCode::OK, "application/json", upstream.to_string()).await;

        let app = shim(
            &url,
            &[
                "--force-tool-choice-none",
                "--inject-guardrail",
                "--strip-client-sampling",
                "--sampling-overrides",
                r#"{"temperature":0.3}"#,
                "--act-sampling-overrides",
                r#"{"top_k":20}"#,
                "--no-extract-tools",
            ],
        );
        let response = app.oneshot(chat_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let requests = seen.lock().await;
        let sent = &requests[0];
        assert_eq!(sent["tool_choice"], "none");
        assert_eq!(sent["temperature"], 0.3);
        assert_eq!(sent["top_k"], 20);
        assert!(sent.get("tools").is_none());
        let messages = sent["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "system");
        assert!(messages[1]["content"].as_str().unwrap().contains("one tool per message"));
    }

    #[tokio::test]
    async fn test_diagnostic_tees_capture_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let up = dir.path().join("upstream.log");
        let down = dir.path().join("downstream.log");
        let events = vec![json!({"choices": [{"delta": {"content": "hi\n"}}]})];
        let (url, _) = spawn_upstream(StatusCode::OK, "text/event-stream", sse(&events)).await;

        let app = shim(
            &url,
            &[
                "--dump-upstream",
                up.to_str().unwrap(),
                "--dump-downstream",
                down.to_str().unwrap(),
            ],
        );
        let payloads = sse_payloads(app.oneshot(chat_request(true)).await.unwrap()).await;
        assert_eq!(joined_content(&payloads), "hi\n");

        let up_text = std::fs::read_to_string(&up).unwrap();
        assert!(up_text.lines().all(|l| l.starts_with("[chatcmpl-")));
        assert!(up_text.contains("data: [DONE]"));
        let down_text = std::fs::read_to_string(&down).unwrap();
        assert!(down_text.lines().last().unwrap().ends_with("data: [DONE]"));
        assert_eq!(down_text.lines().count(), payloads.len());
    }
}
