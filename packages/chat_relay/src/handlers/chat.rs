use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

use crate::AppState;
use crate::attachments::render_attachments_blocking;
use crate::error::{ProducerError, RelayError};
use crate::history::SessionKey;
use crate::phase::{TurnLifecycle, TurnPhase};
use crate::producer::{ChatMessage, FragmentStream, Prompt};
use crate::relay::{HistoryRecord, RelayJob, event_stream_response, gated_events, spawn_relay};
use crate::turn::TurnRequest;
use crate::variant::Variant;

/// POST /api/chat - relay a turn to the default variant
pub async fn chat_handler(
    State(state): State<AppState>,
    turn: Result<TurnRequest, RelayError>,
) -> Response {
    let variant = state.variants.default_variant();
    relay_turn(state, variant, turn).await
}

/// POST /api/variants/{name}/chat - relay a turn to a named variant
pub async fn variant_chat_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    turn: Result<TurnRequest, RelayError>,
) -> Response {
    let Some(variant) = state.variants.get(&name) else {
        state.metrics.turn_received();
        state.metrics.turn_rejected();
        return RelayError::UnknownVariant(name).into_response();
    };
    relay_turn(state, variant, turn).await
}

async fn relay_turn(
    state: AppState,
    variant: Arc<Variant>,
    turn: Result<TurnRequest, RelayError>,
) -> Response {
    state.metrics.turn_received();
    let mut lifecycle = TurnLifecycle::new(variant.name.clone());

    let turn = match turn.and_then(|turn| turn.validate(&variant).map(|_| turn)) {
        Ok(turn) => turn,
        Err(e) => return reject(lifecycle, &state, e),
    };
    lifecycle.advance(TurnPhase::Validated);

    if let Some(gate) = &variant.gate {
        if !gate.admits(&turn.message) {
            lifecycle.advance(TurnPhase::Gated);
            state.metrics.turn_gated();
            info!(
                turn_id = %lifecycle.turn_id,
                variant = %variant.name,
                "Message outside the variant's topic; sending refusal"
            );
            lifecycle.advance(TurnPhase::Completed);
            return event_stream_response(gated_events(gate.refusal()));
        }
    }
    lifecycle.advance(TurnPhase::Forwarding);

    info!(
        turn_id = %lifecycle.turn_id,
        variant = %variant.name,
        attachments = turn.attachments.len(),
        session = turn.session_id.as_deref().unwrap_or("-"),
        "Forwarding turn to {}",
        state.producer.name()
    );

    let opened = match open_upstream(&state, &variant, turn).await {
        Ok(opened) => opened,
        Err(e) => return reject(lifecycle, &state, e),
    };

    let (events, _relay) = spawn_relay(RelayJob {
        lifecycle,
        fragments: opened.fragments,
        record: opened.record,
        metrics: state.metrics.clone(),
        shutdown: state.shutdown.clone(),
        deadline: opened.deadline,
        channel_capacity: state.relay.channel_capacity,
    });
    event_stream_response(events)
}

struct OpenedTurn {
    fragments: FragmentStream,
    record: Option<HistoryRecord>,
    deadline: Option<Instant>,
}

/// Assemble the prompt and open the producer. Nothing has been written yet.
async fn open_upstream(
    state: &AppState,
    variant: &Variant,
    turn: TurnRequest,
) -> Result<OpenedTurn, RelayError> {
    let sections = render_attachments_blocking(turn.attachments.clone()).await?;
    let user_content = turn.user_content(&sections);
    if user_content.is_empty() {
        return Err(RelayError::Validation(
            "nothing to send: the message is empty and no attachment could be read".to_string(),
        ));
    }

    let key = turn
        .session_id
        .as_ref()
        .map(|session| SessionKey::new(variant.name.clone(), session.clone()));

    let mut messages = vec![ChatMessage::system(variant.system_prompt.clone())];
    if let (Some(store), Some(key)) = (&state.history, &key) {
        messages.extend(store.history(key).await);
    }
    messages.push(ChatMessage::user(user_content.clone()));

    let deadline = state.relay.request_timeout.map(|t| Instant::now() + t);
    let open = state.producer.open(Prompt { messages });
    let fragments = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, open)
            .await
            .map_err(|_| ProducerError::Timeout)??,
        None => open.await?,
    };

    let record = match (&state.history, key) {
        (Some(store), Some(key)) => Some(HistoryRecord {
            store: store.clone(),
            key,
            user: user_content,
        }),
        _ => None,
    };

    Ok(OpenedTurn {
        fragments,
        record,
        deadline,
    })
}

fn reject(mut lifecycle: TurnLifecycle, state: &AppState, error: RelayError) -> Response {
    lifecycle.advance(TurnPhase::Rejected);
    state.metrics.turn_rejected();
    info!(
        turn_id = %lifecycle.turn_id,
        variant = %lifecycle.variant,
        code = error.error_code(),
        "Turn rejected: {}",
        error
    );
    error.into_response()
}

#[cfg(test)]
mod tests {
    use crate::build_router;
    use crate::config::RelayFileConfig;
    use crate::error::ProducerError;
    use crate::producer::{ChatMessage, Role};
    use crate::test_helpers::{ScriptedProducer, Step, test_state, test_state_with};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
    use futures::StreamExt;
    use relay_wire::{Event, Transcript, consume};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "chat-test-boundary";

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(uri: &str, message: &str, files: &[(&str, &[u8])]) -> Request<Body> {
        let mut body: Vec<u8> = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"message\"\r\n\r\n{message}\r\n"
            )
            .as_bytes(),
        );
        for (name, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn events_of(response: axum::response::Response) -> Vec<Event> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let mut decoder = relay_wire::EventDecoder::default();
        let events = decoder.push(&bytes).unwrap();
        decoder.finish().unwrap();
        events
    }

    async fn error_of(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn streams_fragments_in_order_then_terminator() {
        let producer = Arc::new(ScriptedProducer::fragments(&["Hel", "", "lo"]));
        let app = build_router(test_state(producer.clone()));

        let response = app
            .oneshot(json_request("/api/chat", serde_json::json!({ "message": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");

        let events = events_of(response).await;
        assert_eq!(
            events,
            vec![
                Event::fragment("Hel"),
                Event::fragment(""),
                Event::fragment("lo"),
                Event::Terminator,
            ]
        );
        let transcript = Transcript::reconstruct(&events).unwrap();
        assert_eq!(transcript.text(), "Hello");
        assert_eq!(producer.opens(), 1);
    }

    #[tokio::test]
    async fn prompt_carries_the_variant_system_prompt() {
        let producer = Arc::new(ScriptedProducer::fragments(&["ok"]));
        let state = test_state(producer.clone());
        let system_prompt = state.variants.get("dating").unwrap().system_prompt.clone();
        let app = build_router(state);

        let response = app
            .oneshot(json_request(
                "/api/variants/dating/chat",
                serde_json::json!({ "message": "first date ideas?" }),
            ))
            .await
            .unwrap();
        events_of(response).await;

        let prompt = &producer.prompts()[0];
        assert_eq!(prompt.messages[0], ChatMessage::system(system_prompt));
        assert_eq!(prompt.messages[1], ChatMessage::user("first date ideas?"));
    }

    #[tokio::test]
    async fn travel_plan_scenario() {
        let producer = Arc::new(ScriptedProducer::fragments(&[
            "# Travel Plan",
            " for Paris",
            "\n\n## Day 1",
        ]));
        let app = build_router(test_state(producer.clone()));

        let response = app
            .oneshot(json_request(
                "/api/variants/travel/chat",
                serde_json::json!({ "message": "Plan a trip to Paris for 3 days" }),
            ))
            .await
            .unwrap();
        let events = events_of(response).await;
        assert_eq!(events.last(), Some(&Event::Terminator));
        let text = Transcript::reconstruct(&events).unwrap().into_text();
        assert!(text.starts_with("# Travel Plan for Paris"));
        assert_eq!(producer.opens(), 1);
    }

    #[tokio::test]
    async fn gate_refuses_without_contacting_producer() {
        let producer = Arc::new(ScriptedProducer::fragments(&["should not be sent"]));
        let state = test_state(producer.clone());
        let refusal = state
            .variants
            .get("travel")
            .unwrap()
            .gate
            .as_ref()
            .unwrap()
            .refusal()
            .to_string();
        let metrics = state.metrics.clone();
        let app = build_router(state);

        let response = app
            .oneshot(json_request(
                "/api/variants/travel/chat",
                serde_json::json!({ "message": "what's the weather" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events = events_of(response).await;
        assert_eq!(events, vec![Event::fragment(refusal), Event::Terminator]);
        assert_eq!(producer.opens(), 0);
        assert_eq!(metrics.snapshot().turns.gated, 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_any_event() {
        let producer = Arc::new(ScriptedProducer::fragments(&["x"]));
        let app = build_router(test_state(producer.clone()));

        let response = app
            .oneshot(json_request("/api/chat", serde_json::json!({ "message": "  " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body = error_of(response).await;
        assert_eq!(body["code"], "validation_failed");
        assert_eq!(producer.opens(), 0);
    }

    #[tokio::test]
    async fn unknown_variant_is_not_found() {
        let producer = Arc::new(ScriptedProducer::fragments(&["x"]));
        let app = build_router(test_state(producer));

        let response = app
            .oneshot(json_request(
                "/api/variants/chef/chat",
                serde_json::json!({ "message": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_of(response).await["code"], "unknown_variant");
    }

    #[tokio::test]
    async fn attachments_are_labelled_in_the_prompt() {
        let producer = Arc::new(ScriptedProducer::fragments(&["Noted."]));
        let app = build_router(test_state(producer.clone()));

        let response = app
            .oneshot(multipart_request(
                "/api/variants/travel/chat",
                "Use my notes for the trip",
                &[("a.txt", &b"hello"[..]), ("a.xyz", &b"\x00\x01binary"[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        events_of(response).await;

        let prompt = &producer.prompts()[0];
        let user = prompt.messages.last().unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(
            user.content,
            "Use my notes for the trip\n\n--- File: a.txt ---\nhello"
        );
    }

    #[tokio::test]
    async fn attachment_without_message_reaches_the_producer() {
        let producer = Arc::new(ScriptedProducer::fragments(&["Got it."]));
        let app = build_router(test_state(producer.clone()));

        let response = app
            .oneshot(multipart_request("/api/chat", "", &[("a.txt", &b"hello"[..])]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            events_of(response).await,
            vec![Event::fragment("Got it."), Event::Terminator]
        );

        assert_eq!(producer.opens(), 1);
        let prompt = &producer.prompts()[0];
        let user = prompt.messages.last().unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "--- File: a.txt ---\nhello");
    }

    #[tokio::test]
    async fn attachments_on_plain_variant_are_rejected() {
        let producer = Arc::new(ScriptedProducer::fragments(&["x"]));
        let app = build_router(test_state(producer.clone()));

        let response = app
            .oneshot(multipart_request(
                "/api/variants/dating/chat",
                "read this",
                &[("a.txt", &b"hello"[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(producer.opens(), 0);
    }

    #[tokio::test]
    async fn unreadable_attachment_fails_the_turn() {
        let producer = Arc::new(ScriptedProducer::fragments(&["x"]));
        let app = build_router(test_state(producer.clone()));

        let response = app
            .oneshot(multipart_request(
                "/api/variants/travel/chat",
                "trip notes attached",
                &[("notes.txt", &b"\xff\xfe\xfd"[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = error_of(response).await;
        assert_eq!(body["code"], "file_processing_failed");
        assert!(body["error"].as_str().unwrap().contains("notes.txt"));
        assert_eq!(producer.opens(), 0);
    }

    #[tokio::test]
    async fn oversized_attachment_is_payload_too_large() {
        let producer = Arc::new(ScriptedProducer::fragments(&["x"]));
        let relay = RelayFileConfig {
            max_attachment_bytes: 8,
            ..Default::default()
        };
        let app = build_router(test_state_with(producer.clone(), relay));

        let response = app
            .oneshot(multipart_request(
                "/api/variants/travel/chat",
                "trip",
                &[("big.txt", &b"far more than eight bytes"[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(producer.opens(), 0);
    }

    #[tokio::test]
    async fn producer_failure_before_streaming_is_bad_gateway() {
        let producer = Arc::new(ScriptedProducer::failing_open(ProducerError::Api {
            status: 401,
            message: "bad key".into(),
        }));
        let app = build_router(test_state(producer));

        let response = app
            .oneshot(json_request("/api/chat", serde_json::json!({ "message": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(error_of(response).await["code"], "upstream_rejected");
    }

    #[tokio::test]
    async fn producer_failure_mid_stream_aborts_the_body() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            Step::fragment("partial"),
            Step::Fail(ProducerError::UnexpectedEof),
        ]));
        let app = build_router(test_state(producer));

        let response = app
            .oneshot(json_request("/api/chat", serde_json::json!({ "message": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut seen = Vec::new();
        let outcome = consume(response.into_body().into_data_stream(), |f| {
            seen.push(f.to_string())
        })
        .await;
        assert!(!outcome.is_completed());
        assert_eq!(seen, vec!["partial"]);
        assert_eq!(outcome.display_text(), relay_wire::FALLBACK_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_aborts_without_terminator() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            Step::fragment("thinking"),
            Step::Delay(Duration::from_secs(600)),
            Step::fragment("too late"),
        ]));
        let relay = RelayFileConfig {
            request_timeout_secs: 5,
            ..Default::default()
        };
        let app = build_router(test_state_with(producer.clone(), relay));

        let response = app
            .oneshot(json_request("/api/chat", serde_json::json!({ "message": "hi" })))
            .await
            .unwrap();
        let outcome = consume(response.into_body().into_data_stream(), |_| {}).await;
        assert!(!outcome.is_completed());
        assert!(producer.release_flag().is_released());
    }

    #[tokio::test]
    async fn client_disconnect_releases_the_producer() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            Step::fragment("first"),
            Step::Hang,
        ]));
        let state = test_state(producer.clone());
        let metrics = state.metrics.clone();
        let app = build_router(state);

        let response = app
            .oneshot(json_request("/api/chat", serde_json::json!({ "message": "hi" })))
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], Event::fragment("first").encode().as_bytes());
        drop(body);

        for _ in 0..100 {
            if producer.release_flag().is_released() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(producer.release_flag().is_released());
        assert_eq!(metrics.snapshot().turns.disconnected, 1);
    }

    #[tokio::test]
    async fn completed_turns_feed_session_history() {
        let producer = Arc::new(ScriptedProducer::fragments(&["Hi ", "there"]));
        let state = test_state(producer.clone());
        let app = build_router(state.clone());

        for message in ["hello", "and again"] {
            let response = app
                .clone()
                .oneshot(json_request(
                    "/api/chat",
                    serde_json::json!({ "message": message, "sessionId": "s1" }),
                ))
                .await
                .unwrap();
            events_of(response).await;
        }

        let prompts = producer.prompts();
        assert_eq!(prompts[0].messages.len(), 2);
        assert_eq!(
            prompts[1].messages[1..],
            [
                ChatMessage::user("hello"),
                ChatMessage::assistant("Hi there"),
                ChatMessage::user("and again"),
            ]
        );
    }

    #[tokio::test]
    async fn gated_and_failed_turns_are_not_recorded() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            Step::fragment("partial"),
            Step::Fail(ProducerError::UnexpectedEof),
        ]));
        let state = test_state(producer.clone());
        let app = build_router(state.clone());

        let gated = app
            .clone()
            .oneshot(json_request(
                "/api/variants/travel/chat",
                serde_json::json!({ "message": "what's the weather", "sessionId": "s1" }),
            ))
            .await
            .unwrap();
        events_of(gated).await;

        let failed = app
            .clone()
            .oneshot(json_request(
                "/api/variants/travel/chat",
                serde_json::json!({ "message": "trip ideas", "sessionId": "s1" }),
            ))
            .await
            .unwrap();
        consume(failed.into_body().into_data_stream(), |_| {}).await;

        let store = state.history.as_ref().unwrap();
        let key = crate::history::SessionKey::new("travel", "s1");
        assert!(store.history(&key).await.is_empty());
    }
}
