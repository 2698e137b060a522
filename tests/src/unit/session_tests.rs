use crate::support::{
    conversation_json, drain, event_body, message_json, mount_conversation, signed_in_session,
    stream_response, test_runtime,
};
use parley_core::{ClientError, Completion, MessageRole, SessionUpdate};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn full_reply() -> Vec<serde_json::Value> {
    vec![
        json!({ "type": "init", "conversation_id": 7 }),
        json!({ "type": "chunk", "content": "A" }),
        json!({ "type": "chunk", "content": "B" }),
        json!({ "type": "done", "conversation_id": 7 }),
    ]
}

#[test]
fn reply_lands_in_new_conversation() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .and(body_partial_json(json!({ "message": "Hello", "stream": true })))
            .respond_with(stream_response(event_body(&full_reply())))
            .expect(1)
            .mount(&server)
            .await;
        mount_conversation(
            &server,
            7,
            "Hello",
            vec![
                message_json(1, 7, "user", "Hello"),
                message_json(2, 7, "assistant", "AB"),
            ],
        )
        .await;

        let (session, mut updates) = signed_in_session(&server, "token");
        let outcome = session
            .send_message("Hello", None)
            .await
            .expect("send")
            .expect("outcome");

        assert_eq!(outcome.completion, Completion::Done);
        assert_eq!(outcome.content, "AB");
        assert_eq!(outcome.conversation_id, Some(7));

        let snapshot = session.snapshot();
        assert!(!snapshot.is_generating);
        assert_eq!(snapshot.current_conversation.map(|c| c.id), Some(7));
        let replies: Vec<_> = snapshot
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].content, "AB");
        assert_eq!(replies[0].id, Some(2));

        let deltas: Vec<String> = drain(&mut updates)
            .into_iter()
            .filter_map(|update| match update {
                SessionUpdate::AssistantDelta { content, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["A", "AB"]);
    });
}

#[test]
fn send_during_reconcile_is_rejected() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(stream_response(event_body(&full_reply())))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "total": 1,
                        "conversations": [conversation_json(7, "Hello")]
                    }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations/7/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                message_json(1, 7, "user", "Hello"),
                message_json(2, 7, "assistant", "AB"),
            ])))
            .mount(&server)
            .await;

        let (session, _updates) = signed_in_session(&server, "token");
        let (first, second) = tokio::join!(session.send_message("Hello", None), async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let generating = session.state().is_generating();
            (generating, session.send_message("second", None).await)
        });

        assert_eq!(first.expect("first").expect("outcome").content, "AB");
        let (generating, second) = second;
        assert!(generating);
        assert!(matches!(second, Err(ClientError::GenerationActive)));

        let snapshot = session.snapshot();
        assert!(!snapshot.is_generating);
        assert_eq!(snapshot.current_conversation.map(|c| c.id), Some(7));
        let contents: Vec<&str> = snapshot.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello", "AB"]);
        assert!(snapshot.messages.iter().all(|m| m.is_persisted()));
    });
}

#[test]
fn failed_reload_keeps_local_reply() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(stream_response(event_body(&full_reply())))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 1,
                "conversations": [conversation_json(7, "Hello")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations/7/messages"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "detail": "database unavailable" })))
            .expect(1)
            .mount(&server)
            .await;

        let (session, _updates) = signed_in_session(&server, "token");
        let outcome = session
            .send_message("Hello", None)
            .await
            .expect("send")
            .expect("outcome");
        assert_eq!(outcome.completion, Completion::Done);
        assert_eq!(outcome.content, "AB");

        assert!(session.is_signed_in());
        let snapshot = session.snapshot();
        assert!(!snapshot.is_generating);
        assert_eq!(snapshot.current_conversation.map(|c| c.id), Some(7));
        let reply = snapshot.messages.last().expect("reply");
        assert_eq!(reply.role, MessageRole::Assistant);
        assert_eq!(reply.content, "AB");
        assert!(!reply.is_persisted());
    });
}

#[test]
fn reply_appends_to_open_conversation() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        mount_conversation(&server, 3, "Lifetimes", vec![message_json(10, 3, "user", "earlier")]).await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .and(body_partial_json(json!({ "conversation_id": 3 })))
            .respond_with(stream_response(event_body(&[
                json!({ "type": "init", "conversation_id": 3 }),
                json!({ "type": "chunk", "content": "Sure." }),
                json!({ "type": "done" }),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let (session, _updates) = signed_in_session(&server, "token");
        session.open_conversation(3).await.expect("open");
        let outcome = session
            .send_message("again", None)
            .await
            .expect("send")
            .expect("outcome");

        assert_eq!(outcome.conversation_id, Some(3));
        let messages = session.snapshot().messages;
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["earlier", "again", "Sure."]);
    });
}

#[test]
fn malformed_frame_leaves_reply_unchanged() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        let body = "data: {\"type\":\"init\",\"conversation_id\":7}\n\n\
                    data: {\"type\":\"chunk\",\"content\":\"A\"}\n\n\
                    data: {\"type\":\"chunk\",\"cont\n\n\
                    : keep-alive\n\n\
                    data: {\"type\":\"chunk\",\"content\":\"B\"}\n\n\
                    data: {\"type\":\"done\",\"conversation_id\":7}\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(stream_response(body))
            .mount(&server)
            .await;
        mount_conversation(
            &server,
            7,
            "Hello",
            vec![
                message_json(1, 7, "user", "Hello"),
                message_json(2, 7, "assistant", "AB"),
            ],
        )
        .await;

        let (session, _updates) = signed_in_session(&server, "token");
        let outcome = session
            .send_message("Hello", None)
            .await
            .expect("send")
            .expect("outcome");
        assert_eq!(outcome.completion, Completion::Done);
        assert_eq!(outcome.content, "AB");
        assert!(session.snapshot().last_error.is_none());
    });
}

#[test]
fn stream_closing_early_keeps_partial_reply() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(stream_response(event_body(&[
                json!({ "type": "init", "conversation_id": 5 }),
                json!({ "type": "chunk", "content": "X" }),
            ])))
            .mount(&server)
            .await;
        mount_conversation(&server, 5, "Partial", Vec::new()).await;

        let (session, mut updates) = signed_in_session(&server, "token");
        let outcome = session
            .send_message("go", None)
            .await
            .expect("send")
            .expect("outcome");

        assert_eq!(outcome.completion, Completion::Closed);
        assert_eq!(outcome.content, "X");
        let snapshot = session.snapshot();
        assert!(!snapshot.is_generating);
        assert_eq!(snapshot.current_conversation.map(|c| c.id), Some(5));
        assert_eq!(
            snapshot.messages.last().map(|m| m.content.as_str()),
            Some("X")
        );
        assert!(drain(&mut updates).iter().any(|update| matches!(
            update,
            SessionUpdate::GenerationFinished {
                completion: Completion::Closed,
                ..
            }
        )));
    });
}

#[test]
fn error_event_fails_and_keeps_content() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(stream_response(event_body(&[
                json!({ "type": "init", "conversation_id": 4 }),
                json!({ "type": "chunk", "content": "par" }),
                json!({ "type": "error", "error": "quota exceeded" }),
                json!({ "type": "chunk", "content": "ignored" }),
            ])))
            .mount(&server)
            .await;
        mount_conversation(&server, 4, "Quota", Vec::new()).await;

        let (session, _updates) = signed_in_session(&server, "token");
        let err = session.send_message("go", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Generation(ref detail) if detail == "quota exceeded"));

        let snapshot = session.snapshot();
        assert!(!snapshot.is_generating);
        assert_eq!(snapshot.last_error.as_deref(), Some("quota exceeded"));
        assert_eq!(
            snapshot.messages.last().map(|m| m.content.as_str()),
            Some("par")
        );
        assert_eq!(snapshot.current_conversation.map(|c| c.id), Some(4));
    });
}

#[test]
fn failed_open_returns_to_idle() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "detail": "model offline" })))
            .mount(&server)
            .await;

        let (session, mut updates) = signed_in_session(&server, "token");
        let err = session.send_message("hello", None).await.unwrap_err();
        assert!(matches!(err, ClientError::StreamOpen(_)));

        let snapshot = session.snapshot();
        assert!(!snapshot.is_generating);
        assert!(snapshot.last_error.is_some());
        assert!(snapshot
            .messages
            .iter()
            .all(|m| m.role != MessageRole::Assistant));
        assert!(drain(&mut updates)
            .iter()
            .any(|update| matches!(update, SessionUpdate::GenerationFailed { .. })));
        assert!(session.is_signed_in());
    });
}

#[test]
fn overlapping_send_is_rejected() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(
                stream_response(event_body(&[
                    json!({ "type": "chunk", "content": "slow" }),
                    json!({ "type": "done" }),
                ]))
                .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 0,
                "conversations": []
            })))
            .mount(&server)
            .await;

        let (session, _updates) = signed_in_session(&server, "token");
        let (first, second) = tokio::join!(session.send_message("first", None), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.send_message("second", None).await
        });

        assert_eq!(first.expect("first").expect("outcome").content, "slow");
        assert!(matches!(second, Err(ClientError::GenerationActive)));
        let users = session
            .snapshot()
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count();
        assert_eq!(users, 1);
    });
}

#[test]
fn blank_message_sends_nothing() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (session, _updates) = signed_in_session(&server, "token");
        assert!(session.send_message("  \n", None).await.expect("send").is_none());
        assert!(session.snapshot().messages.is_empty());
    });
}

#[test]
fn stop_is_best_effort() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "stopping" })))
            .expect(1)
            .mount(&server)
            .await;

        let (session, _updates) = signed_in_session(&server, "token");
        session.stop_generation().await.expect("stop");
        assert!(!session.snapshot().is_generating);
    });
}

#[test]
fn conversation_management_updates_the_list() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations"))
            .and(body_partial_json(json!({ "title": "Parsing", "model": "gpt-4" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 11,
                "user_id": 1,
                "title": "Parsing",
                "model": "gpt-4",
                "created_at": "2024-05-01T10:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/conversations/11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(conversation_json(11, "Parsers")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/conversations/11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "deleted" })))
            .expect(1)
            .mount(&server)
            .await;

        let (session, _updates) = signed_in_session(&server, "token");
        let created = session
            .create_conversation(Some("Parsing".into()), Some("gpt-4".into()))
            .await
            .expect("create");
        assert_eq!(session.snapshot().current_conversation.map(|c| c.id), Some(created.id));

        session.rename_conversation(11, "Parsers").await.expect("rename");
        assert_eq!(session.snapshot().conversations[0].title, "Parsers");

        session.delete_conversation(11).await.expect("delete");
        let snapshot = session.snapshot();
        assert!(snapshot.conversations.is_empty());
        assert!(snapshot.current_conversation.is_none());
    });
}
