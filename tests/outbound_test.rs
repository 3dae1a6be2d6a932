//! `HttpService` against a mock REST API.

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use hubsync::config::secrets::SecretString;
use hubsync::error::Error;
use hubsync::model::EventId;
use hubsync::outbound::{ExternalService, HttpService};

fn client(server: &MockServer, service_token: Option<&str>) -> HttpService {
    HttpService::new(
        "trello",
        &format!("{}/api/", server.base_url()),
        service_token.map(|t| SecretString::from(t.to_string())),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn post_comment_sends_user_bearer_and_text() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/entities/card_1/comments")
            .header("authorization", "Bearer user-token")
            .json_body(json!({ "text": "on it" }));
        then.status(201).json_body(json!({ "id": "c1" }));
    });

    let response = client(&server, None)
        .post_comment("user-token", "card_1", "on it")
        .await
        .unwrap();

    mock.assert();
    assert_eq!(response["id"], "c1");
}

#[tokio::test]
async fn fetch_entity_uses_the_service_token() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/entities/card_7")
            .header("authorization", "Bearer service-token");
        then.status(200).json_body(json!({ "name": "Fix login", "closed": false }));
    });

    let entity = client(&server, Some("service-token"))
        .fetch_entity(&EventId::card(7))
        .await
        .unwrap();

    mock.assert();
    assert_eq!(entity["name"], "Fix login");
}

#[tokio::test]
async fn attach_and_subscribe_post_their_payloads() {
    let server = MockServer::start();
    let attach = server.mock(|when, then| {
        when.method(POST)
            .path("/api/entities/card_1/attachments")
            .json_body(json!({ "name": "trace.log", "url": "https://files.example/trace.log" }));
        then.status(200).json_body(json!({ "ok": true }));
    });
    let subscribe = server.mock(|when, then| {
        when.method(POST)
            .path("/api/webhooks")
            .json_body(json!({ "target": "board_1", "callback_url": "https://hub.example/webhook/trello/42" }));
        // Empty success bodies are fine.
        then.status(204);
    });

    let service = client(&server, None);
    service
        .attach_file("tok", "card_1", "trace.log", "https://files.example/trace.log")
        .await
        .unwrap();
    let response = service
        .subscribe_webhook("tok", "board_1", "https://hub.example/webhook/trello/42")
        .await
        .unwrap();

    attach.assert();
    subscribe.assert();
    assert!(response.is_null());
}

#[tokio::test]
async fn failures_are_classified_by_status() {
    let server = MockServer::start();
    for (target, status) in [("auth", 401), ("gone", 404), ("busy", 429), ("down", 502), ("bad", 422)] {
        server.mock(|when, then| {
            when.method(POST).path(format!("/api/entities/{target}/comments"));
            then.status(status).body("nope");
        });
    }

    let service = client(&server, None);
    let post = |target: &'static str| {
        let service = service.clone();
        async move { service.post_comment("tok", target, "x").await.unwrap_err() }
    };

    assert!(matches!(post("auth").await, Error::AuthInvalid { service, .. } if service == "trello"));
    assert!(matches!(post("gone").await, Error::NotFound(_)));
    assert!(post("busy").await.is_retryable());
    assert!(post("down").await.is_retryable());
    assert!(matches!(post("bad").await, Error::Upstream { status: 422, .. }));
}

#[tokio::test]
async fn unreachable_service_is_transient() {
    // Nothing listens on port 9 of localhost.
    let service = HttpService::new("trello", "http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
    let err = service.post_comment("tok", "card_1", "x").await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
}

#[tokio::test]
async fn invalid_json_response_is_malformed() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/entities/card_1");
        then.status(200).body("<html>");
    });

    let err = client(&server, None).fetch_entity(&EventId::card(1)).await.unwrap_err();
    assert!(matches!(err, Error::MalformedPayload(_)));
}
