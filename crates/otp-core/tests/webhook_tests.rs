//! Integration tests for the webhook API.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use otp_core::{
    api::{create_router, AppState},
    AdminAction, EngineConfig, EntitlementStore, LeasedNumber, Notifier, OtpEngine,
};
use std::sync::{Arc, Mutex};
use telephony_client::{
    NumberHandle, ProviderCredentials, ProviderError, ProviderMessage, TelephonyProvider,
};
use tower::ServiceExt;

const NUMBER: &str = "+14165550100";

/// Provider that is never reached by the webhook path.
struct OfflineProvider;

#[async_trait]
impl TelephonyProvider for OfflineProvider {
    async fn list_available_numbers(
        &self,
        _creds: &ProviderCredentials,
        _region: &str,
        _limit: u32,
    ) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    async fn provision_number(
        &self,
        _creds: &ProviderCredentials,
        _number: &str,
        _callback_url: Option<&str>,
    ) -> Result<NumberHandle, ProviderError> {
        Err(ProviderError::Unauthorized)
    }

    async fn release_number(
        &self,
        _creds: &ProviderCredentials,
        _handle: &NumberHandle,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn validate_number(
        &self,
        _creds: &ProviderCredentials,
        _number: &str,
    ) -> Result<bool, ProviderError> {
        Ok(true)
    }

    async fn list_recent_messages(
        &self,
        _creds: &ProviderCredentials,
        _number: &str,
        _since: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> Result<Vec<ProviderMessage>, ProviderError> {
        Ok(Vec::new())
    }

    async fn validate_credential(
        &self,
        _creds: &ProviderCredentials,
    ) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

#[derive(Default)]
struct CollectingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, account_id: &String, text: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((account_id.clone(), text.to_string()));
    }

    async fn prompt_admins(&self, _text: &str, _actions: Vec<AdminAction>) {}

    async fn broadcast(&self, _text: &str) {}
}

async fn create_test_app() -> (Router, OtpEngine, Arc<CollectingNotifier>) {
    let notifier = Arc::new(CollectingNotifier::default());
    let engine = OtpEngine::new(
        EngineConfig::default(),
        EntitlementStore::in_memory(),
        Arc::new(OfflineProvider),
        notifier.clone(),
    );

    engine
        .store()
        .get_or_create_account("alice", None)
        .await
        .unwrap();
    engine
        .store()
        .write(|data| {
            data.set_lease(
                "alice",
                LeasedNumber {
                    handle: NumberHandle {
                        sid: "PN1".to_string(),
                        phone_number: NUMBER.to_string(),
                    },
                    leased_at: Utc::now(),
                },
            )
        })
        .await
        .unwrap();

    let app = create_router(Arc::new(AppState::new(engine.clone())));
    (app, engine, notifier)
}

fn sms_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/sms")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _, _) = create_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["stats"]["accounts"], 1);
    assert_eq!(json["stats"]["leased_numbers"], 1);
}

#[tokio::test]
async fn test_sms_webhook_delivers_once() {
    let (app, engine, notifier) = create_test_app().await;
    let form = "MessageSid=SM123&From=%2B15550009999&To=%2B14165550100&Body=Your+code+is+482913";

    for _ in 0..2 {
        let response = app.clone().oneshot(sms_request(form)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let sent = notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "alice");
    assert!(sent[0].1.contains("482913"));
    assert!(engine.store().is_processed("SM123").await);
}

#[tokio::test]
async fn test_sms_webhook_missing_sid_rejected() {
    let (app, engine, notifier) = create_test_app().await;

    let response = app
        .oneshot(sms_request("From=%2B15550009999&To=%2B14165550100&Body=hi"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["code"], "MALFORMED_PAYLOAD");

    assert!(notifier.sent.lock().unwrap().is_empty());
    assert_eq!(engine.stats().await.processed_messages, 0);
}

#[tokio::test]
async fn test_sms_webhook_unknown_number_accepted_without_effect() {
    let (app, engine, notifier) = create_test_app().await;

    let response = app
        .oneshot(sms_request(
            "MessageSid=SM9&From=%2B15550009999&To=%2B19995550000&Body=code",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(notifier.sent.lock().unwrap().is_empty());
    assert!(!engine.store().is_processed("SM9").await);
}

#[tokio::test]
async fn test_debugger_webhook_acknowledged() {
    let (app, _, _) = create_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/debugger")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("Level=Error&ErrorCode=11200&Payload=%7B%7D"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
