//! Common test utilities for integration tests.

use otp_bot::commands::CommandHandler;
use otp_bot::messenger::{BotMessage, SignalClient, SignalNotifier};
use otp_bot::build_handlers;
use otp_core::{EngineConfig, EntitlementStore, OtpEngine, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use telephony_client::TwilioClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const BOT_NUMBER: &str = "+15555555555";
pub const ADMIN: &str = "+10000000000";
pub const USER: &str = "+15550001111";
pub const NUMBER: &str = "+14165550100";

/// Bot wired to mock Signal and telephony servers.
pub struct TestBot {
    pub signal_server: MockServer,
    pub twilio_server: MockServer,
    pub engine: OtpEngine,
    pub handlers: Vec<Box<dyn CommandHandler>>,
}

pub async fn test_bot() -> TestBot {
    let signal_server = MockServer::start().await;
    let twilio_server = MockServer::start().await;

    let config = EngineConfig {
        admin_ids: vec![ADMIN.to_string()],
        retry: RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        ..EngineConfig::default()
    };

    let provider = Arc::new(
        TwilioClient::new(twilio_server.uri(), twilio_server.uri(), Duration::from_secs(5)).unwrap(),
    );
    let signal = SignalClient::new(signal_server.uri(), BOT_NUMBER, Duration::from_secs(5)).unwrap();
    let notifier = Arc::new(SignalNotifier::new(signal, config.admin_ids.clone(), None));

    let engine = OtpEngine::new(config, EntitlementStore::in_memory(), provider, notifier.clone());
    let handlers = build_handlers(engine.clone(), notifier);

    TestBot {
        signal_server,
        twilio_server,
        engine,
        handlers,
    }
}

/// Direct message from `source`.
pub fn message(source: &str, text: &str) -> BotMessage {
    BotMessage {
        source: source.to_string(),
        source_name: None,
        text: text.to_string(),
        timestamp: 1677652288000,
        is_group: false,
        group_id: None,
        receiving_account: BOT_NUMBER.to_string(),
    }
}

/// Accept every outgoing Signal message.
pub async fn accept_signal_sends(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v2/send"))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

/// Mount the telephony endpoints used by credential checks and purchases.
pub async fn mock_telephony(server: &MockServer, sid: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/2010-04-01/Accounts/{}.json", sid)))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sid": sid,
            "status": "active"
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!(
            "/2010-04-01/Accounts/{}/AvailablePhoneNumbers/CA/Local.json",
            sid
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "available_phone_numbers": [{ "phone_number": NUMBER }]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/PhoneNumbers/%2B14165550100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "phone_number": NUMBER,
            "valid": true
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("/2010-04-01/Accounts/{}/IncomingPhoneNumbers.json", sid)))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "sid": "PN1",
            "phone_number": NUMBER
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/2010-04-01/Accounts/{}/Messages.json", sid)))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [{
                "sid": "SM1",
                "from": "+15550009999",
                "to": NUMBER,
                "body": "Your code is 482913",
                "date_sent": "Mon, 19 Oct 2026 12:00:05 +0000"
            }]
        })))
        .mount(server)
        .await;
}
