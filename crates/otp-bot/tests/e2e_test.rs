//! End-to-end integration tests for the OTP bot.

mod common;

use common::*;
use otp_bot::dispatch;
use otp_core::EntitlementStatus;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

async fn send(bot: &TestBot, source: &str, text: &str) -> String {
    dispatch(&bot.handlers, &message(source, text))
        .await
        .expect("a handler should match")
}

#[tokio::test]
async fn test_purchase_flow_e2e() {
    let bot = test_bot().await;
    accept_signal_sends(&bot.signal_server).await;
    mock_telephony(&bot.twilio_server, "AC1").await;

    // 1. Admin stocks the pool
    let reply = send(&bot, ADMIN, "!admin addcred AC1,token1").await;
    assert_eq!(reply, "Credentials added: 1, skipped: 0.");

    // 2. User registers and gets points
    let reply = send(&bot, USER, "!start").await;
    assert!(reply.contains("Welcome"));
    let reply = send(&bot, ADMIN, &format!("!admin setpoints {} 20", USER)).await;
    assert!(reply.contains("set to 20"));

    // 3. Points become credits
    let reply = send(&bot, USER, "!convert").await;
    assert!(reply.contains("Credits: 3"));

    // 4. First listing assigns a pooled credential
    let reply = send(&bot, USER, "!numbers").await;
    assert!(reply.starts_with("You have been approved."));
    assert!(reply.contains(NUMBER));

    // 5. Buy with a loosely formatted number
    let reply = send(&bot, USER, "!buy +1 (416) 555-0100").await;
    assert!(reply.contains("is now yours"), "unexpected reply: {}", reply);
    assert!(reply.contains("Credits left: 2"));

    let account = bot.engine.store().account(USER).await.unwrap();
    assert_eq!(account.status, EntitlementStatus::Approved);
    assert_eq!(account.leased_number(), Some(NUMBER));
    assert_eq!(account.balance_points, 5);

    // 6. Latest messages on the new number
    let reply = send(&bot, USER, "!otp").await;
    assert!(reply.contains("482913"));
    assert!(reply.ends_with("1 new."));
    assert!(bot.engine.store().is_processed("SM1").await);

    let reply = send(&bot, ADMIN, "!admin stats").await;
    assert!(reply.contains("Leased numbers: 1"));
}

#[tokio::test]
async fn test_escalation_and_approval_e2e() {
    let bot = test_bot().await;
    mock_telephony(&bot.twilio_server, "AC1").await;

    // Admins are prompted with the reply commands
    Mock::given(method("POST"))
        .and(path("/v2/send"))
        .and(body_string_contains("!admin approve +15550001111"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&bot.signal_server)
        .await;
    accept_signal_sends(&bot.signal_server).await;

    send(&bot, USER, "!start").await;
    let reply = send(&bot, USER, "!numbers").await;
    assert!(reply.contains("pending admin approval"));

    // Asking again does not prompt a second time
    send(&bot, USER, "!numbers").await;

    // Credential supplied through the follow-up prompt
    let reply = send(&bot, ADMIN, "!admin addcred").await;
    assert!(reply.contains("SID,token"));
    let reply = send(&bot, ADMIN, "AC1,token1").await;
    assert_eq!(reply, "Credentials added: 1, skipped: 0.");

    let reply = send(&bot, ADMIN, "!admin approve").await;
    assert!(reply.contains(USER));

    let reply = send(&bot, ADMIN, &format!("!admin approve {}", USER)).await;
    assert!(reply.contains("approved with pooled credential AC1"));

    let account = bot.engine.store().account(USER).await.unwrap();
    assert_eq!(account.status, EntitlementStatus::Approved);
    assert!(account.credential_id.is_some());
}

#[tokio::test]
async fn test_referral_code_prompt_e2e() {
    let bot = test_bot().await;
    accept_signal_sends(&bot.signal_server).await;

    send(&bot, ADMIN, "!start").await;
    let code = bot.engine.store().account(ADMIN).await.unwrap().referral_code;

    let reply = send(&bot, USER, "!start").await;
    assert!(reply.contains("Reply with the referral code"));

    let reply = send(&bot, USER, &code).await;
    assert_eq!(reply, "Referral code applied. Thanks for joining!");
    assert_eq!(
        bot.engine.store().account(ADMIN).await.unwrap().balance_points,
        1
    );

    // The prompt was consumed
    let reply = send(&bot, USER, &code).await;
    assert_eq!(reply, "Send !help to see available commands.");

    let reply = send(&bot, USER, &format!("!refer {}", code)).await;
    assert_eq!(reply, "You have already used a referral code.");
}

#[tokio::test]
async fn test_redeem_code_e2e() {
    let bot = test_bot().await;

    let reply = send(&bot, ADMIN, "!admin newcode WELCOME,10").await;
    assert!(reply.contains("WELCOME"));

    send(&bot, USER, "!start").await;
    let reply = send(&bot, USER, "!redeem WELCOME").await;
    assert_eq!(reply, "Code redeemed for 10 point(s).");

    let reply = send(&bot, USER, "!redeem WELCOME").await;
    assert_eq!(reply, "That code has already been used.");

    let reply = send(&bot, USER, "!balance").await;
    assert!(reply.contains("Points: 10"));
}

#[tokio::test]
async fn test_user_errors_are_explained() {
    let bot = test_bot().await;

    send(&bot, USER, "!start").await;

    let reply = send(&bot, USER, "!admin stats").await;
    assert_eq!(reply, "You are not allowed to do that.");

    let reply = send(&bot, USER, "!convert").await;
    assert!(reply.starts_with("You need 15 points but only have 0."));

    let reply = send(&bot, USER, "!otp").await;
    assert_eq!(reply, "You do not have a number yet. Use !buy <number>.");

    let reply = send(&bot, USER, "!bonus").await;
    assert!(reply.contains("1 bonus point"));
    let reply = send(&bot, USER, "!bonus").await;
    assert!(reply.starts_with("Please wait"));
}

#[tokio::test]
async fn test_unknown_command_is_ignored() {
    let bot = test_bot().await;
    assert!(dispatch(&bot.handlers, &message(USER, "!dance")).await.is_none());
}

#[tokio::test]
async fn test_help_shows_admin_section_to_admins() {
    let bot = test_bot().await;

    assert!(send(&bot, ADMIN, "!help").await.contains("!admin approveall"));
    assert!(!send(&bot, USER, "!help").await.contains("!admin"));
}
