use std::sync::Arc;

use ovocall_agents::{
    Counterpart, SessionSelector, TurnFailure, TurnOptions, TurnOutcome, TurnRuntime,
    TurnSettings, build_provider,
};
use ovocall_config::{AppConfig, ProviderConfig, ProviderKind};
use ovocall_db::{RecordStore, SqliteRecordStore, tables};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn runtime_against(server: &MockServer, kind: ProviderKind) -> (TurnRuntime, Arc<SqliteRecordStore>) {
    let mut config = AppConfig {
        provider: ProviderConfig {
            kind,
            base_url: Some(server.uri()),
            api_key: Some("test-key".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    config.turn.random_sms_probability = 0.0;

    let provider = build_provider(&config.provider).unwrap();
    let store = Arc::new(SqliteRecordStore::in_memory().unwrap());
    let runtime = TurnRuntime::new(Some(provider), TurnSettings::from_config(&config))
        .with_store(store.clone());
    (runtime, store)
}

fn openai_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "gpt-4o-mini",
        "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}]
    }))
}

#[tokio::test]
async fn test_stranger_call_end_to_end() {
    let server = MockServer::start().await;
    let content = "<thinking>先想想身份</thinking>\n\
        ```jsonl\n\
        {\"type\":\"persona\",\"name\":\"周航\",\"profession\":\"外卖员\",\"phoneNumber\":\"13655556666\"}\n\
        {\"type\":\"call\",\"sentence\":\"喂，你好\"}\n\
        {\"type\":\"call\",\"sentence\":\"你的外卖到楼下了\"}\n\
        {\"type\":\"randomSms\",\"senderNumber\":\"10086\",\"senderName\":\"运营商\",\"content\":\"您的话费余额不足\",\"smsType\":\"notice\"}\n\
        {\"type\":\"hangup\",\"value\":false}\n\
        ```";

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(openai_reply(content))
        .mount(&server)
        .await;

    let (runtime, store) = runtime_against(&server, ProviderKind::OpenAi).await;
    let session = runtime.start_call_from_contacts("unknown").await;

    let outcome = runtime
        .send_call_message("喂？", &TurnOptions::default())
        .await
        .unwrap();
    let TurnOutcome::Completed(result) = outcome else {
        panic!("turn did not complete: {outcome:?}");
    };
    assert_eq!(result.reply_lines().len(), 2);

    let snap = session.snapshot();
    assert_eq!(snap.phone_number, "13655556666");
    assert_eq!(snap.history.last().unwrap().content, "喂，你好你的外卖到楼下了");

    let contact = store
        .get(tables::CONTACTS, "13655556666")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(contact["strangerPersona"]["profession"], "外卖员");

    let sms = store
        .query(tables::CHAT_MESSAGES, "sessionId", &json!("sms_10086"))
        .await
        .unwrap();
    assert_eq!(sms.len(), 1);
    assert_eq!(sms[0]["randomSmsType"], "notice");

    // the next call to the same number restores the persona
    let again = runtime.start_call_from_contacts("136-5555-6666").await;
    assert_eq!(again.snapshot().persona.unwrap().name, "周航");
}

#[tokio::test]
async fn test_sms_thread_over_gemini() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"parts": [{"text":
                    "{\"type\":\"sms\",\"messages\":[\"刚下班\",\"你呢\"]}\n{\"type\":\"callRequest\",\"opening\":\"方便接电话吗？想听听你的声音\"}"
                }]},
                "finishReason": "STOP"
            }]
        })))
        .mount(&server)
        .await;

    let (runtime, _store) = runtime_against(&server, ProviderKind::Gemini).await;
    let session = runtime
        .open_sms("13800001111", Counterpart::Stranger, false)
        .unwrap();

    let outcome = runtime
        .send_sms_message(&SessionSelector::Active, "在忙吗", &TurnOptions::default())
        .await
        .unwrap();
    let result = outcome.result().unwrap();
    assert_eq!(result.reply_lines(), ["刚下班".to_string(), "你呢".to_string()]);

    let history = session.snapshot().history;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].content, "你呢");
}

#[tokio::test]
async fn test_prose_reply_is_a_turn_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(openai_reply("我现在不方便说话。"))
        .mount(&server)
        .await;

    let (runtime, _store) = runtime_against(&server, ProviderKind::OpenAi).await;
    runtime
        .open_sms("13800002222", Counterpart::Stranger, false)
        .unwrap();
    let outcome = runtime
        .send_sms_message(&SessionSelector::Active, "hi", &TurnOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Failed(TurnFailure::NoRecords));
}

#[tokio::test]
async fn test_provider_status_error_surfaces() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let (runtime, _store) = runtime_against(&server, ProviderKind::OpenAi).await;
    runtime.start_call("13800003333", Counterpart::Stranger);
    let err = runtime
        .send_call_message("hi", &TurnOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("503"), "{err}");
}
