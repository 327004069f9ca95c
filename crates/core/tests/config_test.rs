use std::env;
use std::sync::Mutex;

use scheduler_core::config::*;
use scheduler_core::{Channel, TaskPayload};

static ENV_MUTEX: Mutex<()> = Mutex::new(());

const SAMPLE_CONFIG: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../config/schedule-engine.toml"
);

#[test]
fn test_sample_config_file_loads() {
    let _guard = ENV_MUTEX.lock().unwrap();

    let config = AppConfig::load(Some(SAMPLE_CONFIG)).unwrap();
    assert_eq!(config.engine.claim_batch_size, 50);
    assert_eq!(config.engine.stale_processing_timeout_seconds, 1800);
    assert_eq!(config.retry.default_max_retries, 3);
    assert_eq!(config.mail.smtp_host, None);
    assert_eq!(config.api.bind_address, "0.0.0.0:8080");
}

#[test]
fn test_environment_overrides_file() {
    let _guard = ENV_MUTEX.lock().unwrap();

    env::set_var("SCHEDULER__ENGINE__CLAIM_BATCH_SIZE", "7");
    env::set_var("SCHEDULER__MAIL__SMTP_HOST", "smtp.internal");
    let result = AppConfig::load(Some(SAMPLE_CONFIG));
    env::remove_var("SCHEDULER__ENGINE__CLAIM_BATCH_SIZE");
    env::remove_var("SCHEDULER__MAIL__SMTP_HOST");

    let config = result.unwrap();
    assert_eq!(config.engine.claim_batch_size, 7);
    assert_eq!(config.mail.smtp_host.as_deref(), Some("smtp.internal"));
}

#[test]
fn test_invalid_environment_value_fails_validation() {
    let _guard = ENV_MUTEX.lock().unwrap();

    env::set_var("SCHEDULER__ENGINE__MAX_CONCURRENT_EXECUTIONS", "0");
    let result = AppConfig::load(Some(SAMPLE_CONFIG));
    env::remove_var("SCHEDULER__ENGINE__MAX_CONCURRENT_EXECUTIONS");

    assert!(result.is_err());
}

#[test]
fn test_stored_payload_json_uses_defaults() {
    let payload: TaskPayload =
        serde_json::from_str(r#"{"channel":"HTTP","url":"https://example.com/hook"}"#).unwrap();
    assert_eq!(payload.channel(), Channel::Http);

    match payload {
        TaskPayload::Http(http) => {
            assert_eq!(http.method, "GET");
            assert_eq!(http.expected_status, 200);
            assert_eq!(http.retry_count, 0);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    let missing_url = serde_json::from_str::<TaskPayload>(r#"{"channel":"HTTP"}"#);
    assert!(missing_url.is_err());
}
