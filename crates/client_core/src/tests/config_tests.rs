use super::*;

#[test]
fn defaults_match_protocol_constants() {
    let settings = ClientSettings::default();
    let reconnect = settings.reconnect_policy();
    assert_eq!(reconnect.base, Duration::from_millis(1_000));
    assert_eq!(reconnect.cap, Duration::from_millis(30_000));
    let keepalive = settings.keepalive_policy();
    assert_eq!(keepalive.ping_interval, Duration::from_secs(60));
    assert_eq!(keepalive.pong_timeout, Duration::from_secs(45));
    assert_eq!(settings.quota_rules(), QuotaRules::default());
    let session = settings.session_policy();
    assert_eq!(session.invite_timeout, Duration::from_secs(30));
    assert_eq!(session.poll_interval, Duration::from_secs(5));
    assert_eq!(session.expiring_window_secs, 30);
    assert_eq!(settings.unread_poll_interval(), Duration::from_secs(5));
}

#[test]
fn file_values_override_defaults() {
    let mut settings = ClientSettings::default();
    settings.apply_file(
        r#"
server_url = "https://chat.example.com"
swapanza_message_limit = "5"
ping_interval_secs = "not a number"
unknown_key = "x"
"#,
    );
    assert_eq!(settings.server_url, "https://chat.example.com");
    assert_eq!(settings.swapanza_message_limit, 5);
    assert_eq!(settings.ping_interval_secs, 60);
}

#[test]
fn bare_numbers_in_file_are_applied() {
    let mut settings = ClientSettings::default();
    settings.apply_file(
        r#"
server_url = "https://chat.example.com"
store_path = "./data/other.db"
ping_interval_secs = 30
swapanza_message_limit = 4
expiring_window_secs = -1
unread_poll_secs = true
"#,
    );
    assert_eq!(settings.server_url, "https://chat.example.com");
    assert_eq!(settings.store_path, "./data/other.db");
    assert_eq!(settings.ping_interval_secs, 30);
    assert_eq!(settings.swapanza_message_limit, 4);
    assert_eq!(settings.expiring_window_secs, -1);
    assert_eq!(settings.unread_poll_secs, 5);
}

#[test]
fn env_overrides_win_over_file() {
    let mut settings = ClientSettings::default();
    settings.apply_file(r#"invite_timeout_secs = "10""#);
    settings.apply_env([
        ("APP__INVITE_TIMEOUT_SECS".to_string(), "12".to_string()),
        ("APP__STORE_PATH".to_string(), "./tmp/chat.db".to_string()),
        ("INVITE_TIMEOUT_SECS".to_string(), "99".to_string()),
    ]);
    assert_eq!(
        settings.session_policy().invite_timeout,
        Duration::from_secs(12)
    );
    assert_eq!(settings.store_path, "./tmp/chat.db");
}

#[test]
fn unreadable_file_keeps_defaults() {
    let mut settings = ClientSettings::default();
    settings.apply_file("server_url = [1, 2");
    assert_eq!(settings, ClientSettings::default());
}

#[test]
fn missing_file_is_not_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = load_settings_from(&dir.path().join("absent.toml"));
    assert_eq!(settings.reconnect_base_ms, 1_000);
}
