use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone};
use imap_proto::{Address, Envelope, MailboxDatum, Response};

use crate::extract;
use crate::notify::{self, NotificationSink, NotifyError};
use crate::rate_limit::RateLimiter;
use crate::settings::Config;
use crate::watcher::message::{ForwardableEmail, MailboxMessage};
use crate::watcher::{mailbox_grew, ConnectionState, MailboxWatcher};

fn test_config() -> Config {
    serde_yaml::from_str(
        r#"
imap:
  server: imap.example.com
  port: 993
  username: watcher@example.com
telegram:
  chat_id: "-100123"
monitoring:
  target_addresses: ["claude@pan93.com"]
"#,
    )
    .unwrap()
}

fn message_to(recipients: &[&str]) -> MailboxMessage {
    MailboxMessage {
        seq: 1,
        subject: "hello".to_string(),
        sender: "sender@example.com".to_string(),
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        date: Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        seen: false,
    }
}

fn sample_email(subject: &str, content: &str) -> ForwardableEmail {
    ForwardableEmail {
        subject: subject.to_string(),
        recipient: "claude@pan93.com".to_string(),
        date: Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        content: content.to_string(),
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    delivered: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl NotificationSink for RecordingSink {
    async fn notify(&self, formatted: &str) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Api("boom".to_string()));
        }
        self.delivered.lock().unwrap().push(formatted.to_string());
        Ok(())
    }
}

#[test]
fn filter_matches_case_insensitively() {
    let targets = vec!["claude@pan93.com".to_string()];
    let message = message_to(&["Claude@Pan93.com"]);
    assert_eq!(
        message.matched_target(&targets),
        Some("claude@pan93.com".to_string())
    );
}

#[test]
fn filter_requires_the_whole_address_to_match() {
    let targets = vec!["claude@pan93.com".to_string()];
    let message = message_to(&["notclaude@pan93.com"]);
    assert_eq!(message.matched_target(&targets), None);
}

#[test]
fn filter_reports_the_matched_target_not_the_list() {
    let targets = vec!["b@y.com".to_string()];
    let message = message_to(&["a@x.com", "b@y.com"]);
    assert_eq!(message.matched_target(&targets), Some("b@y.com".to_string()));
}

#[test]
fn filter_skips_messages_already_read() {
    let targets = vec!["claude@pan93.com".to_string()];
    let mut message = message_to(&["claude@pan93.com"]);
    message.seen = true;
    assert_eq!(message.matched_target(&targets), None);
}

#[test]
fn envelope_recipients_combine_to_and_cc() {
    fn address(mailbox: &'static str, host: &'static str) -> Address<'static> {
        Address {
            name: None,
            adl: None,
            mailbox: Some(Cow::Borrowed(mailbox.as_bytes())),
            host: Some(Cow::Borrowed(host.as_bytes())),
        }
    }

    let envelope = Envelope {
        date: Some(Cow::Borrowed(b"Wed, 01 May 2024 12:00:00 +0000")),
        subject: Some(Cow::Borrowed(b"=?utf-8?q?hello_world?=")),
        from: Some(vec![address("sender", "example.com")]),
        sender: None,
        reply_to: None,
        to: Some(vec![address("a", "x.com"), address("b", "y.com")]),
        cc: Some(vec![address("a", "x.com"), address("c", "z.com")]),
        bcc: None,
        in_reply_to: None,
        message_id: None,
    };

    let message = MailboxMessage::from_envelope(7, &envelope, false);
    assert_eq!(message.seq, 7);
    assert_eq!(message.subject, "hello world");
    assert_eq!(message.sender, "sender@example.com");
    assert_eq!(message.recipients, vec!["a@x.com", "b@y.com", "c@z.com"]);
    assert_eq!(message.date.timestamp(), 1_714_564_800);
}

#[test]
fn rate_limiter_enforces_the_window_maximum() {
    let limiter = RateLimiter::new(Duration::from_millis(1000), 2);
    let start = Instant::now();
    assert!(limiter.try_acquire_at(start));
    assert!(limiter.try_acquire_at(start + Duration::from_millis(1)));
    assert!(!limiter.try_acquire_at(start + Duration::from_millis(2)));
}

#[test]
fn rate_limiter_resets_once_the_window_elapses() {
    let limiter = RateLimiter::new(Duration::from_millis(1000), 2);
    let start = Instant::now();
    assert!(limiter.try_acquire_at(start));
    assert!(limiter.try_acquire_at(start));
    assert!(!limiter.try_acquire_at(start));
    assert!(limiter.try_acquire_at(start + Duration::from_millis(1500)));
}

#[test]
fn config_tuning_fields_have_defaults() {
    let config = test_config();
    assert_eq!(config.imap.mailbox, "INBOX");
    assert_eq!(config.monitoring.reconnect_delay_seconds, 10);
    assert_eq!(config.monitoring.idle_timeout_seconds, 1500);
    assert_eq!(config.rate_limit.window_ms, 60_000);
    assert_eq!(config.rate_limit.max_requests, 20);
}

#[tokio::test]
async fn end_is_terminal_and_idempotent() {
    let watcher = MailboxWatcher::new(&test_config(), "secret".into(), RecordingSink::default());
    watcher.end();
    assert_eq!(watcher.state(), ConnectionState::Closed);
    watcher.end();
    assert_eq!(watcher.state(), ConnectionState::Closed);

    // a closed watcher refuses to reconnect
    watcher.connect().await;
    assert_eq!(watcher.state(), ConnectionState::Closed);
}

#[test]
fn closed_state_cannot_be_left() {
    let watcher = MailboxWatcher::new(&test_config(), "secret".into(), RecordingSink::default());
    watcher.end();
    assert!(!watcher.transition(ConnectionState::Connecting));
    assert_eq!(watcher.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn forward_delivers_the_formatted_message() {
    let sink = RecordingSink::default();
    let watcher = MailboxWatcher::new(&test_config(), "secret".into(), sink.clone());

    watcher
        .forward(sample_email("report ready", "tags like <b> stay text"))
        .await
        .unwrap();

    let delivered = sink.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].starts_with("<b>report ready</b>"));
    assert!(delivered[0].contains("claude@pan93.com"));
    assert!(delivered[0].contains("2024-05-01"));
    assert!(delivered[0].contains("tags like &lt;b&gt; stay text"));
}

#[tokio::test]
async fn forward_drops_the_message_when_rate_limited() {
    let mut config = test_config();
    config.rate_limit.max_requests = 1;
    let sink = RecordingSink::default();
    let watcher = MailboxWatcher::new(&config, "secret".into(), sink.clone());

    watcher.forward(sample_email("first", "a")).await.unwrap();
    let err = watcher
        .forward(sample_email("second", "b"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rate limit"));
    assert_eq!(sink.delivered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sink_failures_surface_to_the_send_path() {
    let sink = RecordingSink {
        fail: true,
        ..Default::default()
    };
    let watcher = MailboxWatcher::new(&test_config(), "secret".into(), sink);
    assert!(watcher.forward(sample_email("x", "y")).await.is_err());
}

#[test]
fn html_markup_is_escaped_before_composition() {
    assert_eq!(notify::escape_html("a <b> & c"), "a &lt;b&gt; &amp; c");
}

#[test]
fn format_message_carries_every_field() {
    let formatted = notify::format_message(&sample_email("Status", "all good"));
    assert!(formatted.contains("<b>Status</b>"));
    assert!(formatted.contains("claude@pan93.com"));
    assert!(formatted.contains("2024-05-01"));
    assert!(formatted.contains("<blockquote expandable>all good</blockquote>"));
}

#[test]
fn exists_growth_triggers_a_scan_only_when_the_count_goes_up() {
    let mut last_exists = 3;
    assert!(mailbox_grew(
        &Response::MailboxData(MailboxDatum::Exists(4)),
        &mut last_exists
    ));
    assert_eq!(last_exists, 4);

    // the same count again is not new activity
    assert!(!mailbox_grew(
        &Response::MailboxData(MailboxDatum::Exists(4)),
        &mut last_exists
    ));

    // an expunge shrinking the mailbox is not new mail either
    assert!(!mailbox_grew(
        &Response::MailboxData(MailboxDatum::Exists(2)),
        &mut last_exists
    ));
    assert_eq!(last_exists, 2);
}

#[test]
fn extraction_prefers_the_plain_text_part() {
    let raw = concat!(
        "From: sender@example.com\r\n",
        "To: claude@pan93.com\r\n",
        "Subject: multipart\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/alternative; boundary=\"sep\"\r\n",
        "\r\n",
        "--sep\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "plain body\r\n",
        "--sep\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<p>html body</p>\r\n",
        "--sep--\r\n",
    );
    assert_eq!(extract::to_plain_text(raw.as_bytes()).trim(), "plain body");
}

#[test]
fn extraction_converts_html_only_messages() {
    let raw = concat!(
        "From: sender@example.com\r\n",
        "Subject: html\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<html><body><p>rendered &amp; clean</p></body></html>\r\n",
    );
    let text = extract::to_plain_text(raw.as_bytes());
    assert!(text.contains("rendered & clean"));
    assert!(!text.contains('<'));
}

#[test]
fn extraction_never_panics_on_garbage() {
    let text = extract::to_plain_text(&[0xff, 0xfe, 0x00, 0x42]);
    assert!(!text.is_empty());
}
