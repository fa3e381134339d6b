use anyhow::{Context, Result};
use async_imap::types::{Fetch, Flag};
use chrono::{DateTime, Local};
use imap_proto::{Address, Envelope};
use itertools::Itertools;

/// One server-side message under consideration during a scan.
#[derive(Debug, Clone)]
pub struct MailboxMessage {
    /// Sequence number, stable within the current session.
    pub seq: u32,
    pub subject: String,
    pub sender: String,
    /// Primary and carbon-copy recipients, as they appear in the envelope.
    pub recipients: Vec<String>,
    pub date: DateTime<Local>,
    pub seen: bool,
}

/// Normalized record handed to the send path. Built once per qualifying
/// message and consumed exactly once.
#[derive(Debug, Clone)]
pub struct ForwardableEmail {
    pub subject: String,
    /// The configured target address the message matched.
    pub recipient: String,
    pub date: DateTime<Local>,
    pub content: String,
}

impl MailboxMessage {
    pub fn from_fetch(fetch: &Fetch) -> Result<Self> {
        let envelope = fetch.envelope().context("server returned no envelope")?;
        let seen = fetch.flags().any(|flag| flag == Flag::Seen);
        Ok(Self::from_envelope(fetch.message, envelope, seen))
    }

    pub(crate) fn from_envelope(seq: u32, envelope: &Envelope<'_>, seen: bool) -> Self {
        let recipients = envelope
            .to
            .iter()
            .flatten()
            .chain(envelope.cc.iter().flatten())
            .filter_map(address_to_string)
            .unique()
            .collect();

        Self {
            seq,
            subject: envelope
                .subject
                .as_deref()
                .map(decode_header_value)
                .unwrap_or_default(),
            sender: envelope
                .from
                .as_deref()
                .and_then(|from| from.first())
                .and_then(address_to_string)
                .unwrap_or_default(),
            recipients,
            date: envelope
                .date
                .as_deref()
                .and_then(parse_date)
                .unwrap_or_else(Local::now),
            seen,
        }
    }

    /// Applies the recipient filter: the first To/Cc address equal to a
    /// watched address (compared lowercased, as a whole) decides the match.
    /// Messages already read never match.
    pub fn matched_target(&self, targets: &[String]) -> Option<String> {
        if self.seen {
            return None;
        }
        self.recipients.iter().find_map(|recipient| {
            let lowered = recipient.to_lowercase();
            targets.iter().find(|target| **target == lowered).cloned()
        })
    }
}

fn address_to_string(address: &Address<'_>) -> Option<String> {
    let mailbox = address.mailbox.as_deref()?;
    let host = address.host.as_deref()?;
    Some(format!(
        "{}@{}",
        String::from_utf8_lossy(mailbox),
        String::from_utf8_lossy(host)
    ))
}

// RFC 2047 encoded words are decoded by replaying the bytes as a header
// line through mailparse
fn decode_header_value(raw: &[u8]) -> String {
    let mut line = b"Subject: ".to_vec();
    line.extend_from_slice(raw);
    line.extend_from_slice(b"\n");
    match mailparse::parse_header(&line) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

fn parse_date(raw: &[u8]) -> Option<DateTime<Local>> {
    let text = String::from_utf8_lossy(raw);
    let seconds = mailparse::dateparse(text.as_ref()).ok()?;
    DateTime::from_timestamp(seconds, 0).map(|utc| utc.with_timezone(&Local))
}
