use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_imap::extensions::idle::IdleResponse;
use imap_proto::{MailboxDatum, Response};
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::extract;
use crate::notify::{self, NotificationSink};
use crate::rate_limit::RateLimiter;
use crate::settings::{Config, ImapConfig};
use crate::watcher::imap::ImapSession;
use crate::watcher::message::{ForwardableEmail, MailboxMessage};

pub mod imap;
pub mod message;

/// Connection lifecycle. Every transition goes through
/// [`MailboxWatcher::transition`], which refuses to leave `Closed`; the
/// reconnect gate and the shutdown flag are the same piece of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Watching,
    Reconnecting,
    Closed,
}

/// Owns the IMAP connection and drives the watch loop: connect, scan
/// pre-existing unread mail, then wait in IDLE and rescan whenever the
/// server reports new messages. Every failure routes through a fixed
/// reconnect delay; only [`MailboxWatcher::end`] stops the loop.
pub struct MailboxWatcher<S> {
    imap: ImapConfig,
    password: String,
    /// Watched addresses, lowercased once at construction.
    targets: Vec<String>,
    reconnect_delay: Duration,
    idle_timeout: Duration,
    state: Mutex<ConnectionState>,
    cancel: CancellationToken,
    limiter: RateLimiter,
    sink: S,
}

impl<S: NotificationSink> MailboxWatcher<S> {
    pub fn new(config: &Config, password: String, sink: S) -> Self {
        Self {
            imap: config.imap.clone(),
            password,
            targets: config
                .monitoring
                .target_addresses
                .iter()
                .map(|target| target.to_lowercase())
                .collect(),
            reconnect_delay: Duration::from_secs(config.monitoring.reconnect_delay_seconds),
            idle_timeout: Duration::from_secs(config.monitoring.idle_timeout_seconds),
            state: Mutex::new(ConnectionState::Disconnected),
            cancel: CancellationToken::new(),
            limiter: RateLimiter::new(
                Duration::from_millis(config.rate_limit.window_ms),
                config.rate_limit.max_requests,
            ),
            sink,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Moves to `next` unless the watcher has been closed. `Closed` is
    /// terminal: once there, no transition leaves it and this returns false.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Closed {
            return false;
        }
        debug!("connection state {:?} -> {:?}", *state, next);
        *state = next;
        true
    }

    /// Runs the watch loop until [`MailboxWatcher::end`] is called.
    /// Connection and mailbox failures are logged and retried after the
    /// configured delay; this never returns an error to the caller.
    pub async fn connect(&self) {
        loop {
            if !self.transition(ConnectionState::Connecting) {
                return;
            }
            match imap::create_session(&self.imap, &self.password).await {
                Ok(session) => {
                    if !self.transition(ConnectionState::Connected) {
                        return;
                    }
                    match self.watch(session).await {
                        // the watch loop only finishes cleanly on shutdown
                        Ok(()) => return,
                        Err(err) => error!("watch loop failed: {:#}", err),
                    }
                }
                Err(err) => error!(
                    "connection to {}:{} failed: {:#}",
                    self.imap.server, self.imap.port, err
                ),
            }

            if !self.transition(ConnectionState::Reconnecting) {
                return;
            }
            info!("reconnecting in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// Requests termination: no further reconnect attempts, any idle wait
    /// or backoff delay unblocks promptly, the connection is dropped
    /// without a logout. Safe to call in any state; calling it again once
    /// closed is a no-op.
    pub fn end(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Closed {
            return;
        }
        info!("closing mailbox watcher");
        *state = ConnectionState::Closed;
        drop(state);
        self.cancel.cancel();
    }

    async fn watch(&self, mut session: ImapSession) -> Result<()> {
        let mailbox = session
            .select(&self.imap.mailbox)
            .await
            .with_context(|| format!("cannot open mailbox {}", self.imap.mailbox))?;
        if !self.transition(ConnectionState::Watching) {
            return Ok(());
        }
        info!(
            "watching {} ({} messages)",
            self.imap.mailbox, mailbox.exists
        );
        let mut last_exists = mailbox.exists;

        // unread mail that predates this session is picked up before the
        // first idle round
        self.scan(&mut session).await?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let mut idle = session.idle();
            idle.init().await.context("cannot enter idle")?;
            let (idle_wait, interrupt) = idle.wait_with_timeout(self.idle_timeout);
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                response = idle_wait => response.context("idle wait failed")?,
            };
            drop(interrupt);
            session = idle.done().await.context("cannot leave idle")?;

            // a push that was in flight when end() was called must not
            // trigger one more scan
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match response {
                IdleResponse::NewData(data) => {
                    if mailbox_grew(data.parsed(), &mut last_exists) {
                        debug!("mailbox activity, scanning for new messages");
                        self.scan(&mut session).await?;
                    }
                }
                // keepalive lapsed, re-issue idle
                IdleResponse::Timeout | IdleResponse::ManualInterrupt => {}
            }
        }
    }

    /// Fetches everything currently unread and forwards the messages
    /// addressed to a watched recipient. A failure in one message's
    /// pipeline is logged and does not stop the rest of the scan; a
    /// failure of the scan itself is a connection error.
    async fn scan(&self, session: &mut ImapSession) -> Result<()> {
        let unseen = imap::search_unseen(session).await?;
        if unseen.is_empty() {
            debug!("no unread messages");
            return Ok(());
        }
        debug!("{} unread message(s) to inspect", unseen.len());

        let messages = imap::fetch_envelopes(session, &unseen).await?;
        for message in &messages {
            let Some(recipient) = message.matched_target(&self.targets) else {
                debug!(
                    "message {} \"{}\" from {} is not for a watched address",
                    message.seq, message.subject, message.sender
                );
                continue;
            };
            if let Err(err) = self.process(session, message, recipient).await {
                error!(
                    "cannot forward message {} \"{}\": {:#}",
                    message.seq, message.subject, err
                );
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        session: &mut ImapSession,
        message: &MailboxMessage,
        recipient: String,
    ) -> Result<()> {
        let raw = imap::download(session, message.seq).await?;
        let content = extract::to_plain_text(&raw);
        // the read flag goes on before the send path ever sees the message
        imap::mark_seen(session, message.seq).await?;

        let email = ForwardableEmail {
            subject: message.subject.clone(),
            recipient,
            date: message.date,
            content,
        };
        self.forward(email).await
    }

    /// The rate-limited send path. A rejected acquisition drops the
    /// message: it is already marked read and is not retried.
    pub(crate) async fn forward(&self, email: ForwardableEmail) -> Result<()> {
        if !self.limiter.try_acquire() {
            bail!("rate limit exceeded, message dropped");
        }
        let formatted = notify::format_message(&email);
        self.sink.notify(&formatted).await?;
        info!("forwarded \"{}\" for {}", email.subject, email.recipient);
        Ok(())
    }
}

/// True when an unsolicited idle response says the message count went up.
/// `last_exists` tracks the count across idle rounds so the EXISTS a
/// server issues after an expunge does not trigger a scan.
pub(crate) fn mailbox_grew(response: &Response<'_>, last_exists: &mut u32) -> bool {
    match response {
        Response::MailboxData(MailboxDatum::Exists(count)) => {
            let grew = *count > *last_exists;
            *last_exists = *count;
            grew
        }
        Response::MailboxData(MailboxDatum::Recent(count)) => *count > 0,
        _ => false,
    }
}
