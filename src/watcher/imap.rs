use anyhow::{anyhow, Context, Result};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use log::{info, warn};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::settings::ImapConfig;
use crate::watcher::message::MailboxMessage;

pub type ImapSession = Session<Compat<tokio_native_tls::TlsStream<TcpStream>>>;

// Establish a TLS-encrypted connection to the IMAP server
async fn connect_to_server(server: &str, port: u16) -> Result<tokio_native_tls::TlsStream<TcpStream>> {
    let tcp_stream = TcpStream::connect((server, port))
        .await
        .with_context(|| format!("cannot reach {}:{}", server, port))?;
    let tls = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
    let tls_stream = tls.connect(server, tcp_stream).await?;

    info!("-- connected to {}:{}", server, port);
    Ok(tls_stream)
}

/// Connects and logs in, returning an authenticated session.
pub async fn create_session(settings: &ImapConfig, password: &str) -> Result<ImapSession> {
    let tls_stream = connect_to_server(&settings.server, settings.port).await?;
    let client = Client::new(tls_stream.compat());

    let session = client
        .login(&settings.username, password)
        .await
        .map_err(|e| e.0)
        .with_context(|| format!("login as {} refused", settings.username))?;

    info!("-- logged in as {}", settings.username);
    Ok(session)
}

/// Sequence numbers of every message the server still reports unread.
pub async fn search_unseen(session: &mut ImapSession) -> Result<Vec<u32>> {
    let unseen = session
        .search("UNSEEN")
        .await
        .context("UNSEEN search failed")?;
    let mut seqs: Vec<u32> = unseen.into_iter().collect();
    seqs.sort_unstable();
    Ok(seqs)
}

/// Envelope and flag data for the given messages. A message whose envelope
/// cannot be interpreted is skipped with a warning; it must not take the
/// rest of the scan down with it.
pub async fn fetch_envelopes(session: &mut ImapSession, seqs: &[u32]) -> Result<Vec<MailboxMessage>> {
    let set = seqs
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let stream = session
        .fetch(set, "(FLAGS ENVELOPE)")
        .await
        .context("envelope fetch failed")?;
    let fetches: Vec<_> = stream.try_collect().await?;

    let messages = fetches
        .iter()
        .filter_map(|fetch| match MailboxMessage::from_fetch(fetch) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!("skipping message {}: {:#}", fetch.message, err);
                None
            }
        })
        .collect();
    Ok(messages)
}

/// Downloads the full raw message without touching its flags.
pub async fn download(session: &mut ImapSession, seq: u32) -> Result<Vec<u8>> {
    let stream = session
        .fetch(seq.to_string(), "BODY.PEEK[]")
        .await
        .context("body fetch failed")?;
    let fetches: Vec<_> = stream.try_collect().await?;

    let fetch = fetches
        .first()
        .ok_or_else(|| anyhow!("server returned no data for message {}", seq))?;
    let body = fetch
        .body()
        .ok_or_else(|| anyhow!("message {} has no body", seq))?;
    Ok(body.to_vec())
}

/// Flips the server-side read flag, the sole dedup mechanism.
pub async fn mark_seen(session: &mut ImapSession, seq: u32) -> Result<()> {
    let stream = session
        .store(seq.to_string(), "+FLAGS (\\Seen)")
        .await
        .context("cannot set the \\Seen flag")?;
    let _updates: Vec<_> = stream.try_collect().await?;
    Ok(())
}
