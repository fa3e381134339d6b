mod credentials;
mod extract;
mod notify;
mod rate_limit;
mod settings;
#[cfg(test)]
mod tests;
mod watcher;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use log::{error, info};

use crate::notify::TelegramNotifier;
use crate::watcher::MailboxWatcher;

fn setup_logging() -> Result<(), fern::InitError> {
    let own_level = if std::env::var_os("MAILGRAM_DEBUG").is_some() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .level_for("mailgram", own_level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_logging()?;

    let matches = Command::new("mailgram")
        .about("Forwards mailbox messages for watched addresses to a Telegram channel")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .default_value("settings.yaml")
                .help("Path to the YAML settings file"),
        )
        .get_matches();
    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .expect("config has a default value"),
    );

    let config = settings::load_settings(&config_path)?;
    let password = credentials::get_secret("imap-password", "Enter the IMAP password: ")?;
    let token = credentials::get_secret("telegram-bot-token", "Enter the Telegram bot token: ")?;

    let sink = TelegramNotifier::new(token, config.telegram.chat_id.clone());
    let watcher = Arc::new(MailboxWatcher::new(&config, password, sink));

    let shutdown = watcher.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("cannot listen for the shutdown signal: {}", err);
            return;
        }
        info!("Shutting down...");
        shutdown.end();
    });

    info!("Starting mailgram");
    watcher.connect().await;
    info!("watcher stopped in state {:?}", watcher.state());
    Ok(())
}
