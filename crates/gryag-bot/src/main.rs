//! gryag — a Telegram group-chat bot with persistent memory.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use teloxide::prelude::*;
use tokio::sync::watch;
use tracing::info;

mod commands;
mod format;
mod handler;
mod learner;
mod logging;
mod loops;
mod media;
mod pipeline;
mod send;
mod services;
mod summarizer;
mod texts;
mod trigger;
mod typing;

use services::BotServices;

#[derive(Debug, Parser)]
#[command(name = "gryag", about = "Telegram group-chat bot with persistent memory")]
struct Cli {
    /// Print the resolved configuration (secrets redacted) and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match gryag_core::Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = logging::init(&settings).context("logging init failed")?;

    if cli.check_config {
        info!(model = %settings.gemini_model, db = %settings.db_path, "configuration ok");
        return Ok(());
    }

    let services = Arc::new(BotServices::build(settings.clone())?);
    info!(
        model = %settings.gemini_model,
        tools = ?services.registry.names(),
        "gryag starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handles = loops::spawn_all(Arc::clone(&services), shutdown_rx);

    let bot = Bot::new(&settings.telegram_token);

    let tree = dptree::entry()
        .branch(Update::filter_message().endpoint(handler::on_message))
        .branch(Update::filter_callback_query().endpoint(handler::on_callback));

    Dispatcher::builder(bot, tree)
        .dependencies(dptree::deps![Arc::clone(&services)])
        .default_handler(|_upd| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    // Polling stopped: let in-flight pipelines and loops drain, then close.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let drain = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        for handle in loop_handles {
            let _ = handle.await;
        }
    });
    let _ = drain.await;
    info!("bye");
    Ok(())
}
