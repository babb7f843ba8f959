//! Background loops: retention pruning, episode monitoring, profile
//! summarisation, resource monitoring, and the optional donation reminder.
//! Each loop runs on its own timer, tolerates missed ticks, and exits when
//! the shutdown watch flips.

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use gryag_core::telemetry;
use gryag_memory::EntityType;

use crate::send::send_reply;
use crate::services::BotServices;
use crate::summarizer::GeminiSummarizer;
use crate::texts;

const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const PROFILE_INTERVAL: Duration = Duration::from_secs(6 * 3600);
const RESOURCE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const PROFILE_STALE_SECS: i64 = 6 * 3600;

pub fn spawn_all(
    services: Arc<BotServices>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        spawn_loop(
            "retention",
            RETENTION_INTERVAL,
            shutdown.clone(),
            Arc::clone(&services),
            |services| async move {
                match services.turns.prune_old(services.now_ts()) {
                    Ok(n) if n > 0 => info!(pruned = n, "retention pass complete"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "retention pass failed"),
                }
            },
        ),
        spawn_loop(
            "episodes",
            Duration::from_secs(services.settings.episode_monitor_interval_seconds),
            shutdown.clone(),
            Arc::clone(&services),
            |services| async move {
                // Background learners skip entirely while the breaker is open.
                if services.gemini.circuit_open() {
                    return;
                }
                let since = services.now_ts() - 7 * 86400;
                let threads = services.turns.active_threads(since).unwrap_or_default();
                let summarizer = GeminiSummarizer::new(Arc::clone(&services.gemini));
                for (chat_id, thread_id) in threads {
                    if let Err(e) = services
                        .monitor
                        .tick(chat_id, thread_id, services.now_ts(), &summarizer)
                        .await
                    {
                        warn!(error = %e, chat_id, "episode tick failed");
                    }
                }
            },
        ),
        spawn_loop(
            "profiles",
            PROFILE_INTERVAL,
            shutdown.clone(),
            Arc::clone(&services),
            |services| async move {
                if services.gemini.circuit_open() {
                    return;
                }
                let stale = services
                    .profiles
                    .stale_profiles(PROFILE_STALE_SECS, 20)
                    .unwrap_or_default();
                let summarizer = GeminiSummarizer::new(Arc::clone(&services.gemini));
                for profile in stale {
                    let facts = services
                        .facts
                        .get_facts(
                            EntityType::User,
                            profile.user_id,
                            &profile.chat_id.to_string(),
                            None,
                            0.3,
                            30,
                        )
                        .unwrap_or_default();
                    let name = profile.display_name.as_deref().unwrap_or("учасник");
                    if let Some(summary) = summarizer.profile_summary(name, &facts).await {
                        if let Err(e) =
                            services
                                .profiles
                                .set_summary(profile.chat_id, profile.user_id, &summary)
                        {
                            warn!(error = %e, user_id = profile.user_id, "summary write failed");
                        }
                    }
                }
            },
        ),
        spawn_loop(
            "resources",
            RESOURCE_INTERVAL,
            shutdown.clone(),
            Arc::clone(&services),
            |services| async move {
                let db_bytes = services.storage.size_bytes().unwrap_or(0);
                let collected = services.locks.gc();
                let counters = telemetry::snapshot();
                info!(db_bytes, locks_collected = collected, ?counters, "resource snapshot");

                if let Some(dir) = services.settings.log_dir.as_deref() {
                    prune_log_files(dir, services.settings.log_retention_days);
                }
            },
        ),
    ];

    if let Some(chat_id) = services.settings.donation_chat_id {
        if services.settings.donation_interval_hours > 0 {
            let interval = Duration::from_secs(services.settings.donation_interval_hours * 3600);
            let token = services.settings.telegram_token.clone();
            handles.push(spawn_loop(
                "donations",
                interval,
                shutdown,
                Arc::clone(&services),
                move |_services| {
                    let bot = Bot::new(token.clone());
                    async move {
                        send_reply(&bot, ChatId(chat_id), None, texts::DONATION_REMINDER).await;
                    }
                },
            ));
        }
    }

    handles
}

/// Delete rotated log files older than the retention window.
fn prune_log_files(dir: &str, retention_days: u32) {
    let cutoff = std::time::SystemTime::now()
        - Duration::from_secs(u64::from(retention_days) * 86400);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("gryag.log"))
            .unwrap_or(false);
        if !is_log {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|m| m < cutoff)
            .unwrap_or(false);
        if stale {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(error = %e, path = %path.display(), "log cleanup failed");
            }
        }
    }
}

/// Interval loop skeleton: tick, run, check shutdown. The first tick fires
/// after one full interval, not at startup.
fn spawn_loop<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    services: Arc<BotServices>,
    body: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<BotServices>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!(loop_name = name, every_secs = every.as_secs(), "background loop started");
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick consumed
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    body(Arc::clone(&services)).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(loop_name = name, "background loop stopping");
                        break;
                    }
                }
            }
        }
    })
}
