//! Background schedulers
//!
//! Four independent periodic tasks drive the funnel: a judge sweep over all
//! live STM keys, staging promotion, decay eviction and long-term dedup.
//! All of them share one watch-channel shutdown signal; `join_all` is the
//! barrier that lets shutdown wait for in-flight ticks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::MemoryEngine;

/// Judge sweep cadence
const JUDGE_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Decay eviction cadence
const DECAY_INTERVAL: Duration = Duration::from_secs(24 * 3600);
/// Long-term dedup cadence
const LTM_DEDUP_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Handles for every spawned background task
pub struct TaskSet {
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Wait for every task to drain
    pub async fn join_all(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "background task panicked");
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the four funnel schedulers
pub fn spawn_schedulers(engine: Arc<MemoryEngine>, shutdown: watch::Receiver<bool>) -> TaskSet {
    let mut tasks = TaskSet::new();

    // Promotion runs at half the staging wait, but at least hourly
    let promote_hours = (engine.config.staging.min_wait_hours / 2).max(1) as u64;
    let promote_interval = Duration::from_secs(promote_hours * 3600);
    info!(interval_hours = promote_hours, "starting promotion task");
    tasks.push(spawn_periodic(
        "promotion",
        promote_interval,
        shutdown.clone(),
        {
            let engine = engine.clone();
            move || {
                let engine = engine.clone();
                async move { engine.promote_staging().await }
            }
        },
    ));

    info!(interval_secs = JUDGE_SWEEP_INTERVAL.as_secs(), "starting judge sweep task");
    tasks.push(spawn_periodic(
        "judge-sweep",
        JUDGE_SWEEP_INTERVAL,
        shutdown.clone(),
        {
            let engine = engine.clone();
            move || {
                let engine = engine.clone();
                async move { judge_sweep(&engine).await }
            }
        },
    ));

    info!("starting decay eviction task");
    tasks.push(spawn_periodic("decay", DECAY_INTERVAL, shutdown.clone(), {
        let engine = engine.clone();
        move || {
            let engine = engine.clone();
            async move { engine.scan_and_evict_decayed().await }
        }
    }));

    info!("starting long-term dedup task");
    tasks.push(spawn_periodic("ltm-dedup", LTM_DEDUP_INTERVAL, shutdown, {
        let engine = engine.clone();
        move || {
            let engine = engine.clone();
            async move { engine.deduplicate_ltm().await }
        }
    }));

    tasks
}

/// One sweep over every live STM key; each user is visited at most once
pub async fn judge_sweep(engine: &MemoryEngine) -> crate::error::Result<()> {
    let keys = engine.list_store.scan_keys("memory:stm:*").await?;

    let mut processed_users: HashSet<String> = HashSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix("memory:stm:") else {
            continue;
        };
        let Some((user_id, session_id)) = rest.split_once(':') else {
            continue;
        };
        if !processed_users.insert(user_id.to_string()) {
            continue;
        }
        if let Err(e) = engine.judge_and_stage(user_id, session_id).await {
            error!(user_id, session_id, error = %e, "judge sweep item failed");
            processed_users.remove(user_id);
        }
    }

    Ok(())
}

/// Run a fallible tick on a fixed interval until shutdown flips
fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = crate::error::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so work starts
        // one full interval after boot.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = tick().await {
                        error!(task = name, error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(task = name, "scheduler stopped");
                    return;
                }
            }
        }
    })
}
