//! Round scheduler
//!
//! Periodic control loop that applies the time rules to every open round.
//! Rounds are ticked in parallel, bounded by a semaphore; each round is
//! still serialized by its own lock inside the engine.

use crate::{
    config::SchedulerConfig,
    engine::{CrashEngine, TickReport},
    errors::CrashError,
};
use futures::future::join_all;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

pub struct RoundScheduler {
    engine: Arc<CrashEngine>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    stopped: Arc<Notify>,
}

impl RoundScheduler {
    pub fn new(engine: Arc<CrashEngine>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_rounds.max(1)));
        Self {
            engine,
            config,
            permits,
            running: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the loop on a background task
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move { self.run().await })
    }

    /// Ask the loop to exit; the current tick completes first
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stopped.notify_one();
    }

    async fn run(&self) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_ms = self.config.tick_interval_ms,
            max_concurrent_rounds = self.config.max_concurrent_rounds,
            auto_start_rounds = self.config.auto_start_rounds,
            "Round scheduler started"
        );

        while self.is_running() {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick_once().await;
                    if report.crashed > 0 || report.started > 0 {
                        tracing::debug!(
                            rounds = report.rounds,
                            started = report.started,
                            crashed = report.crashed,
                            settled = report.settled,
                            "Tick applied transitions"
                        );
                    }
                }
                _ = self.stopped.notified() => break,
            }
        }

        tracing::info!("Round scheduler stopped");
    }

    /// One pass over every open round at the engine's current time
    pub async fn tick_once(&self) -> TickReport {
        let started_at = Instant::now();

        if self.config.auto_start_rounds && self.engine.open_round_count() == 0 {
            if let Err(e) = self.engine.create_round(None, None).await {
                tracing::error!(error = %e, "Failed to schedule next round");
            }
        }

        let now = self.engine.now();
        let ticks = self.engine.active_round_ids().into_iter().map(|round_id| {
            let permits = Arc::clone(&self.permits);
            let engine = Arc::clone(&self.engine);
            async move {
                let _permit = permits.acquire_owned().await.ok()?;
                match engine.tick_round(round_id, now).await {
                    Ok(outcome) => Some(outcome),
                    // Retired by an operator override since the id was listed
                    Err(CrashError::RoundNotFound(_)) => None,
                    Err(e) => {
                        tracing::error!(round_id = %round_id, error = %e, "Round tick failed");
                        None
                    }
                }
            }
        });

        let mut report = TickReport::default();
        for outcome in join_all(ticks).await.into_iter().flatten() {
            report.absorb(outcome);
        }

        self.engine
            .metrics()
            .tick_duration
            .observe(started_at.elapsed().as_secs_f64());
        report
    }
}
