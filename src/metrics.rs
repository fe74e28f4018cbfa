//! Prometheus metrics for the round engine

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    pub rounds_created: IntCounter,
    pub rounds_crashed: IntCounter,
    pub active_rounds: IntGauge,
    pub bets_placed: IntCounter,
    /// Settlements by kind: auto, manual, loss
    pub settlements: IntCounterVec,
    /// Rejected requests by reason
    pub rejections: IntCounterVec,
    pub storage_failures: IntCounter,
    pub tick_duration: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("crashpoint".to_string()), None)?;

        let rounds_created = IntCounter::new("rounds_created_total", "Rounds created")?;
        let rounds_crashed = IntCounter::new("rounds_crashed_total", "Rounds that reached crashed")?;
        let active_rounds = IntGauge::new("active_rounds", "Rounds scheduled or running")?;
        let bets_placed = IntCounter::new("bets_placed_total", "Bets accepted")?;
        let settlements = IntCounterVec::new(Opts::new("settlements_total", "Bets settled by kind"), &["kind"])?;
        let rejections = IntCounterVec::new(Opts::new("rejections_total", "Rejected operations by reason"), &["reason"])?;
        let storage_failures = IntCounter::new("storage_failures_total", "Persistence writes that failed soft")?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Duration of one scheduler tick")
                .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]),
        )?;

        registry.register(Box::new(rounds_created.clone()))?;
        registry.register(Box::new(rounds_crashed.clone()))?;
        registry.register(Box::new(active_rounds.clone()))?;
        registry.register(Box::new(bets_placed.clone()))?;
        registry.register(Box::new(settlements.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(storage_failures.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;

        Ok(Self {
            registry,
            rounds_created,
            rounds_crashed,
            active_rounds,
            bets_placed,
            settlements,
            rejections,
            storage_failures,
            tick_duration,
        })
    }

    pub fn record_settlement(&self, kind: &str) {
        self.settlements.with_label_values(&[kind]).inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejections.with_label_values(&[reason]).inc();
    }

    /// Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
