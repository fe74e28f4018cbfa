use criterion::{black_box, criterion_group, criterion_main, Criterion};
use crashpoint::{fairness, BetLedger, Round};
use chrono::{DateTime, Duration};

fn bench_derive(c: &mut Criterion) {
    let seed = fairness::generate_server_seed();
    c.bench_function("derive_crash_point", |b| {
        b.iter(|| fairness::derive_crash_point(black_box(&seed)))
    });
}

fn bench_auto_sweep(c: &mut Criterion) {
    let start = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default();
    let mut round = Round::with_seed("seed-21".to_string(), 0.25, start, start).unwrap();
    round.advance(start).unwrap();

    let mut ledger = BetLedger::new(round.id());
    for i in 0..1_000 {
        let target = 2.0 + (i % 400) as f64 / 10.0;
        ledger
            .place(&round, start, &format!("player-{i}"), 1.0, Some(target))
            .unwrap();
    }

    c.bench_function("sweep_1000_unsettled_bets", |b| {
        b.iter(|| {
            let mut ledger = ledger.clone();
            let now = start + Duration::seconds(1);
            ledger.evaluate_auto_cashouts(&round, black_box(1.5), now)
        })
    });
}

criterion_group!(benches, bench_derive, bench_auto_sweep);
criterion_main!(benches);
