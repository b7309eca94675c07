//! Demonstration of a request-scoped collector feeding a tally store.
//!
//! This example simulates a few hundred requests. Each request gets its own
//! collector, records how long it took, defers an expensive sample with
//! `lazy`, and ingests when the request ends. The store is then queried for
//! the slowest routes over the trailing hour.

use std::sync::Arc;

use tally::{
    Aggregate, Collector, FixedClock, Ingest, Order, Period, SqliteStorage, Storage, TallyConfig,
};

const ROUTES: [&str; 4] = ["GET /", "GET /users/{id}", "POST /orders", "GET /reports"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = TallyConfig::default();

    // A fixed clock makes the output reproducible.
    let clock = FixedClock::new(1_710_429_249);
    let shared: tally::SharedClock = Arc::new(clock.clone());

    let storage = Arc::new(SqliteStorage::open_in_memory(&config, shared.clone())?);
    let ingest = Arc::new(Ingest::storage(storage.clone(), shared.clone()));

    for i in 0..400_i64 {
        clock.advance(5);

        let mut collector = Collector::from_config(&config, ingest.clone(), shared.clone());
        collector.remember_user(format!("user-{}", i % 7));

        let route = ROUTES[usize::try_from(i).unwrap_or(0) % ROUTES.len()];
        let duration = 20 + (i * 37) % 900;
        collector
            .record("request", route, Some(duration))
            .count()
            .max()
            .avg();

        // Only computed if this request actually ingests.
        collector.lazy(move |c| {
            c.set("last_request", "duration_ms", duration.to_string());
            Ok(())
        });

        collector.ingest();
    }

    let rows = storage.aggregate(
        "request",
        &[Aggregate::Count, Aggregate::Max, Aggregate::Avg],
        Period::Hour,
        Some(Aggregate::Avg),
        Order::default(),
    )?;

    println!("{:<20} {:>6} {:>8} {:>8}", "route", "count", "max", "avg");
    for row in rows {
        println!(
            "{:<20} {:>6} {:>8} {:>8.1}",
            row.key,
            row.get(Aggregate::Count).unwrap_or_default(),
            row.get(Aggregate::Max).unwrap_or_default(),
            row.get(Aggregate::Avg).unwrap_or_default(),
        );
    }

    let last = storage.values("last_request", None)?;
    println!("last request value: {:?}", last.get("duration_ms").map(|v| &v.value));

    Ok(())
}
