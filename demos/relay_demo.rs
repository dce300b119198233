//! Relay Demo - Conflation, Batching and Admission Control
//!
//! This example drives the full pipeline against an in-process sink that
//! simulates a brief congestion window, so you can watch the throttle
//! engage, the rejected batch replay, and the gate reopen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metric_relay::{
    Batch, Measurement, MergePolicy, MetricRelay, MetricValue, RelayConfig, Sink, SinkError,
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// Accepts batches, except for a simulated congestion window on batch 2.
struct DemoSink {
    deliveries: AtomicU64,
}

#[async_trait]
impl Sink<Batch> for DemoSink {
    async fn send(&self, batch: Batch) -> Result<(), SinkError<Batch>> {
        let n = self.deliveries.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 2 {
            println!("    sink: REJECTED batch of {} (congested)", batch.len());
            return Err(SinkError::Congested { rejected: batch });
        }
        let json = serde_json::to_string_pretty(&batch).unwrap_or_default();
        println!("    sink: delivered batch of {}:\n{}", batch.len(), json);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info,metric_relay=debug"))
        .init();

    println!("=== Metric Relay Demo ===\n");

    let config = RelayConfig::builder()
        .size_trigger(3) // flush at 3 distinct keys
        .time_trigger_ms(2_000) // or every 2 seconds
        .reprocess_poll_ms(500)
        .build();

    println!("Configuration:");
    println!("  size trigger:    {} distinct keys", config.size_trigger);
    println!("  time trigger:    {}ms", config.time_trigger_ms);
    println!("  reprocess poll:  {}ms\n", config.reprocess_poll_ms);

    let relay = MetricRelay::new(
        config,
        Arc::new(DemoSink {
            deliveries: AtomicU64::new(0),
        }),
    );
    let mut events = relay.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("    event: {:?}", event);
        }
    });

    println!("[1] Submitting conflating counters (same key, Sum policy)...");
    for i in 1..=4 {
        relay.submit(
            Measurement::builder("requests", MetricValue::Int(i))
                .tag("host", "web-1")
                .merge_policy(MergePolicy::Sum)
                .build(),
        );
    }
    relay.submit(
        Measurement::builder("latency_us", MetricValue::Int(420))
            .tag("host", "web-1")
            .merge_policy(MergePolicy::Max)
            .build(),
    );
    // Third distinct key fires the size trigger.
    relay.submit(Measurement::builder("free_mb", MetricValue::Int(2048)).build());
    sleep(Duration::from_millis(200)).await;

    println!("\n[2] Next batch hits the congestion window...");
    relay.submit(Measurement::builder("errors", MetricValue::Int(3)).build());
    relay.flush_now().await;

    println!("\n[3] Waiting for replay and gate reopen...");
    sleep(Duration::from_secs(2)).await;

    let stats = relay.stats();
    println!("\nFinal counters:");
    if let Some(acc) = &stats.accumulator {
        println!("  submitted:     {}", acc.submitted);
        println!("  conflated:     {}", acc.conflated);
        println!("  flushes:       {}", acc.flush_count);
    }
    println!("  sent:          {}", stats.gate.sent);
    println!("  queued:        {}", stats.gate.queued);
    println!("  reprocessed:   {}", stats.gate.reprocessed);
    println!("  throttle time: {}ms", stats.gate.throttle_time_ms);

    relay.shutdown();
    Ok(())
}
