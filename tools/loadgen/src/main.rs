// =============================================================================
// GEOPULSE — Load Generator
// =============================================================================
// Publishes well-formed SampleEvent JSON to the ingress topic at configurable
// rates, fanning out across synthetic zones with jittered coordinates.
// =============================================================================

use clap::Parser;
use rand::Rng;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// Event shape matching the processor's ingress contract.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SampleEvent {
    event_id: String,
    zone_id: String,
    latitude: f64,
    longitude: f64,
    load: f64,
    event_timestamp: i64,
    produced_at: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Pattern {
    /// Constant load for every zone.
    Flat,
    /// Linear climb from 0.1 to the target load over the run.
    Ramp,
    /// Low baseline with a full-load burst for 90 s out of every 180 s.
    Spike,
}

#[derive(Parser)]
#[command(name = "geopulse-loadgen")]
#[command(about = "Load generator for the GeoPulse ingress topic")]
struct Args {
    /// Kafka bootstrap servers
    #[arg(long, default_value = "localhost:9092")]
    brokers: String,

    /// Ingress topic
    #[arg(long, default_value = "raw.zone.events")]
    topic: String,

    /// Events per second across all zones
    #[arg(long, default_value_t = 100)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of synthetic zones
    #[arg(long, default_value_t = 10)]
    zones: usize,

    /// Target load in [0, 1]
    #[arg(long, default_value_t = 0.95)]
    load: f64,

    /// Load shape over time
    #[arg(long, value_enum, default_value = "flat")]
    pattern: Pattern,

    /// Center latitude
    #[arg(long, default_value_t = 41.00)]
    lat: f64,

    /// Center longitude
    #[arg(long, default_value_t = 29.00)]
    lon: f64,
}

struct Counters {
    sent: AtomicU64,
    enqueue_failed: AtomicU64,
    enqueue_latency_us: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            enqueue_failed: AtomicU64::new(0),
            enqueue_latency_us: AtomicU64::new(0),
        }
    }
}

fn load_at(pattern: Pattern, target: f64, elapsed: Duration, total: Duration) -> f64 {
    match pattern {
        Pattern::Flat => target,
        Pattern::Ramp => {
            let frac = (elapsed.as_secs_f64() / total.as_secs_f64()).min(1.0);
            0.1 + (target - 0.1) * frac
        }
        Pattern::Spike => {
            if elapsed.as_secs() % 180 < 90 {
                0.2
            } else {
                target
            }
        }
    }
}

fn build_event(rng: &mut impl Rng, args: &Args, zone_idx: usize, tick: u64, load: f64) -> SampleEvent {
    let now_ms = chrono::Utc::now().timestamp_millis();
    // Stable per-zone offset plus per-event jitter, all within ~1 km.
    let zone_lat = args.lat + (zone_idx as f64) * 0.01;
    let zone_lon = args.lon + (zone_idx as f64) * 0.01;
    SampleEvent {
        event_id: format!("lg-{tick}-{zone_idx}"),
        zone_id: format!("Z-{zone_idx}"),
        latitude: zone_lat + rng.gen_range(-0.005..0.005),
        longitude: zone_lon + rng.gen_range(-0.005..0.005),
        load: (load + rng.gen_range(-0.02..0.02)).clamp(0.0, 1.0),
        event_timestamp: now_ms,
        produced_at: now_ms,
    }
}

fn main() {
    let args = Args::parse();

    println!("=== GeoPulse Load Generator ===");
    println!("Brokers:  {}", args.brokers);
    println!("Topic:    {}", args.topic);
    println!("Rate:     {} evt/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Zones:    {}", args.zones);
    println!("Load:     {:.2}", args.load);
    println!();

    let producer: ThreadedProducer<DefaultProducerContext> = ClientConfig::new()
        .set("bootstrap.servers", &args.brokers)
        .set("message.timeout.ms", "10000")
        .create()
        .unwrap_or_else(|e| {
            eprintln!("Cannot create producer: {e}");
            std::process::exit(1);
        });

    let counters = Counters::new();
    let total = Duration::from_secs(args.duration);
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + total;

    println!("Sending...\n");
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let zone_idx = (tick as usize) % args.zones.max(1);
        let load = load_at(args.pattern, args.load, start.elapsed(), total);
        let event = build_event(&mut rng, &args, zone_idx, tick, load);
        let payload = serde_json::to_vec(&event).unwrap();

        let enqueue_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);
        let record = BaseRecord::to(&args.topic)
            .key(&event.zone_id)
            .payload(&payload);
        if producer.send(record).is_err() {
            counters.enqueue_failed.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .enqueue_latency_us
            .fetch_add(enqueue_start.elapsed().as_micros() as u64, Ordering::Relaxed);

        tick += 1;

        // Print progress every 500 events
        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} enqueue_failed={} ({:.0} evt/s)",
                elapsed,
                sent,
                counters.enqueue_failed.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        // Rate pacing
        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    print!("Flushing producer queue... ");
    match producer.flush(Duration::from_secs(30)) {
        Ok(()) => println!("done"),
        Err(e) => println!("failed: {e}"),
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let failed = counters.enqueue_failed.load(Ordering::Relaxed);
    let avg_lat = if sent > 0 {
        counters.enqueue_latency_us.load(Ordering::Relaxed) / sent
    } else {
        0
    };

    println!("\n=== Results ===");
    println!("Duration:       {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:     {sent}");
    println!(
        "Enqueued:       {} ({:.1}%)",
        sent - failed,
        (sent - failed) as f64 / sent.max(1) as f64 * 100.0
    );
    println!("Enqueue failed: {failed}");
    println!("Avg enqueue:    {avg_lat} us");
    println!("Throughput:     {:.1} evt/s", sent as f64 / elapsed.as_secs_f64());
}
