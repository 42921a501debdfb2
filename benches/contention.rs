use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config.host(host).port(port).user("pawbook").password(
        std::env::var("PAWBOOK_PASSWORD").unwrap_or_else(|_| "pawbook".into()),
    );

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn first_id(messages: &[SimpleQueryMessage]) -> String {
    messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
            _ => None,
        })
        .expect("no row returned")
}

async fn create_slots(client: &tokio_postgres::Client, offer: Ulid, n: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n as i64 {
        let start = BASE + i * HOUR;
        let end = start + HOUR;
        let msgs = client
            .simple_query(&format!(
                "INSERT INTO slots (offer_id, start_time, end_time) VALUES ('{offer}', {start}, {end})"
            ))
            .await
            .unwrap();
        ids.push(first_id(&msgs));
    }
    ids
}

async fn phase1_sequential(host: &str, port: u16) {
    let n = 500;
    let client = connect(host, port).await;
    let offer = Ulid::new();
    let slots = create_slots(&client, offer, n).await;

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for slot in &slots {
        let t = Instant::now();
        client
            .simple_query(&format!(
                "INSERT INTO bookings VALUES ('{offer}', '{slot}', '{}')",
                Ulid::new()
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve", &mut latencies);
}

async fn phase2_contended(host: &str, port: u16) {
    let n_slots = 50;
    let n_clients = 32;

    let setup = connect(host, port).await;
    let offer = Ulid::new();
    let slots = Arc::new(create_slots(&setup, offer, n_slots).await);

    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let latencies = Arc::new(Mutex::new(Vec::new()));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let host = host.to_string();
        let slots = slots.clone();
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        let latencies = latencies.clone();

        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let owner = Ulid::new();
            let mut local = Vec::with_capacity(slots.len());
            // Every client walks the same slots, so each one is fought over.
            for slot in slots.iter() {
                let t = Instant::now();
                let result = client
                    .simple_query(&format!(
                        "INSERT INTO bookings VALUES ('{offer}', '{slot}', '{owner}')"
                    ))
                    .await;
                local.push(t.elapsed());
                match result {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => eprintln!("unexpected error: {e}"),
                }
            }
            latencies.lock().await.extend(local);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let elapsed = start.elapsed();

    let wins = wins.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {n_slots} slots in {:.2}s: {wins} booked, {conflicts} conflicts",
        elapsed.as_secs_f64()
    );
    print_latency("contended reserve", &mut latencies.lock().await);

    let booked = setup
        .simple_query(&format!("SELECT * FROM bookings WHERE offer_id = '{offer}'"))
        .await
        .unwrap()
        .iter()
        .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
        .count();
    if wins == n_slots && booked == n_slots {
        println!("  ok: every slot booked exactly once");
    } else {
        println!("  DOUBLE BOOKING: {wins} wins, {booked} bookings for {n_slots} slots");
    }
}

async fn phase3_reads_under_load(host: &str, port: u16) {
    let n_slots = 200;
    let setup = connect(host, port).await;
    let offer = Ulid::new();
    let slots = create_slots(&setup, offer, n_slots).await;

    let writer_host = host.to_string();
    let writer = tokio::spawn(async move {
        let client = connect(&writer_host, port).await;
        for slot in &slots {
            let _ = client
                .simple_query(&format!(
                    "INSERT INTO bookings VALUES ('{offer}', '{slot}', '{}')",
                    Ulid::new()
                ))
                .await;
        }
    });

    let reader = connect(host, port).await;
    let window_end = BASE + n_slots as i64 * HOUR;
    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        reader
            .simple_query(&format!(
                "SELECT * FROM slots WHERE offer_id = '{offer}' \
                 AND start_time >= {BASE} AND start_time < {window_end} AND is_booked = false"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    writer.await.unwrap();
    print_latency("available-slot listing", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("PAWBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PAWBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid PAWBOOK_PORT");

    println!("=== pawbook contention benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential reservations");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended reservations");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] slot listing under write load");
    phase3_reads_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
