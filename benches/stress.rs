use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const CAR_RATE: i64 = 40;

fn base_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()
}

fn day(offset: u64) -> NaiveDate {
    base_day() + Days::new(offset)
}

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("autobook")
        .password("autobook");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn add_car(client: &tokio_postgres::Client) -> Ulid {
    let car = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO cars (id, name, daily_rate) VALUES ('{car}', 'bench', {CAR_RATE})"
        ))
        .await
        .unwrap();
    car
}

async fn book(
    client: &tokio_postgres::Client,
    id: Ulid,
    car: Ulid,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, car_id, owner_id, start, "end") VALUES ('{id}', '{car}', '{}', '{from}', '{to}')"#,
            Ulid::new()
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let car = add_car(&client).await;

    let n = 2000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        book(&client, Ulid::new(), car, day(i * 2), day(i * 2 + 2))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

/// Many clients race for the same weeks on one car. Exactly one wins each week.
async fn phase2_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let car = add_car(&setup).await;

    let n_tasks = 20;
    let weeks = 50u64;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let (won, lost) = (won.clone(), lost.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            for w in 0..weeks {
                match book(&client, Ulid::new(), car, day(w * 7), day(w * 7 + 7)).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} clients x {weeks} weeks in {:.2}s: {won} won, {} conflicts",
        elapsed.as_secs_f64(),
        lost.load(Ordering::Relaxed)
    );
    if won != weeks as usize {
        println!("  !! expected exactly {weeks} winners, got {won}");
    }
}

/// Shrink then extend the same reservations; extensions go through payment.
async fn phase3_reschedule_churn(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let car = add_car(&client).await;

    let n = 200u64;
    let mut ids = Vec::new();
    for i in 0..n {
        let id = Ulid::new();
        book(&client, id, car, day(i * 10), day(i * 10 + 5)).await.unwrap();
        ids.push((id, i * 10));
    }

    let mut shrink = Vec::new();
    let mut extend = Vec::new();
    for (id, offset) in &ids {
        let t = Instant::now();
        client
            .simple_query(&format!(
                r#"UPDATE reservations SET start = '{}', "end" = '{}' WHERE id = '{id}'"#,
                day(*offset),
                day(offset + 3)
            ))
            .await
            .unwrap();
        shrink.push(t.elapsed());

        let t = Instant::now();
        let rows = client
            .simple_query(&format!(
                r#"UPDATE reservations SET start = '{}', "end" = '{}' WHERE id = '{id}'"#,
                day(*offset),
                day(offset + 8)
            ))
            .await
            .unwrap();
        let Some(SimpleQueryMessage::Row(row)) = rows.first() else {
            panic!("reschedule returned no row");
        };
        let extra = row.get("extra_amount").unwrap_or("0");
        let version = row.get("version").unwrap_or("0");
        client
            .batch_execute(&format!(
                r#"INSERT INTO reschedule_payments (reservation_id, start, "end", extra_amount, version) VALUES ('{id}', '{}', '{}', {extra}, {version})"#,
                day(*offset),
                day(offset + 8)
            ))
            .await
            .unwrap();
        extend.push(t.elapsed());
    }

    print_latency("shrink (applied + refund)", &mut shrink);
    print_latency("extend (quote + pay + commit)", &mut extend);
}

async fn phase4_availability_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let read_car = add_car(&setup).await;
    for i in 0..100u64 {
        book(&setup, Ulid::new(), read_car, day(i * 3), day(i * 3 + 2))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let car = add_car(&client).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = book(&client, Ulid::new(), car, day(i), day(i + 1)).await;
                i += 1;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..10 {
        let host = host.to_string();
        let tenant = tenant.clone();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(500);
            for _ in 0..500 {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM availability WHERE car_id = '{read_car}' AND start >= '{}' AND "end" <= '{}'"#,
                        day(0),
                        day(365)
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query", &mut all);
}

/// Load generator against a running server at `AUTOBOOK_HOST`/`AUTOBOOK_PORT`.
#[tokio::main]
async fn main() {
    let host = std::env::var("AUTOBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("AUTOBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid AUTOBOOK_PORT");

    println!("=== autobook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential bookings");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contention on one car");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] reschedule churn");
    phase3_reschedule_churn(&host, port).await;

    println!("\n[phase 4] availability under write load");
    phase4_availability_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
