use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const T0: i64 = 1_900_000_000_000;

async fn connect(host: &str, port: u16, clinic: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(clinic)
        .user("vetbook")
        .password("vetbook");

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

/// One veterinarian with a fresh schedule, in its own clinic.
struct Clinic {
    name: String,
    vet_user: Ulid,
    vet: Ulid,
}

async fn register(client: &Client, name: &str, role: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{id}', '{name}', '{id}@bench.test', '{role}')"
        ))
        .await
        .unwrap();
    id
}

async fn act_as(client: &Client, user: Ulid) {
    client
        .batch_execute(&format!("SET actor = '{user}'"))
        .await
        .unwrap();
}

async fn setup_clinic(host: &str, port: u16) -> Clinic {
    let name = format!("bench_{}", Ulid::new());
    let client = connect(host, port, &name).await;
    let admin = register(&client, "Admin", "admin").await;
    let vet_user = register(&client, "Dr. Bench", "veterinarian").await;
    let vet = Ulid::new();
    act_as(&client, admin).await;
    client
        .batch_execute(&format!(
            "INSERT INTO veterinarians VALUES ('{vet}', '{vet_user}', 'LIC-{vet}', 5, 500.00, NULL)"
        ))
        .await
        .unwrap();
    Clinic { name, vet_user, vet }
}

/// Create `n` back-to-back one-hour slots starting at `first`.
async fn open_slots(client: &Client, clinic: &Clinic, first: i64, n: usize) -> Vec<Ulid> {
    act_as(client, clinic.vet_user).await;
    let mut slots = Vec::with_capacity(n);
    for i in 0..n {
        let id = Ulid::new();
        let s = first + (i as i64) * HOUR;
        client
            .batch_execute(&format!(
                "INSERT INTO time_slots VALUES ('{id}', '{}', {s}, {}, false)",
                clinic.vet,
                s + HOUR
            ))
            .await
            .unwrap();
        slots.push(id);
    }
    slots
}

/// Register a pet owner with one pet and leave the connection acting as them.
async fn owner_with_pet(client: &Client) -> Ulid {
    let owner = register(client, "Owner", "pet_owner").await;
    act_as(client, owner).await;
    let pet = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO pets VALUES ('{pet}', 'Rex', 'dog', 'Mixed', 3, 12.0, 'male', NULL)"
        ))
        .await
        .unwrap();
    pet
}

fn book_sql(clinic: &Clinic, pet: Ulid, slot: Ulid) -> String {
    format!(
        "INSERT INTO appointments VALUES ('{}', '{}', '{pet}', '{slot}')",
        Ulid::new(),
        clinic.vet
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let clinic = setup_clinic(host, port).await;
    let client = connect(host, port, &clinic.name).await;
    let n = 2000;
    let slots = open_slots(&client, &clinic, T0, n).await;
    let pet = owner_with_pet(&client).await;

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for slot in slots {
        let t = Instant::now();
        client.batch_execute(&book_sql(&clinic, pet, slot)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

async fn phase2_contention(host: &str, port: u16) {
    let clinic = Arc::new(setup_clinic(host, port).await);
    let setup = connect(host, port, &clinic.name).await;
    let n_slots = 50;
    let n_owners = 20;
    let slots = Arc::new(open_slots(&setup, &clinic, T0, n_slots).await);

    let booked = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_owners {
        let host = host.to_string();
        let clinic = clinic.clone();
        let slots = slots.clone();
        let booked = booked.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &clinic.name).await;
            let pet = owner_with_pet(&client).await;
            // Everyone goes after the same slots in the same order.
            for slot in slots.iter() {
                match client.batch_execute(&book_sql(&clinic, pet, *slot)).await {
                    Ok(()) => {
                        booked.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected booking error: {e}"),
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let booked = booked.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_owners} owners x {n_slots} slots: {booked} booked, {conflicts} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(booked, n_slots, "every slot must be booked exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let clinic = Arc::new(setup_clinic(host, port).await);
    let setup = connect(host, port, &clinic.name).await;
    let slots = Arc::new(open_slots(&setup, &clinic, T0, 500).await);
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let clinic = clinic.clone();
        let slots = slots.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &clinic.name).await;
            let pet = owner_with_pet(&client).await;
            for slot in slots.iter().skip(w).step_by(5) {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let _ = client.batch_execute(&book_sql(&clinic, pet, *slot)).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let clinic = clinic.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &clinic.name).await;
            let sql = format!(
                "SELECT * FROM availability WHERE veterinarian_id = '{}' AND start >= {T0} AND start <= {}",
                clinic.vet,
                T0 + 500 * HOUR
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let clinic = Arc::new(setup_clinic(host, port).await);

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let clinic = clinic.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &clinic.name).await;
            // Disjoint slot ranges per connection.
            let first = T0 + (c as i64) * (ops_per_conn as i64) * HOUR;
            let slots = open_slots(&client, &clinic, first, ops_per_conn).await;
            let pet = owner_with_pet(&client).await;
            for slot in slots {
                client.batch_execute(&book_sql(&clinic, pet, slot)).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} bookings each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("VETBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("VETBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid VETBOOK_PORT");

    println!("=== vetbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase runs in its own clinic.

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended booking");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] availability latency under booking load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
