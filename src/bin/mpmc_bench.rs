//! MPMC queue throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin mpmc_bench
//!
//! Environment variables:
//!     EVENTS=10000000  Total records moved through the queue per run
//!     CAPACITY=16384   Ring capacity (power of two)
//!     PRODUCERS=4      Producer thread count
//!     CONSUMERS=4      Consumer thread count
//!     BATCH=16         Records per transfer in the batched run
//!     PIN=1            Pin worker threads round-robin over CPU cores

use std::env;
use std::str::FromStr;
use std::thread;
use std::time::Instant;

use rotor::RingError;
use rotor::sync::mpmc::{self, Consumer, Producer};
use rotor::trace;

const DEFAULT_EVENTS: u64 = 10_000_000;
const DEFAULT_CAPACITY: u64 = 16 * 1024;
const DEFAULT_PRODUCERS: usize = 4;
const DEFAULT_CONSUMERS: usize = 4;
const DEFAULT_BATCH: usize = 16;

/// Reference record: one market order event.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Order {
    id: u64,
    price: f64,
    qty: u32,
}

impl Order {
    const ZERO: Self = Self {
        id: 0,
        price: 0.0,
        qty: 0,
    };

    /// Folds the record into a wrapping checksum so consumers can detect
    /// corrupted deliveries.
    fn fold(self, acc: u64) -> u64 {
        acc.wrapping_add(self.id)
            .wrapping_add(self.price as u64)
            .wrapping_add(u64::from(self.qty))
    }
}

#[derive(Debug, Clone, Copy)]
struct Config {
    events: u64,
    capacity: u64,
    producers: usize,
    consumers: usize,
    batch: usize,
    pin: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        let mut cfg = Self {
            events: env_or("EVENTS", DEFAULT_EVENTS),
            capacity: env_or("CAPACITY", DEFAULT_CAPACITY),
            producers: env_or("PRODUCERS", DEFAULT_PRODUCERS).max(1),
            consumers: env_or("CONSUMERS", DEFAULT_CONSUMERS).max(1),
            batch: env_or("BATCH", DEFAULT_BATCH).max(1),
            pin: env_or("PIN", 0u8) != 0,
        };
        // Quotas must divide evenly or a worker would wait on a remainder.
        let granularity = (cfg.producers * cfg.consumers * cfg.batch) as u64;
        cfg.events = (cfg.events / granularity).max(1) * granularity;
        cfg
    }
}

fn pin_to_core(worker: usize, enabled: bool) {
    if !enabled {
        return;
    }
    if let Some(cores) = core_affinity::get_core_ids()
        && !cores.is_empty()
    {
        core_affinity::set_for_current(cores[worker % cores.len()]);
    }
}

fn report(label: &str, events: u64, elapsed: std::time::Duration) {
    let ops = events as f64 / elapsed.as_secs_f64();
    println!("{label}: {events} events in {elapsed:?} ({ops:.0} ops/sec)");
}

/// Each producer pushes its quota one record at a time; each consumer drains
/// its quota the same way. Both sides yield on backpressure.
fn run_single(cfg: Config) -> Result<(), RingError> {
    let (tx, rx) = mpmc::channel::<Order>(cfg.capacity)?;

    let per_consumer = cfg.events / cfg.consumers as u64;
    let mut consumers = Vec::new();
    for c in 0..cfg.consumers {
        let rx: Consumer<Order> = rx.clone();
        let pin = cfg.pin;
        consumers.push(thread::spawn(move || {
            pin_to_core(c, pin);
            let mut checksum = 0u64;
            let mut processed = 0u64;
            while processed < per_consumer {
                match rx.pop() {
                    Some(order) => {
                        checksum = order.fold(checksum);
                        processed += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            checksum
        }));
    }

    let start = Instant::now();

    let per_producer = cfg.events / cfg.producers as u64;
    let mut producers = Vec::new();
    for p in 0..cfg.producers {
        let tx: Producer<Order> = tx.clone();
        let pin = cfg.pin;
        producers.push(thread::spawn(move || {
            pin_to_core(cfg.consumers + p, pin);
            for i in 0..per_producer {
                let order = Order {
                    id: i,
                    price: 100.0,
                    qty: 1,
                };
                while tx.push(order).is_err() {
                    thread::yield_now();
                }
            }
        }));
    }

    for p in producers {
        p.join().expect("producer thread panicked");
    }
    let checksum: u64 = consumers
        .into_iter()
        .map(|c| c.join().expect("consumer thread panicked"))
        .fold(0, u64::wrapping_add);
    let elapsed = start.elapsed();

    // Each producer pushed ids 0..per_producer with price 100 and qty 1.
    let per_producer_sum = per_producer * (per_producer - 1) / 2 + 101 * per_producer;
    let expected = (cfg.producers as u64).wrapping_mul(per_producer_sum);
    if checksum != expected {
        panic!("data corruption: checksum {checksum}, expected {expected}");
    }

    report("single", cfg.events, elapsed);
    Ok(())
}

/// Same workload moved in fixed-size batches.
fn run_batched(cfg: Config) -> Result<(), RingError> {
    if cfg.batch as u64 > cfg.capacity {
        return Err(RingError::BatchTooLarge {
            len: cfg.batch,
            capacity: cfg.capacity,
        });
    }

    let (tx, rx) = mpmc::channel::<Order>(cfg.capacity)?;

    let per_consumer = cfg.events / cfg.consumers as u64;
    let mut consumers = Vec::new();
    for c in 0..cfg.consumers {
        let rx: Consumer<Order> = rx.clone();
        let pin = cfg.pin;
        let batch = cfg.batch;
        consumers.push(thread::spawn(move || {
            pin_to_core(c, pin);
            let mut out = vec![Order::ZERO; batch];
            let mut checksum = 0u64;
            let mut processed = 0u64;
            while processed < per_consumer {
                let n = rx.pop_batch(&mut out).expect("batch fits capacity");
                if n > 0 {
                    checksum = out[..n as usize].iter().fold(checksum, |acc, o| o.fold(acc));
                    processed += n;
                } else {
                    thread::yield_now();
                }
            }
            checksum
        }));
    }

    let start = Instant::now();

    let per_producer = cfg.events / cfg.producers as u64;
    let mut producers = Vec::new();
    for p in 0..cfg.producers {
        let tx: Producer<Order> = tx.clone();
        let pin = cfg.pin;
        let batch = cfg.batch;
        producers.push(thread::spawn(move || {
            pin_to_core(cfg.consumers + p, pin);
            let records: Vec<Order> = (0..batch as u64)
                .map(|k| Order {
                    id: k,
                    price: 100.0,
                    qty: 1,
                })
                .collect();

            let transfers = per_producer / batch as u64;
            for _ in 0..transfers {
                while tx.push_batch(&records).expect("batch fits capacity") == 0 {
                    thread::yield_now();
                }
            }
        }));
    }

    for p in producers {
        p.join().expect("producer thread panicked");
    }
    let checksum: u64 = consumers
        .into_iter()
        .map(|c| c.join().expect("consumer thread panicked"))
        .fold(0, u64::wrapping_add);
    let elapsed = start.elapsed();

    // Every transfer reuses the template batch: ids 0..batch, price 100, qty 1.
    let batch = cfg.batch as u64;
    let per_batch_sum = batch * (batch - 1) / 2 + 101 * batch;
    let expected = (cfg.events / batch).wrapping_mul(per_batch_sum);
    if checksum != expected {
        panic!("data corruption: checksum {checksum}, expected {expected}");
    }

    report("batched", cfg.events, elapsed);
    Ok(())
}

fn main() {
    trace::init_tracing();

    let cfg = Config::from_env();
    let cores = thread::available_parallelism().map_or(0, |n| n.get());

    println!("cpu cores: {cores}");
    println!(
        "workload:  {} events, capacity {}, {}P/{}C, batch {}",
        cfg.events, cfg.capacity, cfg.producers, cfg.consumers, cfg.batch
    );

    if let Err(e) = run_single(cfg).and_then(|()| run_batched(cfg)) {
        eprintln!("mpmc_bench: {e}");
        std::process::exit(1);
    }
}
