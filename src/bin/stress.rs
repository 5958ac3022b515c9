//! KestrelKV Stress Binary
//!
//! Runs concurrent transfer transactions between accounts and checks that
//! the total balance is conserved, both live and after replaying the log.

use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam::channel;
use kestrelkv::{Config, Engine, KestrelError, TransactionOptions, TransactionState};
use rand::Rng;
use tracing_subscriber::{fmt, EnvFilter};

/// KestrelKV transaction stress test
#[derive(Parser, Debug)]
#[command(name = "kestrel-stress")]
#[command(about = "Concurrent transfer workload against the KestrelKV engine")]
#[command(version)]
struct Args {
    /// Number of worker threads
    #[arg(short, long, default_value = "8")]
    threads: usize,

    /// Number of accounts
    #[arg(short, long, default_value = "64")]
    accounts: usize,

    /// Transfers attempted per thread
    #[arg(short = 'n', long, default_value = "2000")]
    transfers: usize,

    /// Starting balance of every account
    #[arg(long, default_value = "1000")]
    balance: u64,

    /// Lock wait timeout in milliseconds
    #[arg(long, default_value = "50")]
    lock_timeout_ms: u64,

    /// MemTable size in KB before it is switched out
    #[arg(short = 'm', long, default_value = "256")]
    memtable_kb: usize,

    /// Run every transfer through prepare before commit
    #[arg(long)]
    two_phase: bool,
}

#[derive(Debug, Default)]
struct WorkerStats {
    committed: u64,
    conflicts: u64,
    errors: u64,
}

fn account_key(i: usize) -> Vec<u8> {
    format!("account:{:06}", i).into_bytes()
}

fn decode_balance(value: Option<Vec<u8>>) -> kestrelkv::Result<u64> {
    let Some(raw) = value else {
        return Ok(0);
    };
    let bytes: [u8; 8] = raw
        .as_slice()
        .try_into()
        .map_err(|_| KestrelError::Corruption(format!("balance of {} bytes", raw.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

fn transfer(
    engine: &Engine,
    args: &Args,
    worker: usize,
    seq: usize,
    from: usize,
    to: usize,
    amount: u64,
) -> kestrelkv::Result<()> {
    let options = TransactionOptions {
        set_snapshot: true,
        deadlock_detect: true,
        lock_timeout: Some(Duration::from_millis(args.lock_timeout_ms)),
        ..TransactionOptions::default()
    };
    let mut txn = engine.begin_transaction(&options);

    let from_balance = decode_balance(txn.get_for_update(&account_key(from))?)?;
    let to_balance = decode_balance(txn.get_for_update(&account_key(to))?)?;
    let amount = amount.min(from_balance);

    txn.put(&account_key(from), &(from_balance - amount).to_le_bytes())?;
    txn.put(&account_key(to), &(to_balance + amount).to_le_bytes())?;

    if args.two_phase {
        txn.set_name(&format!("xfer-{}-{}", worker, seq))?;
        txn.prepare()?;
    }
    let committed = txn.commit();
    if committed.is_err() && txn.state() == TransactionState::Prepared {
        // otherwise the engine keeps it pending with both accounts locked
        txn.rollback()?;
    }
    committed
}

fn total_balance(engine: &Engine, accounts: usize) -> kestrelkv::Result<u64> {
    let snapshot = engine.snapshot();
    let opts = snapshot.read_options();
    let mut total = 0;
    for i in 0..accounts {
        total += decode_balance(engine.get_cf(&opts, kestrelkv::DEFAULT_COLUMN_FAMILY, &account_key(i))?)?;
    }
    Ok(total)
}

fn run(args: &Args) -> kestrelkv::Result<()> {
    let config = Config::builder()
        .write_buffer_size(args.memtable_kb * 1024)
        .build();
    let engine: Engine = Engine::new(config.clone())?;

    for i in 0..args.accounts {
        engine.put(&account_key(i), &args.balance.to_le_bytes())?;
    }
    let expected = args.balance * args.accounts as u64;

    let (tx, rx) = channel::unbounded();
    let started = Instant::now();
    std::thread::scope(|s| {
        for worker in 0..args.threads {
            let tx = tx.clone();
            let engine = &engine;
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                let mut stats = WorkerStats::default();
                for seq in 0..args.transfers {
                    let from = rng.gen_range(0..args.accounts);
                    let to = rng.gen_range(0..args.accounts);
                    if from == to {
                        continue;
                    }
                    let amount = rng.gen_range(1..=args.balance.max(1) / 10 + 1);
                    match transfer(engine, args, worker, seq, from, to, amount) {
                        Ok(()) => stats.committed += 1,
                        Err(
                            KestrelError::Busy(_)
                            | KestrelError::LockTimeout
                            | KestrelError::Deadlock
                            | KestrelError::TryAgain(_),
                        ) => stats.conflicts += 1,
                        Err(e) => {
                            tracing::warn!(worker, error = %e, "transfer failed");
                            stats.errors += 1;
                        }
                    }
                }
                let _ = tx.send(stats);
            });
        }
    });
    drop(tx);

    let mut totals = WorkerStats::default();
    for stats in rx.iter() {
        totals.committed += stats.committed;
        totals.conflicts += stats.conflicts;
        totals.errors += stats.errors;
    }
    let elapsed = started.elapsed();
    tracing::info!(
        committed = totals.committed,
        conflicts = totals.conflicts,
        errors = totals.errors,
        elapsed_ms = elapsed.as_millis() as u64,
        "workload finished"
    );

    let live = total_balance(&engine, args.accounts)?;
    if live != expected {
        return Err(KestrelError::Corruption(format!(
            "live total {} != expected {}",
            live, expected
        )));
    }

    let recovered: Engine = Engine::recover(config, engine.log_segments())?;
    let replayed = total_balance(&recovered, args.accounts)?;
    if replayed != expected {
        return Err(KestrelError::Corruption(format!(
            "recovered total {} != expected {}",
            replayed, expected
        )));
    }

    println!(
        "ok: {} committed, {} conflicts, {} errors in {:?}; total {} conserved",
        totals.committed, totals.conflicts, totals.errors, elapsed, expected
    );
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kestrelkv=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("KestrelKV stress v{}", kestrelkv::VERSION);

    if let Err(e) = run(&args) {
        tracing::error!("Stress run failed: {}", e);
        std::process::exit(1);
    }
}
