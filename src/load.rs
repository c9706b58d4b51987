//! Synthetic load generation for the benchmark driver.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::json;

use crate::types::Database;

pub const LOAD_SIZES: [usize; 3] = [1000, 10000, 100000];
const STRING_LEN: usize = 100;

pub const BENCH_DB: &str = "test-db";
pub const BENCH_COLLECTION: &str = "test-col1";
pub const BENCH_KEY: &str = "key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Write,
    Read,
    Meta,
}

impl Operation {
    /// Benchmark order; reads expect the keys writes left behind.
    pub const ALL: [Operation; 3] = [Operation::Write, Operation::Read, Operation::Meta];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Write => f.write_str("write"),
            Operation::Read => f.write_str("read"),
            Operation::Meta => f.write_str("meta"),
        }
    }
}

/// Source of pre-materialized command lists, one command per entry.
pub trait LoadSource: Send + Sync {
    fn operations_for(&self, database: Database, op: Operation, size: usize) -> Vec<String>;
}

/// Random lowercase payloads over a deterministic key space.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomLoad;

fn random_string(rng: &mut impl Rng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .filter(char::is_ascii_lowercase)
        .take(len)
        .collect()
}

impl LoadSource for RandomLoad {
    fn operations_for(&self, database: Database, op: Operation, size: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..size)
            .map(|i| match (database, op) {
                (Database::Redis, Operation::Write) => {
                    format!("SET key:{} \"{}\"", i, random_string(&mut rng, STRING_LEN))
                }
                (Database::Redis, Operation::Read) => format!("GET key:{}", rng.gen_range(0..size)),
                (Database::Redis, Operation::Meta) => format!(
                    "HSET bench:meta field:{} \"{}\"",
                    i,
                    random_string(&mut rng, STRING_LEN)
                ),
                (Database::Mongodb, Operation::Write) => json!({
                    "insert": BENCH_COLLECTION,
                    "documents": [{ BENCH_KEY: random_string(&mut rng, STRING_LEN), "seq": i }],
                })
                .to_string(),
                (Database::Mongodb, Operation::Read) => json!({
                    "find": BENCH_COLLECTION,
                    "filter": { "seq": rng.gen_range(0..size) },
                    "limit": 1,
                })
                .to_string(),
                (Database::Mongodb, Operation::Meta) => json!({
                    "create": random_string(&mut rng, 24),
                })
                .to_string(),
            })
            .collect()
    }
}
