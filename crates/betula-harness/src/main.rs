//! Reference harness for the Betula tree.
//!
//! Runs a randomized or scripted stream of inserts, updates, deletes,
//! queries, and scans against a `Betree<u64, String>`, mirroring every
//! operation into an in-memory `BTreeMap` oracle and asserting that both
//! sides agree. Values are strings and updates concatenate, so the
//! combiner's ordering behavior is visible in query results.
//!
//! Exit codes: 0 success, 1 usage error, 3 script parse error, 4 script
//! read error.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use betula_common::BetulaError;
use betula_swap::{FileStore, FileStoreConfig, LruCacheManager, SwapSpace};
use betula_tree::{Betree, TreeConfig};

mod script;

use script::{Expected, ScriptOp};

const DEFAULT_MAX_NODE_SIZE: u64 = 1 << 4;
const DEFAULT_CACHE_SIZE: u64 = 4;
const DEFAULT_KEY_SPACE: u64 = 1 << 10;
const DEFAULT_OPS: u64 = 1 << 12;

const USAGE_EXIT: u8 = 1;
const SCRIPT_PARSE_EXIT: u8 = 3;
const SCRIPT_READ_EXIT: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Test,
    Benchmark,
}

#[derive(Debug)]
struct CliConfig {
    mode: Mode,
    dir: PathBuf,
    max_node_size: u64,
    min_flush_size: Option<u64>,
    cache_size: u64,
    key_space: u64,
    ops: u64,
    seed: Option<u64>,
    script_in: Option<PathBuf>,
    script_out: Option<PathBuf>,
}

fn print_usage() {
    let usage = "\
Usage: betula-harness [OPTIONS]
Tests the Betula tree implementation

Options are
  Required:
    -d <backing_store_directory>
    -m <mode>  (test or benchmark)
  Tree tuning parameters:
    -N <max_node_size>   (in messages)      [ default: 16 ]
    -f <min_flush_size>  (in messages)      [ default: max_node_size / 4 ]
    -C <max_cache_size>  (in tree nodes)    [ default: 4 ]
  Options for both tests and benchmarks:
    -k <number_of_distinct_keys>            [ default: 1024 ]
    -t <number_of_operations>               [ default: 4096 ]
    -s <random_seed>                        [ default: random ]
  Test scripting options:
    -o <output_script>                      [ default: no output ]
    -i <script_file>                        [ default: none ]
";
    eprintln!("{usage}");
}

fn parse_u64(flag: &str, value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| format!("argument to {flag} must be an integer"))
}

fn take_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str, String> {
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<CliConfig, String> {
    let mut mode = None;
    let mut dir = None;
    let mut max_node_size = DEFAULT_MAX_NODE_SIZE;
    let mut min_flush_size = None;
    let mut cache_size = DEFAULT_CACHE_SIZE;
    let mut key_space = DEFAULT_KEY_SPACE;
    let mut ops = DEFAULT_OPS;
    let mut seed = None;
    let mut script_in = None;
    let mut script_out = None;

    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "-m" => {
                mode = Some(match take_value(args, &mut index, "-m")? {
                    "test" => Mode::Test,
                    "benchmark" => Mode::Benchmark,
                    other => return Err(format!("unknown mode: {other}")),
                })
            }
            "-d" => dir = Some(PathBuf::from(take_value(args, &mut index, "-d")?)),
            "-N" => max_node_size = parse_u64("-N", take_value(args, &mut index, "-N")?)?,
            "-f" => {
                min_flush_size = Some(parse_u64("-f", take_value(args, &mut index, "-f")?)?)
            }
            "-C" => cache_size = parse_u64("-C", take_value(args, &mut index, "-C")?)?,
            "-k" => key_space = parse_u64("-k", take_value(args, &mut index, "-k")?)?,
            "-t" => ops = parse_u64("-t", take_value(args, &mut index, "-t")?)?,
            "-s" => seed = Some(parse_u64("-s", take_value(args, &mut index, "-s")?)?),
            "-i" => script_in = Some(PathBuf::from(take_value(args, &mut index, "-i")?)),
            "-o" => script_out = Some(PathBuf::from(take_value(args, &mut index, "-o")?)),
            unknown => return Err(format!("unknown option: {unknown}")),
        }
        index += 1;
    }

    let mode = mode.ok_or("must specify a mode of \"test\" or \"benchmark\"")?;
    let dir = dir.ok_or("-d <backing_store_directory> is required")?;
    if mode == Mode::Benchmark && (script_in.is_some() || script_out.is_some()) {
        return Err("cannot use scripts in benchmark mode".to_string());
    }

    Ok(CliConfig {
        mode,
        dir,
        max_node_size,
        min_flush_size,
        cache_size,
        key_space,
        ops,
        seed,
        script_in,
        script_out,
    })
}

fn concat(a: &String, b: &String) -> String {
    format!("{a}{b}")
}

fn open_tree(config: &CliConfig) -> Result<(SwapSpace, Betree<u64, String>), BetulaError> {
    let store = FileStore::open(FileStoreConfig::new(&config.dir))?;
    let space = SwapSpace::new(
        Box::new(store),
        Box::new(LruCacheManager::new(config.cache_size)),
    )?;
    let tree = match Betree::open(&space, concat) {
        Ok(tree) => tree,
        Err(BetulaError::NotFound) => {
            let tree_config = TreeConfig::new(
                config.max_node_size,
                config.min_flush_size.unwrap_or(config.max_node_size / 4),
            );
            Betree::create(&space, tree_config, String::new(), concat)?
        }
        Err(e) => return Err(e),
    };
    Ok((space, tree))
}

fn payload(key: u64) -> String {
    format!("{key}:")
}

/// Applies one operation to the tree and the oracle, asserting that both
/// agree on every observable result.
fn run_op(
    tree: &Betree<u64, String>,
    oracle: &mut BTreeMap<u64, String>,
    op: &ScriptOp,
    mut output: Option<&mut BufWriter<File>>,
) -> Result<(), BetulaError> {
    let mut record = |line: String| -> Result<(), BetulaError> {
        if let Some(out) = output.as_mut() {
            writeln!(out, "{line}")?;
        }
        Ok(())
    };

    match *op {
        ScriptOp::Insert(key) => {
            record(format!("Inserting {key}"))?;
            tree.insert(key, payload(key))?;
            oracle.insert(key, payload(key));
        }
        ScriptOp::Update(key) => {
            record(format!("Updating {key}"))?;
            tree.update(key, payload(key))?;
            oracle
                .entry(key)
                .and_modify(|v| v.push_str(&payload(key)))
                .or_insert_with(|| payload(key));
        }
        ScriptOp::Delete(key) => {
            record(format!("Deleting {key}"))?;
            tree.erase(key)?;
            oracle.remove(&key);
        }
        ScriptOp::Query(key, ref expected) => {
            let answer = match tree.query(&key) {
                Ok(value) => Some(value),
                Err(BetulaError::NotFound) => None,
                Err(e) => return Err(e),
            };
            assert_eq!(
                answer.as_ref(),
                oracle.get(&key),
                "query {key} disagrees with the oracle"
            );
            match expected {
                Some(Expected::Value(want)) => assert_eq!(
                    answer.as_deref(),
                    Some(want.as_str()),
                    "query {key} disagrees with the script"
                ),
                Some(Expected::Missing) => assert!(
                    answer.is_none(),
                    "query {key} found a value the script expected to be missing"
                ),
                None => {}
            }
            match answer {
                Some(value) => record(format!("Query {key} -> {value}"))?,
                None => record(format!("Query {key} -> DNE"))?,
            }
        }
        ScriptOp::FullScan => {
            record("Full_scan 0".to_string())?;
            check_scan(tree.iter()?, oracle.iter())?;
        }
        ScriptOp::LowerBoundScan(key) => {
            record(format!("Lower_bound_scan {key}"))?;
            check_scan(tree.lower_bound(&key)?, oracle.range(key..))?;
        }
        ScriptOp::UpperBoundScan(key) => {
            record(format!("Upper_bound_scan {key}"))?;
            check_scan(tree.upper_bound(&key)?, oracle.range(key + 1..))?;
        }
    }
    Ok(())
}

fn check_scan<'a>(
    tree_iter: betula_tree::TreeIter<'_, u64, String>,
    oracle_iter: impl Iterator<Item = (&'a u64, &'a String)>,
) -> Result<(), BetulaError> {
    let mut tree_iter = tree_iter;
    for (want_key, want_value) in oracle_iter {
        let (key, value) = tree_iter
            .next()
            .expect("tree scan ended before the oracle's")?;
        assert_eq!(key, *want_key, "scan diverged from the oracle");
        assert_eq!(&value, want_value, "scan value disagrees for key {key}");
    }
    assert!(
        tree_iter.next().is_none(),
        "tree scan outlived the oracle's"
    );
    Ok(())
}

fn random_op(rng: &mut StdRng, key_space: u64) -> ScriptOp {
    let key = rng.gen_range(0..key_space);
    match rng.gen_range(0..7u32) {
        0 => ScriptOp::Insert(key),
        1 => ScriptOp::Update(key),
        2 => ScriptOp::Delete(key),
        3 => ScriptOp::Query(key, None),
        4 => ScriptOp::FullScan,
        5 => ScriptOp::LowerBoundScan(key),
        _ => ScriptOp::UpperBoundScan(key),
    }
}

fn run_test(config: &CliConfig) -> Result<u8, String> {
    let (_space, tree) =
        open_tree(config).map_err(|e| format!("failed to open tree: {e}"))?;
    let mut oracle = BTreeMap::new();

    let mut output = match &config.script_out {
        Some(path) => Some(BufWriter::new(
            File::create(path).map_err(|e| format!("couldn't open output file: {e}"))?,
        )),
        None => None,
    };

    let ops: Vec<ScriptOp> = match &config.script_in {
        Some(path) => {
            let file = match File::open(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("couldn't open input file: {e}");
                    return Ok(SCRIPT_READ_EXIT);
                }
            };
            let mut ops = Vec::new();
            for (number, line) in BufReader::new(file).lines().enumerate() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        eprintln!("script read error: {e}");
                        return Ok(SCRIPT_READ_EXIT);
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match script::parse_line(&line) {
                    Ok(op) => ops.push(op),
                    Err(e) => {
                        eprintln!("parse error at line {}: {e}", number + 1);
                        return Ok(SCRIPT_PARSE_EXIT);
                    }
                }
            }
            ops
        }
        None => {
            let seed = config.seed.unwrap_or_else(rand::random);
            tracing::info!(seed, "running randomized test");
            let mut rng = StdRng::seed_from_u64(seed);
            (0..config.ops)
                .map(|_| random_op(&mut rng, config.key_space))
                .collect()
        }
    };

    for op in &ops {
        run_op(&tree, &mut oracle, op, output.as_mut())
            .map_err(|e| format!("operation failed: {e}"))?;
    }

    if let Some(out) = output.as_mut() {
        out.flush().map_err(|e| format!("couldn't flush output file: {e}"))?;
    }

    println!("Test PASSED");
    Ok(0)
}

fn run_benchmark(config: &CliConfig) -> Result<u8, String> {
    let (space, tree) =
        open_tree(config).map_err(|e| format!("failed to open tree: {e}"))?;
    let seed = config.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);

    let start = std::time::Instant::now();
    for _ in 0..config.ops {
        let key = rng.gen_range(0..config.key_space);
        tree.update(key, payload(key))
            .map_err(|e| format!("update failed: {e}"))?;
    }
    space
        .checkpoint()
        .map_err(|e| format!("checkpoint failed: {e}"))?;
    let elapsed = start.elapsed();

    println!(
        "{} updates in {:.3}s ({:.0} ops/sec)",
        config.ops,
        elapsed.as_secs_f64(),
        config.ops as f64 / elapsed.as_secs_f64()
    );
    Ok(0)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            print_usage();
            return ExitCode::from(USAGE_EXIT);
        }
    };

    let result = match config.mode {
        Mode::Test => run_test(&config),
        Mode::Benchmark => run_benchmark(&config),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(USAGE_EXIT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_minimal() {
        let config = parse_args(&args(&["-m", "test", "-d", "/tmp/x"])).unwrap();
        assert_eq!(config.mode, Mode::Test);
        assert_eq!(config.max_node_size, 16);
        assert_eq!(config.cache_size, 4);
        assert_eq!(config.key_space, 1024);
        assert_eq!(config.ops, 4096);
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_parse_args_full() {
        let config = parse_args(&args(&[
            "-m", "test", "-d", "/tmp/x", "-N", "64", "-f", "8", "-C", "16", "-k", "100",
            "-t", "500", "-s", "7", "-i", "in.txt", "-o", "out.txt",
        ]))
        .unwrap();
        assert_eq!(config.max_node_size, 64);
        assert_eq!(config.min_flush_size, Some(8));
        assert_eq!(config.cache_size, 16);
        assert_eq!(config.key_space, 100);
        assert_eq!(config.ops, 500);
        assert_eq!(config.seed, Some(7));
        assert!(config.script_in.is_some());
        assert!(config.script_out.is_some());
    }

    #[test]
    fn test_parse_args_rejects_missing_mode() {
        assert!(parse_args(&args(&["-d", "/tmp/x"])).is_err());
    }

    #[test]
    fn test_parse_args_rejects_missing_dir() {
        assert!(parse_args(&args(&["-m", "test"])).is_err());
    }

    #[test]
    fn test_parse_args_rejects_bad_integer() {
        assert!(parse_args(&args(&["-m", "test", "-d", "x", "-N", "abc"])).is_err());
    }

    #[test]
    fn test_parse_args_rejects_benchmark_with_script() {
        assert!(parse_args(&args(&["-m", "benchmark", "-d", "x", "-i", "s.txt"])).is_err());
    }

    #[test]
    fn test_end_to_end_random_test_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig {
            mode: Mode::Test,
            dir: dir.path().to_path_buf(),
            max_node_size: 16,
            min_flush_size: Some(4),
            cache_size: 4,
            key_space: 64,
            ops: 512,
            seed: Some(1234),
            script_in: None,
            script_out: None,
        };
        assert_eq!(run_test(&config).unwrap(), 0);
    }

    #[test]
    fn test_script_record_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.txt");

        let record = CliConfig {
            mode: Mode::Test,
            dir: dir.path().join("first"),
            max_node_size: 16,
            min_flush_size: Some(4),
            cache_size: 4,
            key_space: 32,
            ops: 256,
            seed: Some(99),
            script_in: None,
            script_out: Some(script.clone()),
        };
        assert_eq!(run_test(&record).unwrap(), 0);

        let replay = CliConfig {
            mode: Mode::Test,
            dir: dir.path().join("second"),
            max_node_size: 16,
            min_flush_size: Some(4),
            cache_size: 4,
            key_space: 32,
            ops: 256,
            seed: None,
            script_in: Some(script),
            script_out: None,
        };
        assert_eq!(run_test(&replay).unwrap(), 0);
    }

    #[test]
    fn test_script_parse_error_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("bad.txt");
        std::fs::write(&script, "Frobnicating 12\n").unwrap();

        let config = CliConfig {
            mode: Mode::Test,
            dir: dir.path().join("data"),
            max_node_size: 16,
            min_flush_size: Some(4),
            cache_size: 4,
            key_space: 32,
            ops: 16,
            seed: None,
            script_in: Some(script),
            script_out: None,
        };
        assert_eq!(run_test(&config).unwrap(), SCRIPT_PARSE_EXIT);
    }

    #[test]
    fn test_script_read_error_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig {
            mode: Mode::Test,
            dir: dir.path().join("data"),
            max_node_size: 16,
            min_flush_size: Some(4),
            cache_size: 4,
            key_space: 32,
            ops: 16,
            seed: None,
            script_in: Some(dir.path().join("missing.txt")),
            script_out: None,
        };
        assert_eq!(run_test(&config).unwrap(), SCRIPT_READ_EXIT);
    }

    #[test]
    fn test_benchmark_mode_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig {
            mode: Mode::Benchmark,
            dir: dir.path().to_path_buf(),
            max_node_size: 16,
            min_flush_size: Some(4),
            cache_size: 8,
            key_space: 64,
            ops: 256,
            seed: Some(5),
            script_in: None,
            script_out: None,
        };
        assert_eq!(run_benchmark(&config).unwrap(), 0);
    }
}
