//! `vlsm-inspector`: a small CLI for driving and inspecting an open engine
//! directly from the shell — point lookups, range scans, proof fetches, and
//! manual compaction/flush triggers, plus an interactive `repl` mode for
//! exploring a store without restarting the process each time.
//!
//! Grounded in `examples/CrystalAnalyst-Lsm/src/bin/lsm-cli.rs`'s shape
//! (a `clap`-derived subcommand tree driving an open `MiniLsm`, plus an
//! interactive loop for repeated commands); the original interactive loop
//! used `rustyline` for line editing, which this binary keeps for `repl`.
//! `nom` tokenizes each REPL line into a command and its arguments the same
//! way the teacher's CLI split its own command strings.

use std::ops::Bound;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use nom::{
    bytes::complete::{is_not, tag},
    character::complete::multispace0,
    multi::separated_list0,
    sequence::delimited,
    IResult,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use vlsm::iterators::StorageIterator;
use vlsm::{CompactionFilter, LsmStorageOptions, MiniLsm};

#[derive(Parser)]
#[command(name = "vlsm-inspector", about = "Inspect and drive a vlsm store")]
struct Cli {
    /// Directory the store lives in (created if absent).
    #[arg(short, long, default_value = "./vlsm-data")]
    path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Look up the latest live value for a key.
    Get { key: String },
    /// Look up the value at an exact version.
    GetAt { key: String, version: u64 },
    /// Store a value at the implicit next version.
    Put { key: String, value: String },
    /// Store a value at an explicit version.
    PutAt { key: String, value: String, version: u64 },
    /// Tombstone a key's current latest version.
    Delete { key: String },
    /// Tombstone a key at an explicit version.
    DeleteAt { key: String, version: u64 },
    /// List every live `(version, value)` pair for a key, optionally bounded.
    History {
        key: String,
        #[arg(long, default_value_t = 0)]
        v_min: u64,
        #[arg(long, default_value_t = 0)]
        v_max: u64,
    },
    /// Fetch a value together with its three-layer Merkle proof.
    Proof { key: String, version: u64 },
    /// Scan every live key in `[from, to)` (omit either bound for unbounded).
    Scan {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Print the current MasterRoot as hex.
    Root,
    /// Force a full compaction (only valid with compaction disabled).
    Compact,
    /// Print the current table/level layout.
    Dump,
    /// Register a key-prefix compaction filter (dropped at the next compaction past watermark).
    FilterPrefix { prefix: String },
    /// Interactive read-eval-print loop over the same commands.
    Repl,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let lsm = MiniLsm::open(&cli.path, LsmStorageOptions::default())
        .with_context(|| format!("opening store at {}", cli.path.display()))?;

    if matches!(cli.command, Command::Repl) {
        run_repl(&lsm)?;
    } else {
        run_command(&lsm, cli.command)?;
    }

    lsm.close().context("closing store")?;
    Ok(())
}

fn run_command(lsm: &MiniLsm, command: Command) -> Result<()> {
    match command {
        Command::Get { key } => match lsm.get(key.as_bytes())? {
            Some(v) => println!("{}", String::from_utf8_lossy(&v)),
            None => println!("(not found)"),
        },
        Command::GetAt { key, version } => match lsm.get_at(key.as_bytes(), version)? {
            Some(v) => println!("{}", String::from_utf8_lossy(&v)),
            None => println!("(not found)"),
        },
        Command::Put { key, value } => lsm.put(key.as_bytes(), value.as_bytes())?,
        Command::PutAt { key, value, version } => {
            lsm.put_at(key.as_bytes(), value.as_bytes(), version)?
        }
        Command::Delete { key } => lsm.delete(key.as_bytes())?,
        Command::DeleteAt { key, version } => lsm.delete_at(key.as_bytes(), version)?,
        Command::History { key, v_min, v_max } => {
            let rows = lsm.get_history(key.as_bytes(), v_min, v_max)?;
            if rows.is_empty() {
                println!("(no versions)");
            }
            for (version, value) in rows {
                println!("v{version}: {}", String::from_utf8_lossy(&value));
            }
        }
        Command::Proof { key, version } => match lsm.get_with_proof(key.as_bytes(), version)? {
            Some((value, actual_version, proof)) => {
                let ok = proof.verify(key.as_bytes(), actual_version, &value);
                println!(
                    "value={} version={actual_version} verified={ok}",
                    String::from_utf8_lossy(&value)
                );
                println!("data.root ={}", hex(&proof.data.root));
                println!("layer.root={}", hex(&proof.layer.root));
                println!("master.root={}", hex(&proof.master.root));
            }
            None => println!("(not found)"),
        },
        Command::Scan { from, to } => {
            let lower = from.as_deref().map(str::as_bytes).map_or(Bound::Unbounded, Bound::Included);
            let upper = to.as_deref().map(str::as_bytes).map_or(Bound::Unbounded, Bound::Excluded);
            let mut iter = lsm.scan(lower, upper)?;
            while iter.is_valid() {
                println!(
                    "{} = {}",
                    String::from_utf8_lossy(iter.key()),
                    String::from_utf8_lossy(iter.value())
                );
                iter.next()?;
            }
        }
        Command::Root => println!("{}", hex(&lsm.master_root())),
        Command::Compact => lsm.compact_range()?,
        Command::Dump => lsm.dump_structure(),
        Command::FilterPrefix { prefix } => {
            lsm.add_compaction_filter(CompactionFilter::Prefix(prefix.into_bytes().into()))
        }
        Command::Repl => unreachable!("handled by run_repl"),
    }
    Ok(())
}

fn hex(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Splits a REPL line into whitespace-delimited tokens, honoring
/// double-quoted segments so values containing spaces can be entered.
fn tokenize(line: &str) -> IResult<&str, Vec<String>> {
    let token = nom::branch::alt((
        delimited(tag("\""), is_not("\""), tag("\"")),
        is_not(" \t"),
    ));
    delimited(multispace0, separated_list0(multispace0, token), multispace0)(line)
        .map(|(rest, toks)| (rest, toks.into_iter().map(str::to_owned).collect()))
}

fn run_repl(lsm: &MiniLsm) -> Result<()> {
    let mut editor = DefaultEditor::new().context("initializing line editor")?;
    println!("vlsm-inspector repl — type `help` for commands, `quit` to exit");
    loop {
        match editor.readline("vlsm> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == "quit" || trimmed == "exit" {
                    break;
                }
                if trimmed == "help" {
                    print_repl_help();
                    continue;
                }
                match dispatch_repl_line(lsm, trimmed) {
                    Ok(()) => {}
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(anyhow!(e)),
        }
    }
    Ok(())
}

/// Mirrors `Cli` minus the `--path` flag, so a REPL line can be parsed with
/// exactly the same subcommand grammar the one-shot entry point uses.
#[derive(Parser)]
#[command(name = "vlsm-inspector")]
struct ReplLine {
    #[command(subcommand)]
    command: Command,
}

fn dispatch_repl_line(lsm: &MiniLsm, line: &str) -> Result<()> {
    let (_, tokens) = tokenize(line).map_err(|e| anyhow!("parse error: {e}"))?;
    let mut args = vec!["vlsm-inspector".to_string()];
    args.extend(tokens);
    let parsed = ReplLine::try_parse_from(args).map_err(|e| anyhow!(e.to_string()))?;
    if matches!(parsed.command, Command::Repl) {
        bail!("`repl` cannot be nested inside itself");
    }
    run_command(lsm, parsed.command)
}

fn print_repl_help() {
    println!(
        "commands: get, get-at, put, put-at, delete, delete-at, history, proof, scan, root, compact, dump, filter-prefix, quit"
    );
}
