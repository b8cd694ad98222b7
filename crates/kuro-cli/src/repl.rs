//! REPL – operator shell for a running memory daemon.
//!
//! Supported slash-commands:
//!   /help                                      – show this list
//!   /status                                    – service health and store size
//!   /observe <entity> <dim> <ctx> <delta> [c]  – merge one observation
//!   /context [entity ...]                      – render context summaries
//!   /prefer <key> <value>                      – reinforce a preference
//!   /prune [threshold]                         – delete weak atoms
//!   /report                                    – per-dimension statistics
//!   /decay                                     – run one decay sweep now
//!   /settings                                  – edit `~/.kuro/config.toml`
//!   /quit | /exit                              – stop the daemon

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kuro_service::MemoryService;
use kuro_types::{ContextRequest, ProposeMemoryRequest, UpdatePreferenceRequest};

use crate::config::{self, Config};

/// Confidence used by `/observe` when none is given.
const DEFAULT_OBSERVE_CONFIDENCE: f64 = 0.5;

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Observe {
        entity_id: String,
        dimension: String,
        context_hash: String,
        delta: f64,
        confidence: f64,
    },
    Context(Vec<String>),
    Prefer { key: String, value: f64 },
    Prune(Option<f64>),
    Report,
    Decay,
    Settings,
    Quit,
}

/// Parse one input line. The error is a user-facing message.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    match head {
        "/help" => Ok(Command::Help),
        "/status" => Ok(Command::Status),
        "/observe" => {
            if args.len() != 4 && args.len() != 5 {
                return Err("usage: /observe <entity> <dimension> <context> <delta> [confidence]".into());
            }
            let delta = parse_number(args[3], "delta")?;
            let confidence = match args.get(4) {
                Some(raw) => parse_number(raw, "confidence")?,
                None => DEFAULT_OBSERVE_CONFIDENCE,
            };
            Ok(Command::Observe {
                entity_id: args[0].to_string(),
                dimension: args[1].to_string(),
                context_hash: args[2].to_string(),
                delta,
                confidence,
            })
        }
        "/context" => Ok(Command::Context(args.iter().map(|s| s.to_string()).collect())),
        "/prefer" => match args.as_slice() {
            [key, value] => Ok(Command::Prefer {
                key: key.to_string(),
                value: parse_number(value, "value")?,
            }),
            _ => Err("usage: /prefer <key> <value>".into()),
        },
        "/prune" => match args.as_slice() {
            [] => Ok(Command::Prune(None)),
            [threshold] => Ok(Command::Prune(Some(parse_number(threshold, "threshold")?))),
            _ => Err("usage: /prune [threshold]".into()),
        },
        "/report" => Ok(Command::Report),
        "/decay" => Ok(Command::Decay),
        "/settings" => Ok(Command::Settings),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_number(raw: &str, what: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("{what} must be a number, got '{raw}'"))
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shutdown: Arc<AtomicBool>, service: &MemoryService, port: u16) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "kuro>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() || shutdown.load(Ordering::SeqCst) {
            continue;
        }

        match parse_command(line) {
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Status) => cmd_status(service, port),
            Ok(Command::Observe {
                entity_id,
                dimension,
                context_hash,
                delta,
                confidence,
            }) => {
                let status = service.propose_memory(ProposeMemoryRequest {
                    entity_id,
                    dimension,
                    delta,
                    context_hash,
                    confidence,
                });
                print_status(status.success, &status.message);
            }
            Ok(Command::Context(entities)) => cmd_context(service, entities),
            Ok(Command::Prefer { key, value }) => {
                let status = service.update_preference(UpdatePreferenceRequest { key, value });
                print_status(status.success, &status.message);
            }
            Ok(Command::Prune(threshold)) => cmd_prune(service, threshold),
            Ok(Command::Report) => cmd_report(service),
            Ok(Command::Decay) => cmd_decay(service),
            Ok(Command::Settings) => cmd_settings(),
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    e.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Kuro Memory Commands".bold().underline());
    println!("  {}   – service health and store size", "/status".bold().cyan());
    println!(
        "  {}  – merge one observation",
        "/observe <entity> <dim> <ctx> <delta> [confidence]".bold().cyan()
    );
    println!("  {}  – render context summaries", "/context [entity ...]".bold().cyan());
    println!("  {}  – reinforce a preference (value > 0.5 is positive)", "/prefer <key> <value>".bold().cyan());
    println!("  {}  – delete weak atoms", "/prune [threshold]".bold().cyan());
    println!("  {}   – per-dimension statistics", "/report".bold().cyan());
    println!("  {}    – run one decay sweep now", "/decay".bold().cyan());
    println!("  {} – edit ~/.kuro/config.toml", "/settings".bold().cyan());
    println!("  {}  – stop the daemon", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(service: &MemoryService, port: u16) {
    let health = service.health();
    println!("{}", "Status".bold().underline());
    println!("  Service : {} ({:?})", health.service.bold(), health.status);
    println!("  Port    : {}", port.to_string().yellow());
    let db = match &service.config().db_path {
        Some(path) => path.display().to_string(),
        None => "in-memory".to_string(),
    };
    println!("  Store   : {}", db.yellow());
    match service.store().total_atoms() {
        Ok(n) => println!("  Atoms   : {}", n.to_string().yellow()),
        Err(e) => println!("  Atoms   : {} {}", "unavailable".red(), e),
    }
    let decay = if health.decay_running {
        "running".green()
    } else {
        "stopped".red()
    };
    println!(
        "  Decay   : {} (every {}s)",
        decay,
        service.decay().interval().as_secs()
    );
}

fn cmd_context(service: &MemoryService, entities: Vec<String>) {
    match service.get_context(ContextRequest { entities }) {
        Ok(ctx) => {
            println!("{}", "Memory".bold().underline());
            if ctx.memory_summaries.is_empty() {
                println!("  {}", "(no atoms)".dimmed());
            }
            for line in &ctx.memory_summaries {
                println!("  • {line}");
            }
            println!("{}", "Preferences".bold().underline());
            if ctx.preferences.is_empty() {
                println!("  {}", "(none)".dimmed());
            }
            for (key, value) in &ctx.preferences {
                println!("  • {} = {:.2}", key.bold(), value);
            }
        }
        Err(e) => println!("{}: {}", "Context error".red(), e),
    }
}

fn cmd_prune(service: &MemoryService, threshold: Option<f64>) {
    let threshold = threshold.unwrap_or_else(|| service.dimensions().threshold());
    match service.dimensions().prune_weak_atoms_below(threshold) {
        Ok(n) => println!("{} {} atom(s) below {}", "✓ Pruned".green(), n, threshold),
        Err(e) => println!("{}: {}", "Prune error".red(), e),
    }
}

fn cmd_report(service: &MemoryService) {
    match service.dimensions().dimension_report() {
        Ok(stats) if stats.is_empty() => println!("  {}", "(no atoms)".dimmed()),
        Ok(stats) => {
            println!("{}", "Dimensions".bold().underline());
            for stat in stats {
                println!(
                    "  {:<20} {:>6} atom(s)  Σ|m| = {:.2}",
                    stat.dimension.bold(),
                    stat.atom_count,
                    stat.total_magnitude
                );
            }
        }
        Err(e) => println!("{}: {}", "Report error".red(), e),
    }
}

fn cmd_decay(service: &MemoryService) {
    match service.decay().sweep() {
        Ok(report) => println!(
            "{} scanned {}, decayed {}, removed {}, failed {}",
            "✓ Sweep:".green(),
            report.scanned,
            report.decayed,
            report.removed,
            report.failed
        ),
        Err(e) => println!("{}: {}", "Decay error".red(), e),
    }
}

fn cmd_settings() {
    // Edit what is on disk; env overrides must not leak into the file.
    let mut cfg = match config::load_stored() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            println!("{}: {}", "Error loading config".red(), e);
            return;
        }
    };

    println!("{}", "Settings Editor".bold().underline());
    println!("  (press Enter to keep a value; changes apply on next start)");

    cfg.port = prompt_parsed(&format!("  Port                    [{}]: ", cfg.port), cfg.port);
    let db = prompt_str(
        &format!("  Database file           [{}]: ", cfg.db_path.display()),
        &cfg.db_path.display().to_string(),
    );
    cfg.db_path = PathBuf::from(db);
    cfg.decay_interval_secs = prompt_parsed(
        &format!("  Decay interval (s)      [{}]: ", cfg.decay_interval_secs),
        cfg.decay_interval_secs,
    );
    cfg.max_atoms_per_dimension = prompt_parsed(
        &format!("  Max atoms per dimension [{}]: ", cfg.max_atoms_per_dimension),
        cfg.max_atoms_per_dimension,
    );
    cfg.max_workers = prompt_parsed(
        &format!("  Max workers             [{}]: ", cfg.max_workers),
        cfg.max_workers,
    );

    match config::save(&cfg) {
        Ok(()) => println!(
            "{} {}",
            "✓ Settings saved to".green(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_status(success: bool, message: &str) {
    if success {
        println!("{} {}", "✓".green().bold(), message);
    } else {
        println!("{} {}", "✗".red().bold(), message.red());
    }
}

/// Prompt for a value.  Returns `default` on Enter or on unparsable input.
pub(crate) fn prompt_parsed<T>(msg: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    let raw = prompt_str(msg, &default.to_string());
    match raw.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            println!(
                "  {} '{}' is not valid, keeping {}",
                "Warning:".yellow(),
                raw,
                default
            );
            default
        }
    }
}

/// Prompt for a string value.  Returns `default` when the user presses Enter.
pub(crate) fn prompt_str(msg: &str, default: &str) -> String {
    print!("{}", msg);
    io::stdout().flush().ok();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() {
                default.to_string()
            } else {
                trimmed
            }
        }
        Err(_) => default.to_string(),
    }
}
