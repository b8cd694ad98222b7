//! `kuro-memd` – Kuro memory daemon.
//!
//! ```text
//! kuro-memd          interactive: banner, first-run wizard, server + REPL
//! kuro-memd serve    headless: server only, runs until Ctrl-C
//! ```
//!
//! Startup opens the store, prunes weak atoms once and starts the decay
//! engine before the TCP server begins accepting. On exit the server stops
//! accepting and the decay engine is stopped.

mod config;
mod repl;

use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{error, warn};

use kuro_service::telemetry::init_tracing;
use kuro_service::{MemoryServer, MemoryService};

fn main() -> ExitCode {
    let _telemetry = init_tracing("kuro-memd");

    let headless = match std::env::args().nth(1).as_deref() {
        None => false,
        Some("serve") => true,
        Some(other) => {
            eprintln!("unknown argument '{other}'. Usage: kuro-memd [serve]");
            return ExitCode::FAILURE;
        }
    };

    // ── Shared shutdown signal ────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());

    let shutdown_ctrlc = Arc::clone(&shutdown);
    let wake_ctrlc = Arc::clone(&wake);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_ctrlc.store(true, Ordering::SeqCst);
        wake_ctrlc.notify_one();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    if !headless {
        print_banner();
        match config::load() {
            Ok(None) => run_first_run_wizard(),
            Ok(Some(_)) => println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            ),
            Err(e) => {
                println!("{}: {}", "Config error".red(), e);
                println!("  Using default configuration.");
            }
        }
    }

    let cfg = match config::load_or_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "falling back to default configuration");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Service ───────────────────────────────────────────────────────────
    let service = match MemoryService::start(cfg.service_config()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!(error = %e, "failed to start memory service");
            eprintln!("{}: {}", "Startup failed".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            service.shutdown();
            return ExitCode::FAILURE;
        }
    };

    let server = MemoryServer::new(Arc::clone(&service))
        .with_port(cfg.port)
        .with_max_workers(cfg.max_workers);
    let wake_server = Arc::clone(&wake);
    let until_shutdown = async move { wake_server.notified().await };

    let code = if headless {
        match runtime.block_on(server.run_until(until_shutdown)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "memory server failed");
                ExitCode::FAILURE
            }
        }
    } else {
        let server_task = runtime.spawn(async move {
            if let Err(e) = server.run_until(until_shutdown).await {
                error!(error = %e, "memory server failed");
                println!("{}: {}", "Server error".red(), e);
            }
        });

        println!(
            "\n  Memory server on port {}. Type {} for a list of commands.\n",
            cfg.port.to_string().bold(),
            "/help".bold().cyan()
        );
        repl::run(Arc::clone(&shutdown), &service, cfg.port);

        wake.notify_one();
        if let Err(e) = runtime.block_on(server_task) {
            error!(error = %e, "server task panicked");
        }
        ExitCode::SUCCESS
    };

    service.shutdown();
    code
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Kuro First-Run Wizard         ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up the memory daemon.\n");

    let mut cfg = config::Config::default();

    cfg.port = repl::prompt_parsed(&format!("  Server port [{}]: ", cfg.port), cfg.port);
    let db = repl::prompt_str(
        &format!("  Database file [{}]: ", cfg.db_path.display()),
        &cfg.db_path.display().to_string(),
    );
    cfg.db_path = db.into();
    cfg.decay_interval_secs = repl::prompt_parsed(
        &format!("  Decay interval in seconds [{}]: ", cfg.decay_interval_secs),
        cfg.decay_interval_secs,
    );

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __                 "#.bold().cyan());
    println!("{}", r#"  / /____ _________   "#.bold().cyan());
    println!("{}", r#" /  '_/ // / __/ _ \  "#.bold().cyan());
    println!("{}", r#"/_/\_\\_,_/_/  \___/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Kuro".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Self-decaying associative memory");
    println!();
}
