//! Deep Research CLI - Entry Point
//!
//! Commands:
//! - research <prompt>: run a recursive research task (blocking)
//! - research <prompt> --headless: detach and poll via `status`
//! - followup <id> <prompt>: ask against a finished session's context
//! - status <id> / list / delete <id>: session store operations
//!
//! The internal `__run <id>` invocation is how the detacher re-enters
//! this binary as a background runner; it is not part of the public
//! surface.

use deep_research::detach::RUNNER_ARG;
use deep_research::{
    Config, Detacher, GeminiBackend, Orchestrator, ResearchRequest, SessionFilter, SessionStore,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str);
    let runner_mode = command == Some(RUNNER_ARG);

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(if runner_mode { Level::INFO } else { Level::WARN });

    if runner_mode {
        // Detached runner - structured logs to stderr
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;

    match command {
        Some("research") => {
            let prompt = positional(&args, 2)
                .ok_or_else(|| anyhow::anyhow!("usage: deep-research research <prompt>"))?;
            let depth = flag_value(&args, "--depth")
                .and_then(|v| v.parse().ok())
                .unwrap_or(config.max_depth);
            let breadth = flag_value(&args, "--breadth")
                .and_then(|v| v.parse().ok())
                .unwrap_or(config.breadth);

            let mut request = ResearchRequest::new(&prompt, depth, breadth)?
                .with_stores(flag_values(&args, "--stores"));
            if let Some(format) = flag_value(&args, "--format") {
                request = request.with_output_format(&format);
            }

            let orchestrator = build_orchestrator(&config)?;
            if has_flag(&args, "--headless") {
                let (id, pid) = orchestrator.submit_headless(request)?;
                println!("Research session {} detached as pid {}", id, pid);
                println!("Poll with: deep-research status {}", id);
            } else {
                let orchestrator = orchestrator.with_stdout_stream();
                let id = orchestrator.submit(request).await?;
                print_session(&orchestrator.store().get(id)?);
            }
        }

        Some("followup") => {
            let id: i64 = positional(&args, 2)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("usage: deep-research followup <id> <prompt>"))?;
            let prompt = positional(&args, 3)
                .ok_or_else(|| anyhow::anyhow!("usage: deep-research followup <id> <prompt>"))?;

            let orchestrator = build_orchestrator(&config)?;
            let answer = orchestrator.follow_up(id, &prompt).await?;
            println!("{}", answer);
        }

        Some("status") => {
            let id: i64 = positional(&args, 2)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("usage: deep-research status <id>"))?;
            let store = SessionStore::open(&config.db_path)?;
            Detacher::reconcile(&store)?;
            print_session(&store.get(id)?);
        }

        Some("list") => {
            let store = SessionStore::open(&config.db_path)?;
            Detacher::reconcile(&store)?;
            let filter = SessionFilter {
                limit: flag_value(&args, "--limit").and_then(|v| v.parse().ok()),
                roots_only: has_flag(&args, "--roots"),
                ..Default::default()
            };
            for listed in store.list(&filter)? {
                let s = &listed.session;
                let parent = match (s.parent_id, listed.parent_status) {
                    (Some(pid), Some(status)) => format!(" parent={}[{}]", pid, status),
                    (Some(pid), None) => format!(" parent={}", pid),
                    _ => String::new(),
                };
                println!(
                    "{:>4}  {:<18} depth={}{}  {}",
                    s.id,
                    s.status.to_string(),
                    s.depth,
                    parent,
                    truncate(&s.prompt, 60)
                );
            }
        }

        Some("delete") => {
            let id: i64 = positional(&args, 2)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("usage: deep-research delete <id>"))?;
            let store = SessionStore::open(&config.db_path)?;
            store.delete(id)?;
            println!("Deleted session {} and its descendants", id);
        }

        Some(cmd) if cmd == RUNNER_ARG => {
            let id: i64 = positional(&args, 2)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("runner invoked without a session id"))?;
            let store_refs: Vec<String> = std::env::var("DEEP_RESEARCH_STORE_REFS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();

            info!("Headless runner starting for session {}", id);
            let orchestrator = build_orchestrator(&config)?;
            let status = orchestrator.run_session(id, &store_refs).await?;
            info!("Headless runner finished: session {} is {}", id, status);
        }

        _ => {
            println!("Deep Research v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Usage: deep-research <command>");
            println!();
            println!("Commands:");
            println!("  research <prompt> [--headless] [--depth N] [--breadth N]");
            println!("                    [--format F] [--stores REF...]");
            println!("  followup <id> <prompt>");
            println!("  status <id>");
            println!("  list [--limit N] [--roots]");
            println!("  delete <id>");
            println!();
            println!("Environment:");
            println!("  GEMINI_API_KEY             API credential (required)");
            println!("  DEEP_RESEARCH_DB_PATH      session database location");
            println!("  DEEP_RESEARCH_MAX_DEPTH    recursion depth (default 1)");
            println!("  DEEP_RESEARCH_BREADTH      fan-out per level (default 3)");
            println!("  DEEP_RESEARCH_MAX_WORKERS  concurrent remote calls (default 4)");
        }
    }

    Ok(())
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let store = SessionStore::open(&config.db_path)?;
    let backend = Arc::new(GeminiBackend::from_config(config)?);
    Ok(Orchestrator::new(store, backend, config))
}

fn print_session(session: &deep_research::Session) {
    println!("Session {}  [{}]  depth={}", session.id, session.status, session.depth);
    if let Some(interaction) = &session.interaction_id {
        println!("Interaction: {}", interaction);
    }
    if let Some(pid) = session.pid {
        println!("Pid: {}", pid);
    }
    if let Some(reason) = &session.failure_reason {
        println!("Failure: {}", reason);
    }
    if let Some(report) = &session.report {
        println!("{}", "=".repeat(40));
        println!("{}", report);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

/// Positional argument at `index`, skipping flags and their values.
fn positional(args: &[String], index: usize) -> Option<String> {
    let mut i = 1;
    let mut seen = 1;
    while i < args.len() {
        if args[i].starts_with("--") {
            // Value-taking flags consume the next token
            if matches!(args[i].as_str(), "--depth" | "--breadth" | "--format" | "--limit") {
                i += 1;
            } else if args[i] == "--stores" {
                while i + 1 < args.len() && !args[i + 1].starts_with("--") {
                    i += 1;
                }
            }
        } else {
            if seen == index {
                return Some(args[i].clone());
            }
            seen += 1;
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn flag_values(args: &[String], flag: &str) -> Vec<String> {
    let Some(start) = args.iter().position(|a| a == flag) else {
        return Vec::new();
    };
    args[start + 1..]
        .iter()
        .take_while(|a| !a.starts_with("--"))
        .cloned()
        .collect()
}
