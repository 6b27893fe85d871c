//! tally-cli — HTTP frontend for the Tally expense-question service
//!
//! # Subcommands
//! - `ask <question> [--evaluate] [--reference <text>]` — grounded answer
//! - `evaluate [--mode sample|full] [--sample-size N]`  — start a batch run
//! - `runs [--family rag|ingestion] [-n <limit>]`       — list recent runs
//! - `run <run_id>`                                     — show one run
//! - `cancel <run_id>`                                  — cancel a batch run
//! - `status`                                           — show server health

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8780";
const DEFAULT_LIMIT: usize = 20;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "tally-cli",
    version,
    about = "Tally — grounded questions over expense records"
)]
struct Cli {
    /// Tally HTTP server URL (overrides TALLY_HTTP_URL env var)
    #[arg(long, env = "TALLY_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ask a question about the expense records
    Ask {
        /// Question text
        question: String,

        /// Score the answer with the RAG metrics in the same request
        #[arg(long)]
        evaluate: bool,

        /// Reference answer used for context recall when evaluating
        #[arg(long)]
        reference: Option<String>,
    },

    /// Start a batch evaluation run
    Evaluate {
        /// Run mode: sample or full
        #[arg(long, default_value = "sample")]
        mode: String,

        /// Number of queries for a sample run
        #[arg(long)]
        sample_size: Option<u32>,
    },

    /// List recent evaluation runs
    Runs {
        /// Metric family filter: rag or ingestion
        #[arg(long)]
        family: Option<String>,

        /// Maximum number of runs to show
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Show one evaluation run
    Run {
        /// Run identifier (UUID)
        run_id: String,
    },

    /// Cancel an in-flight batch run
    Cancel {
        /// Run identifier (UUID)
        run_id: String,
    },

    /// Show Tally server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct AskResponse {
    answer: String,
    #[serde(default)]
    context_used: Vec<ContextFragment>,
    #[serde(default)]
    degraded: bool,
    took_ms: Option<u64>,
    metrics: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ContextFragment {
    source: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct RunRow {
    run_id: String,
    metric_family: String,
    run_type: String,
    status: String,
    started_at: String,
    total_queries: Option<i32>,
    successful_queries: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    runs: Vec<RunRow>,
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()?)
}

fn fail_on_error(resp: reqwest::blocking::Response) -> reqwest::blocking::Response {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("tally-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }
    resp
}

fn do_ask(
    server: &str,
    question: &str,
    evaluate: bool,
    reference: Option<&str>,
) -> anyhow::Result<()> {
    let url = format!("{}/ask", server);
    let body = serde_json::json!({
        "question": question,
        "evaluate": evaluate,
        "reference_answer": reference,
    });

    let resp = match client()?.post(&url).json(&body).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("tally-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let resp = fail_on_error(resp);

    let ask: AskResponse = match resp.json() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("tally-cli: failed to parse response: {}", e);
            std::process::exit(1);
        }
    };

    println!("{}\n", ask.answer);

    if !ask.context_used.is_empty() {
        println!("Evidence:");
        for fragment in &ask.context_used {
            let preview: String = fragment.text.chars().take(120).collect();
            println!("  [{}] {}", fragment.source, preview);
        }
    }

    if ask.degraded {
        println!("\n(search tool unavailable — answer is database-only)");
    }

    if let Some(metrics) = &ask.metrics {
        println!("\nMetrics:");
        for metric in [
            "faithfulness",
            "answer_relevance",
            "context_precision",
            "context_recall",
        ] {
            match metrics[metric].as_f64() {
                Some(v) => println!("  {:<18} {:.3}", metric, v),
                None => println!("  {:<18} n/a", metric),
            }
        }
    }

    if let Some(took) = ask.took_ms {
        println!("\n({} ms)", took);
    }

    Ok(())
}

fn do_evaluate(server: &str, mode: &str, sample_size: Option<u32>) -> anyhow::Result<()> {
    let url = format!("{}/evaluate/run", server);
    let body = serde_json::json!({"mode": mode, "sample_size": sample_size});

    let resp = fail_on_error(client()?.post(&url).json(&body).send()?);
    let data: serde_json::Value = resp.json()?;

    println!(
        "Run {} started ({} mode)",
        data["run_id"].as_str().unwrap_or("?"),
        mode
    );
    Ok(())
}

fn do_runs(server: &str, family: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let mut url = format!("{}/evaluate/runs?limit={}", server, limit);
    if let Some(family) = family {
        url.push_str(&format!("&family={}", family));
    }

    let resp = fail_on_error(client()?.get(&url).send()?);
    let data: RunsResponse = resp.json()?;

    if data.runs.is_empty() {
        println!("No evaluation runs found");
        return Ok(());
    }

    for run in &data.runs {
        let progress = match (run.successful_queries, run.total_queries) {
            (Some(ok), Some(total)) => format!("{}/{}", ok, total),
            _ => "-".to_string(),
        };
        println!(
            "{}  {:<9} {:<9} {:<9} {:<7} {}",
            run.run_id, run.metric_family, run.run_type, run.status, progress, run.started_at
        );
    }
    Ok(())
}

fn do_run_detail(server: &str, run_id: &str) -> anyhow::Result<()> {
    let url = format!("{}/evaluate/runs/{}", server, run_id);
    let resp = fail_on_error(client()?.get(&url).send()?);
    let data: serde_json::Value = resp.json()?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

fn do_cancel(server: &str, run_id: &str) -> anyhow::Result<()> {
    let url = format!("{}/evaluate/runs/{}/cancel", server, run_id);
    let resp = fail_on_error(client()?.post(&url).send()?);
    let data: serde_json::Value = resp.json()?;
    if data["cancelled"].as_bool().unwrap_or(false) {
        println!("Run {} cancellation requested", run_id);
    } else {
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}

fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = match client()?.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("tally-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let body: serde_json::Value = resp.json().unwrap_or_default();
    println!(
        "Tally server: {}",
        body["status"].as_str().unwrap_or("unknown")
    );
    println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
    println!(
        "PostgreSQL:   {}",
        body["postgresql"].as_str().unwrap_or("?")
    );
    println!(
        "Approved view: {}",
        body["approved_view"].as_str().unwrap_or("?")
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ask {
            question,
            evaluate,
            reference,
        } => do_ask(&cli.server, &question, evaluate, reference.as_deref()),
        Commands::Evaluate { mode, sample_size } => do_evaluate(&cli.server, &mode, sample_size),
        Commands::Runs { family, limit } => do_runs(&cli.server, family.as_deref(), limit),
        Commands::Run { run_id } => do_run_detail(&cli.server, &run_id),
        Commands::Cancel { run_id } => do_cancel(&cli.server, &run_id),
        Commands::Status => do_status(&cli.server),
    }
}
