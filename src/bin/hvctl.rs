//! `hvctl` — thin REST client for `hv-local-agent` and `hv-dispatcher`
//! (spec §1's CLI collaborator), sized to the five verbs both surfaces
//! share. `CliError` stays `thiserror`-derived, separate from the
//! scheduling core's hand-rolled `SchedulerError`.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {0}")]
    Http(reqwest::StatusCode),
}

type CliResult<T> = Result<T, CliError>;

/// REST client for a running `hv-local-agent` or `hv-dispatcher` (both
/// expose the same five-verb surface, spec §6.1/§6.2).
#[derive(Parser, Debug)]
#[command(name = "hvctl", version, about = "REST client for hv-local-agent and hv-dispatcher")]
struct Cli {
    /// Base URL of the target process.
    #[arg(long, env = "HVCTL_URL", default_value = "http://localhost:8100")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List VMs known to the target.
    List,
    /// Deploy a new VM.
    Deploy {
        #[arg(long)]
        name: String,
        #[arg(long)]
        cpu: u32,
        /// Memory in GB.
        #[arg(long)]
        mem: f64,
        /// CPU oversubscription ratio.
        #[arg(long, default_value_t = 1.0)]
        oc: f64,
        #[arg(long)]
        qcow2: Option<String>,
    },
    /// Remove a VM by name.
    Remove {
        #[arg(long)]
        name: String,
    },
    /// Print the target's current resource status.
    Status,
}

#[derive(Debug, Deserialize)]
struct ActionResult {
    success: bool,
    reason: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hvctl: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(10))
        .build()?;

    match cli.command {
        Command::List => {
            let names: Vec<String> = get_json(&client, &format!("{}/listvm", cli.url), &[]).await?;
            for name in names {
                println!("{name}");
            }
        }
        Command::Status => {
            let status: serde_json::Value = get_json(&client, &format!("{}/status", cli.url), &[]).await?;
            println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
        }
        Command::Deploy { name, cpu, mem, oc, qcow2 } => {
            let mut query = vec![
                ("name".to_string(), name.clone()),
                ("cpu".to_string(), cpu.to_string()),
                ("mem".to_string(), mem.to_string()),
                ("oc".to_string(), oc.to_string()),
            ];
            if let Some(q) = qcow2 {
                query.push(("qcow2".to_string(), q));
            }
            let result: ActionResult = get_json(&client, &format!("{}/deploy", cli.url), &query).await?;
            print_result(&name, result);
        }
        Command::Remove { name } => {
            let query = vec![("name".to_string(), name.clone())];
            let result: ActionResult = get_json(&client, &format!("{}/remove", cli.url), &query).await?;
            print_result(&name, result);
        }
    }
    Ok(())
}

fn print_result(name: &str, result: ActionResult) {
    if result.success {
        println!("{name}: ok");
    } else {
        println!("{name}: failed ({})", result.reason.unwrap_or_else(|| "unknown reason".to_string()));
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    query: &[(String, String)],
) -> CliResult<T> {
    let resp = client.get(url).query(query).send().await?;
    if !resp.status().is_success() {
        return Err(CliError::Http(resp.status()));
    }
    Ok(resp.json::<T>().await?)
}
