//! `hv-local-agent` — per-host local agent binary (spec §1). Serves the
//! REST surface and runs the outer control loop, live against the
//! hypervisor connector or replaying a recorded CSV trace (spec §6.3).

use clap::Parser;
use hvsched::agent::LocalAgent;
use hvsched::config::LocalAgentConfig;
use hvsched::connector::offline::OfflineConnector;
use hvsched::connector::qemu::QemuConnector;
use hvsched::connector::HypervisorConnector;
use hvsched::dataendpoint::trace::CsvTrace;
use hvsched::dataendpoint::CsvWriter;
use hvsched::manager::ManagerPool;
use hvsched::topology::TopologyExplorer;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hv-local-agent", version, about = "Per-host VM placement agent")]
struct Args {
    /// Replay a CSV trace instead of driving the live hypervisor connector.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Record every sample read during replay to this CSV file.
    #[arg(long, requires = "replay")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();
    let config = LocalAgentConfig::from_env()?;

    let explorer = TopologyExplorer::new(config.topo_exclude.clone());
    let cpuset = explorer.build_cpuset();
    let memset = explorer.build_memoryset();
    log::info!(
        "topology discovered: {} core(s) across {} numa node(s)",
        cpuset.allowed(),
        cpuset.numa_node_ids().len()
    );

    let connector: Box<dyn HypervisorConnector> = if args.replay.is_some() {
        Box::new(OfflineConnector::new())
    } else {
        Box::new(QemuConnector::new(config.qemu.clone()))
    };

    let pool = ManagerPool::new(
        cpuset,
        memset,
        config.template.clone(),
        config.elastic,
        config.critical_size,
        config.predictor,
        connector,
    );
    let agent = LocalAgent::new(pool, config.iteration_delay);

    if let Some(trace_path) = args.replay {
        log::info!("replaying trace {}", trace_path.display());
        let trace = CsvTrace::load(&trace_path)?;
        let sink = match args.output {
            Some(path) => Some(CsvWriter::create(&path)?),
            None => None,
        };
        agent.run_replay(trace, sink).await?;
        log::info!("replay finished");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_url, config.bind_port).parse()?;
    let router = agent.router();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("hv-local-agent listening on {addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let control_loop = tokio::spawn(async move {
        agent.run_live(shutdown_rx).await;
    });

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });
    server.await?;
    control_loop.await?;
    Ok(())
}
