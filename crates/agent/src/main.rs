use anyhow::Context;
use clap::Parser;
use tricorder_agent::{AgentHandle, Config};
use tricorder_proto::agent_server::AgentServer;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Tricorder passive-latency agent")]
struct Cli {
    /// Path to the agent's YAML config file.
    #[clap(long, default_value = "./config.yml")]
    config: std::path::PathBuf,
}

fn init_logging(level: &str, file: Option<&str>) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        tracing_subscriber::EnvFilter::new(match level {
            "" | "info" => "info",
            "debug" => "debug",
            "error" => "error",
            other => other,
        })
    };

    let writer = match file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stdout),
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(writer).init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    init_logging(&config.log.level, config.log.file.as_deref())?;

    tracing::info!(port = config.port, "starting the agent");

    let addr = format!("0.0.0.0:{}", config.port).parse().context("parsing listen address")?;
    let handle = AgentHandle::new(config.interface);

    tonic::transport::Server::builder()
        .add_service(AgentServer::new(handle))
        .serve(addr)
        .await
        .context("serving gRPC")?;

    Ok(())
}
