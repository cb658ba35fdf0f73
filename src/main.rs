use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use siem_analytics_engine::cep::flink::FlinkSession;
use siem_analytics_engine::cep::handlers::CepState;
use siem_analytics_engine::cep::reconciler::Reconciler;
use siem_analytics_engine::cep::sink;
use siem_analytics_engine::clock::Clock;
use siem_analytics_engine::config::{Config, Service};
use siem_analytics_engine::logsink;
use siem_analytics_engine::rules::store::RuleStore;
use siem_analytics_engine::search::SearchClient;
use siem_analytics_engine::ueba::handlers::UebaState;
use siem_analytics_engine::ueba::scorer::Scorer;
use siem_analytics_engine::ueba::{consumer, handlers as ueba_handlers};
use siem_analytics_engine::cep::handlers as cep_handlers;

#[derive(Parser)]
#[command(name = "siem-analytics", about = "SIEM CEP + UEBA analytics engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// CEP service: rule control plane, job reconciler, alert sink
    Cep,
    /// UEBA service: online risk scoring and its control plane
    Ueba,
    /// Log sink: raw topics → normalised topic + event-log index
    Logsink,
}

const SAVE_INTERVAL: Duration = Duration::from_secs(600);
const ROLLOVER_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Cep => run_cep().await,
        Command::Ueba => run_ueba().await,
        Command::Logsink => run_logsink().await,
    }
}

async fn run_cep() -> anyhow::Result<()> {
    let cfg = Config::from_env(Service::Cep);
    let clock = Clock::from_tz(&cfg.timezone);
    info!(port = cfg.port, search = %cfg.opensearch_url, gateway = %cfg.flink_sql_gateway, "CEP service starting");

    let search = SearchClient::new(&cfg.opensearch_url);
    search
        .ping()
        .await
        .context("search engine unreachable at boot")?;

    let store = RuleStore::new(search.clone(), &cfg.index_prefix);
    let flink = Arc::new(FlinkSession::new(&cfg));
    let reconciler = Arc::new(Reconciler::new(flink.clone(), store.clone()));

    let state = Arc::new(CepState {
        cfg: cfg.clone(),
        clock,
        search: search.clone(),
        store,
        flink: flink.clone(),
        reconciler: reconciler.clone(),
    });

    // initial convergence once the server is up
    {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match reconciler.reconcile().await {
                Ok(summary) => info!(?summary, "initial reconcile done"),
                Err(e) => error!("initial reconcile failed: {}", e),
            }
        });
    }

    {
        let cfg = cfg.clone();
        let search = search.clone();
        tokio::spawn(async move {
            if let Err(e) = sink::run_alert_sink(&cfg, search, clock).await {
                error!("alert sink terminated: {}", e);
            }
        });
    }
    {
        let cfg = cfg.clone();
        let search = search.clone();
        tokio::spawn(async move {
            if let Err(e) = sink::run_event_log_sink(&cfg, search, clock).await {
                error!("event log sink terminated: {}", e);
            }
        });
    }

    serve(cep_handlers::router(state), cfg.port).await
}

async fn run_ueba() -> anyhow::Result<()> {
    let cfg = Config::from_env(Service::Ueba);
    let clock = Clock::from_tz(&cfg.timezone);
    info!(port = cfg.port, search = %cfg.opensearch_url, kafka = %cfg.kafka_bootstrap, "UEBA service starting");

    let search = SearchClient::new(&cfg.opensearch_url);
    search
        .ping()
        .await
        .context("search engine unreachable at boot")?;

    let store = RuleStore::new(search.clone(), &cfg.index_prefix);
    let scorer = Arc::new(Scorer::new(cfg.clone(), clock, search, store));

    {
        let scorer = scorer.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            if let Err(e) = scorer.initialize().await {
                error!("scorer initialization failed: {}", e);
            }
            if let Err(e) = consumer::run(scorer.clone(), &cfg).await {
                error!("scorer consumer terminated: {}", e);
            }
        });
    }

    // periodic batch save
    {
        let scorer = scorer.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SAVE_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                scorer.save_scores_batch().await;
            }
        });
    }
    // rollover also fires on quiet days with no events
    {
        let scorer = scorer.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ROLLOVER_CHECK_INTERVAL);
            loop {
                tick.tick().await;
                scorer.check_rollover().await;
            }
        });
    }

    let state = Arc::new(UebaState {
        scorer,
        started: Instant::now(),
    });
    serve(ueba_handlers::router(state), cfg.port).await
}

async fn run_logsink() -> anyhow::Result<()> {
    let cfg = Config::from_env(Service::LogSink);
    let clock = Clock::from_tz(&cfg.timezone);
    info!(kafka = %cfg.kafka_bootstrap, out = %cfg.transformed_topic, "log sink starting");

    let search = SearchClient::new(&cfg.opensearch_url);
    search
        .ping()
        .await
        .context("search engine unreachable at boot")?;

    logsink::run(&cfg, search, clock)
        .await
        .context("log sink terminated")?;
    Ok(())
}

async fn serve(app: axum::Router, port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
