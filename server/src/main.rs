mod auth;
mod email;
mod error;
mod index;
mod model;
mod notify;
mod observability;
mod prompt;
mod rate_limiters;
mod request_tracing;
mod routes;
mod server_config;
mod state;
mod testing;
mod util;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use axum::extract::FromRef;
use mimalloc::MiMalloc;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    auth::token::{AccessTokenProvider, GoogleTokenProvider, StaticTokenProvider},
    email::imap::ImapMailSource,
    index::{elastic::ElasticStore, memory::MemoryStore, DocumentStore},
    notify::{
        slack::SlackChannel, webhook::WebhookChannel, NotificationChannel,
        NotificationDispatcher,
    },
    observability::PipelineTracker,
    prompt::{groq::ChatCompletionOracle, ClassificationOracle},
    rate_limiters::RateLimiters,
    routes::AppRouter,
    server_config::{cfg, StoreKind},
    state::{
        batcher::{BatcherConfig, ClassificationBatcher},
        drain::{DrainScheduler, DrainWorker},
        feed::MailFeed,
        orchestrator::{Orchestrator, OrchestratorConfig},
        sync_state::SyncState,
    },
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

#[derive(Clone, FromRef)]
pub struct ServerState {
    pub http_client: HttpClient,
    pub store: Arc<dyn DocumentStore>,
    pub sync_state: Arc<SyncState>,
    pub drain: DrainScheduler,
    pub feed: MailFeed,
    pub tracker: PipelineTracker,
    pub rate_limiters: RateLimiters,
    pub dispatcher: NotificationDispatcher,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    println!("{}", *cfg);

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;

    let store: Arc<dyn DocumentStore> = match cfg.store.kind {
        StoreKind::Elastic => Arc::new(ElasticStore::new(
            http_client.clone(),
            cfg.secrets.elasticsearch_url.clone(),
            &cfg.store.index,
        )),
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };
    if let Err(e) = store.ensure_schema().await {
        // Writes fail until the store is reachable; the pipeline keeps retrying
        tracing::error!("Could not prepare index {}: {}", cfg.store.index, e);
    }

    let tracker = PipelineTracker::new();
    let rate_limiters = RateLimiters::from_limits(&cfg.oracle.limits);
    let feed = MailFeed::new();
    let sync_state = Arc::new(SyncState::new());
    let shutdown = CancellationToken::new();

    let oracle = build_oracle(&http_client, &rate_limiters);
    let dispatcher = NotificationDispatcher::new(
        build_channels(&http_client),
        cfg.notifications.inter_record_delay(),
        tracker.clone(),
    );
    tracing::info!(channels = ?dispatcher.channel_names(), "Notification channels ready");

    let batcher = ClassificationBatcher::new(
        oracle,
        rate_limiters.clone(),
        BatcherConfig::from(&cfg.oracle),
        tracker.clone(),
    );
    tracing::info!(oracle = batcher.has_oracle(), "Classification batcher ready");

    let drain = DrainScheduler::new(
        DrainWorker {
            sync_state: sync_state.clone(),
            batcher,
            store: store.clone(),
            dispatcher: dispatcher.clone(),
            feed: feed.clone(),
            tracker: tracker.clone(),
            batch_size: cfg.oracle.batch_size,
            requeue_delay: cfg.pipeline.requeue_delay(),
        },
        shutdown.child_token(),
    );

    let orchestrator = Orchestrator {
        source: Arc::new(ImapMailSource::new(
            &cfg.mailbox.host,
            cfg.mailbox.port,
            cfg.mailbox.idle_timeout(),
        )?),
        tokens: build_token_provider(&http_client)?,
        store: store.clone(),
        sync_state: sync_state.clone(),
        drain: drain.clone(),
        feed: feed.clone(),
        tracker: tracker.clone(),
        config: OrchestratorConfig::from(&*cfg),
    };
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown.child_token()));

    let state = ServerState {
        http_client,
        store,
        sync_state,
        drain,
        feed,
        tracker,
        rate_limiters,
        dispatcher,
    };

    let mut scheduler = JobScheduler::new()
        .await
        .context("Failed to create scheduler")?;
    {
        let state = state.clone();
        // Periodic pipeline status table
        scheduler
            .add(Job::new_repeated(
                Duration::from_secs(cfg.pipeline.status_interval_secs.max(1)),
                move |_uuid, _lock| {
                    let table = state.tracker.get_status_table(&[
                        ("watermark", state.sync_state.last_seen_uid().to_string()),
                        ("queue", state.sync_state.queue_len().to_string()),
                        ("index retry", state.sync_state.index_retry_len().to_string()),
                        ("drain", state.drain.phase().to_string()),
                        ("rate limit", state.rate_limiters.get_status()),
                        ("feed clients", state.feed.subscriber_count().to_string()),
                    ]);
                    tracing::info!("\n{}", table);
                },
            )?)
            .await?;
    }
    scheduler.set_shutdown_handler(Box::new(move || {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));
    scheduler.start().await?;

    let router = AppRouter::create(state, &cfg.server.allowed_origins);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.secrets.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Inbox triage server running on http://{}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    shutdown.cancel();
    if let Err(e) = scheduler.shutdown().await {
        tracing::error!("Failed to stop scheduler: {:?}", e);
    }
    if let Err(e) = orchestrator_handle.await {
        tracing::error!("Orchestrator task failed: {:?}", e);
    }
    println!("Cleanups done, shutting down");

    Ok(())
}

fn build_oracle(
    http_client: &HttpClient,
    rate_limiters: &RateLimiters,
) -> Option<Arc<dyn ClassificationOracle>> {
    match cfg.secrets.oracle_api_key.clone() {
        Some(api_key) => Some(Arc::new(ChatCompletionOracle::new(
            http_client.clone(),
            rate_limiters.clone(),
            api_key,
            cfg.oracle.clone(),
        ))),
        None => {
            tracing::warn!("ORACLE_API_KEY is not set, classifying with rules only");
            None
        }
    }
}

fn build_channels(http_client: &HttpClient) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if let Some(url) = cfg.secrets.slack_webhook_url.clone() {
        channels.push(Arc::new(SlackChannel::new(http_client.clone(), url)));
    }
    if let Some(url) = cfg.secrets.webhook_url.clone() {
        channels.push(Arc::new(WebhookChannel::new(
            http_client.clone(),
            url,
            cfg.notifications.user_agent.clone(),
            cfg.notifications.source.clone(),
        )));
    }
    channels
}

fn build_token_provider(http_client: &HttpClient) -> anyhow::Result<Arc<dyn AccessTokenProvider>> {
    if let Some(token) = cfg.secrets.static_access_token.clone() {
        tracing::info!("Using static mailbox access token");
        return Ok(Arc::new(StaticTokenProvider::new(token)));
    }

    match (
        cfg.secrets.google_client_id.clone(),
        cfg.secrets.google_client_secret.clone(),
        cfg.secrets.google_refresh_token.clone(),
    ) {
        (Some(client_id), Some(client_secret), Some(refresh_token)) => Ok(Arc::new(
            GoogleTokenProvider::new(http_client.clone(), client_id, client_secret, refresh_token),
        )),
        _ => Err(anyhow!(
            "Set MAIL_ACCESS_TOKEN or GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET and GOOGLE_REFRESH_TOKEN"
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
