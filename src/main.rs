use clap::Parser;
use feed_parrot::config::Config;
use feed_parrot::db::Repo;
use feed_parrot::directory::UserDirectory;
use feed_parrot::feeds::{BlockedFeeds, FeedFollower};
use feed_parrot::http::{build_router, AppState};
use feed_parrot::ids::IdBuilder;
use feed_parrot::inbox::Inbox;
use feed_parrot::keystore::KeyStore;
use feed_parrot::messenger::Messenger;
use feed_parrot::metrics::Metrics;
use feed_parrot::retriever::{ActorRetriever, HttpActorRetriever};
use feed_parrot::sender::{ActivitySender, HttpActivitySender};
use feed_parrot::signatures::SigChecker;
use feed_parrot::texts::Texts;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "feed-parrot", about = "Feeds as followable fediverse actors")]
struct Args {
    /// Path to the TOML configuration file; falls back to the
    /// FEED_PARROT_CONFIG environment variable, then to ./config.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var_os("FEED_PARROT_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let cfg = Arc::new(Config::load(&config_path).expect("failed to load configuration"));
    init_logging(&cfg);
    info!(config = %config_path.display(), host = %cfg.host, "starting up");

    let metrics = Arc::new(Metrics::new());
    let repo = Arc::new(Repo::open(&cfg.db_file).await.expect("failed to open database"));
    repo.init_update_db(&cfg)
        .await
        .expect("failed to initialize database schema");

    let keystore = Arc::new(KeyStore::new(cfg.clone(), repo.clone()));
    let sender: Arc<dyn ActivitySender> = Arc::new(
        HttpActivitySender::new(&cfg.host, metrics.clone()).expect("failed to build http client"),
    );
    let retriever: Arc<dyn ActorRetriever> = Arc::new(
        HttpActorRetriever::new(cfg.clone(), keystore.clone())
            .expect("failed to build http client"),
    );
    let sig_checker = Arc::new(SigChecker::new(retriever));
    let udir = Arc::new(UserDirectory::new(
        cfg.clone(),
        repo.clone(),
        keystore.clone(),
        sender.clone(),
        metrics.clone(),
        Texts,
    ));
    let messenger = Messenger::new(
        cfg.clone(),
        repo.clone(),
        keystore.clone(),
        sender,
        metrics.clone(),
    );
    let blocked = BlockedFeeds::new(&cfg);
    let feed_follower = Arc::new(
        FeedFollower::new(
            cfg.clone(),
            repo.clone(),
            blocked,
            messenger.clone(),
            Texts,
            keystore,
            metrics.clone(),
        )
        .expect("failed to build http client"),
    );
    feed_follower.spawn_check_loop();
    let inbox = Arc::new(Inbox::new(
        cfg.clone(),
        repo.clone(),
        Texts,
        udir.clone(),
        messenger,
        feed_follower.clone(),
        metrics.clone(),
    ));
    inbox.spawn_purge_loop();
    metrics.service_started();

    let state = Arc::new(AppState {
        idb: IdBuilder::new(cfg.host.clone()),
        cfg: cfg.clone(),
        repo,
        metrics,
        sig_checker,
        inbox,
        udir,
        feed_follower,
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.service_port))
        .await
        .expect("failed to bind service port");
    info!(port = cfg.service_port, "service listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

fn init_logging(cfg: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.log_file.is_empty() {
        builder.init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.log_file)
            .expect("failed to open log file");
        builder
            .with_ansi(false)
            .with_writer(move || file.try_clone().expect("log file handle"))
            .init();
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install shutdown handler");
    info!("shutdown signal received; draining in-flight requests");
}
