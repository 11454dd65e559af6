use clap::Parser;
use log::{error, info, warn};
use server::config::Settings;
use server::db;
use server::dispatcher::Dispatcher;
use server::error::ServerError;
use server::hub::{Hub, HubHandle};
use server::leader::{LeaderElection, SongRotation};
use server::network::Server;
use server::replication::Replicator;
use server::services::Services;
use server::store::{MemoryStore, RedisStore, Store};
use shared::Room;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments. Flags override the settings file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML settings file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Address to bind to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// Redis url; without one the ingest runs alone in memory
    #[clap(long)]
    redis_url: Option<String>,
    /// Connection limit
    #[clap(long)]
    max_clients: Option<usize>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.redis_url {
            settings.store.url = Some(url.clone());
        }
        if let Some(max_clients) = self.max_clients {
            settings.server.max_clients = max_clients;
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()).await {
        error!("Ingest stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ServerError> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path).await?,
        None => Settings::default(),
    };
    args.apply(&mut settings);
    settings.validate()?;

    let store: Arc<dyn Store> = match &settings.store.url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => {
            warn!("No store url configured; running single-node in memory");
            Arc::new(MemoryStore::new())
        }
    };
    let ingest_id = store.client_id().await?;
    info!("Starting ingest {}", ingest_id);

    let lobby = Room::new(
        settings.world.default_room.clone(),
        settings.world.default_background.clone(),
        false,
    );
    db::ensure_room(store.as_ref(), &lobby).await?;

    let replicator = Arc::new(Replicator::new(
        store.clone(),
        settings.store.channel.clone(),
        ingest_id,
    ));
    let (hub, events) = HubHandle::new(Some(replicator.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        hub.clone(),
        Services::from_settings(&settings),
        &settings,
        ingest_id,
    ));

    let hub_task = tokio::spawn(
        Hub::new(settings.server.max_clients, events, dispatcher.clone()).run(),
    );
    let replication_task = tokio::spawn(replicator.run(hub.clone()));

    let election = LeaderElection::new(
        store.clone(),
        settings.store.client_name.clone(),
        settings.store.leader_interval(),
    )
    .with_duty(Arc::new(SongRotation::new(store.clone(), hub.clone())));
    let election_task = tokio::spawn(election.run());

    let server = Server::bind(&settings.bind_address(), hub.clone(), dispatcher).await?;
    let server_task = tokio::spawn(server.run());

    let outcome = tokio::select! {
        result = replication_task => match result {
            Ok(result) => result,
            Err(e) => {
                error!("Replication task panicked: {}", e);
                Ok(())
            }
        },
        _ = hub_task => {
            error!("Hub stopped unexpectedly");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    server_task.abort();
    election_task.abort();
    hub.shutdown();
    outcome
}
