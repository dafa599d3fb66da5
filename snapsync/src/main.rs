use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snapsync::audit::create_audit_logger;
use snapsync::gateway::{CinderConnector, ProviderConnector, SnapshotChanges};
use snapsync::lifecycle::{CreateSnapshotOptions, SnapshotService};
use snapsync::queue::{SqliteTaskQueue, TaskQueue};
use snapsync::reconcile::Reconciler;
use snapsync::scheduler::{PollScheduler, PollSettings};
use snapsync::store::{
    ManagerEntry, SnapshotEntry, Store, TenantEntry, VolumeEntry, bytes_to_gib,
};
use snapsync::worker::{Worker, WorkerSettings};

#[derive(Parser)]
#[command(name = "snapsync")]
#[command(about = "Block-storage snapshot mirror and status reconciler")]
struct Cli {
    /// Directory holding metadata.db
    #[arg(long, default_value = "/var/lib/snapsync")]
    data_dir: String,

    /// Default block-storage API base URL (managers may override it)
    #[arg(long, default_value = "http://[::1]:8776/v3")]
    cinder_endpoint: String,

    /// Token sent as X-Auth-Token
    #[arg(long)]
    auth_token: Option<String>,

    /// Seconds between status refreshes of a new snapshot
    #[arg(long, default_value = "5")]
    poll_interval: u64,

    /// Status refreshes per campaign
    #[arg(long, default_value = "24", value_parser = clap::value_parser!(u32).range(1..))]
    poll_attempts: u32,

    /// Seconds before a provider request is abandoned
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    request_timeout: u64,

    /// Seconds a claimed task may run before it is handed out again
    #[arg(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    claim_lease: u64,

    /// Milliseconds between queue checks
    #[arg(long, default_value = "500", value_parser = clap::value_parser!(u64).range(1..))]
    worker_interval_ms: u64,

    /// Maximum tasks claimed per queue check
    #[arg(long, default_value = "32")]
    worker_batch: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue worker (status refreshes and queued operations)
    Serve,

    /// Manage storage managers
    #[command(subcommand)]
    Manager(ManagerCommand),

    /// Manage tenants
    #[command(subcommand)]
    Tenant(TenantCommand),

    /// Manage volumes
    #[command(subcommand)]
    Volume(VolumeCommand),

    /// Manage snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Subcommand)]
enum ManagerCommand {
    /// Register a manager
    Add {
        name: String,

        /// Block-storage API base URL for this manager
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[derive(Subcommand)]
enum TenantCommand {
    /// Register a tenant
    Add {
        name: String,

        /// Owning manager ID
        #[arg(long)]
        manager: String,

        /// Provider-side project ID
        #[arg(long)]
        remote_ref: Option<String>,
    },
}

#[derive(Subcommand)]
enum VolumeCommand {
    /// Register a provider volume
    Add {
        name: String,

        /// Provider-side volume ID
        #[arg(long)]
        remote_ref: String,

        /// Owning manager ID
        #[arg(long)]
        manager: String,

        /// Tenant ID
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// Snapshot a volume
    Create {
        /// Volume ID
        volume: String,

        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Queue the create for the worker instead of running it now
        #[arg(long)]
        queue: bool,
    },

    /// Change name or description
    Update {
        /// Snapshot ID
        id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Delete a snapshot
    Delete {
        /// Snapshot ID
        id: String,
    },

    /// Reconcile a snapshot with the provider now
    Refresh {
        /// Snapshot ID
        id: String,
    },

    /// Show snapshot details
    Show {
        /// Snapshot ID
        id: String,
    },

    /// List snapshots
    List {
        /// Only snapshots of this volume
        #[arg(long)]
        volume: Option<String>,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "VOLUME")]
    volume: String,
}

impl From<&SnapshotEntry> for SnapshotRow {
    fn from(s: &SnapshotEntry) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            status: s.status.to_string(),
            size: format_size(s.size_bytes),
            volume: s.volume_id.clone(),
        }
    }
}

fn format_size(size_bytes: Option<u64>) -> String {
    size_bytes
        .map(|b| format!("{} GB", bytes_to_gib(b)))
        .unwrap_or_else(|| "-".to_string())
}

fn print_snapshot(s: &SnapshotEntry) {
    println!("ID:            {}", s.id);
    println!("Remote ref:    {}", s.remote_ref);
    println!("Name:          {}", s.name);
    println!("Description:   {}", s.description.as_deref().unwrap_or("-"));
    println!("Status:        {}", s.status);
    println!("Size:          {}", format_size(s.size_bytes));
    println!(
        "Created:       {}",
        s.creation_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Volume:        {}", s.volume_id);
    println!("Tenant:        {}", s.tenant_id.as_deref().unwrap_or("-"));
    println!("Manager:       {}", s.manager_id);
}

struct App {
    store: Arc<Store>,
    queue: Arc<dyn TaskQueue>,
    reconciler: Arc<Reconciler>,
    service: Arc<SnapshotService>,
}

impl App {
    async fn build(cli: &Cli) -> Result<Self> {
        tokio::fs::create_dir_all(&cli.data_dir)
            .await
            .with_context(|| format!("Failed to create data dir {}", cli.data_dir))?;

        let store = Arc::new(Store::new(&cli.data_dir).await?);
        let lease = i64::try_from(cli.claim_lease)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .context("claim lease out of range")?;
        let queue: Arc<dyn TaskQueue> =
            Arc::new(SqliteTaskQueue::new(store.pool()).with_lease(lease));
        let scheduler = Arc::new(PollScheduler::new(
            Arc::clone(&queue),
            PollSettings {
                interval: Duration::from_secs(cli.poll_interval),
                max_attempts: cli.poll_attempts,
            },
        ));
        let connector: Arc<dyn ProviderConnector> = Arc::new(
            CinderConnector::new(
                cli.cinder_endpoint.clone(),
                cli.auth_token.clone(),
                Duration::from_secs(cli.request_timeout),
            )
            .context("Failed to build HTTP client")?,
        );
        let notifier = create_audit_logger();

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&connector),
            Arc::clone(&scheduler),
            Arc::clone(&notifier),
        ));
        let service = Arc::new(SnapshotService::new(
            Arc::clone(&store),
            connector,
            scheduler,
            Arc::clone(&reconciler),
            Arc::clone(&queue),
            notifier,
        ));

        Ok(Self {
            store,
            queue,
            reconciler,
            service,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("snapsync=info".parse()?))
        .init();

    let cli = Cli::parse();
    let app = App::build(&cli).await?;

    match cli.command {
        Commands::Serve => {
            let worker = Worker::new(
                Arc::clone(&app.queue),
                Arc::clone(&app.reconciler),
                Arc::clone(&app.service),
                WorkerSettings {
                    poll_interval: Duration::from_millis(cli.worker_interval_ms),
                    batch_size: cli.worker_batch,
                },
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C");
                    let _ = shutdown_tx.send(true);
                }
            });

            info!(data_dir = %cli.data_dir, endpoint = %cli.cinder_endpoint, "Starting snapsync worker");
            worker.run(shutdown_rx).await?;
        }

        Commands::Manager(ManagerCommand::Add { name, endpoint }) => {
            let entry = ManagerEntry::new(name, endpoint);
            app.store.create_manager(&entry).await?;
            println!("{}", entry.id);
        }

        Commands::Tenant(TenantCommand::Add {
            name,
            manager,
            remote_ref,
        }) => {
            let entry = TenantEntry::new(name, remote_ref, manager);
            app.store.create_tenant(&entry).await?;
            println!("{}", entry.id);
        }

        Commands::Volume(VolumeCommand::Add {
            name,
            remote_ref,
            manager,
            tenant,
        }) => {
            let entry = VolumeEntry::new(name, remote_ref, manager, tenant);
            app.store.create_volume(&entry).await?;
            println!("{}", entry.id);
        }

        Commands::Snapshot(cmd) => run_snapshot_command(&app, cmd).await?,
    }

    Ok(())
}

async fn run_snapshot_command(app: &App, cmd: SnapshotCommand) -> Result<()> {
    match cmd {
        SnapshotCommand::Create {
            volume,
            name,
            description,
            queue,
        } => {
            let options = CreateSnapshotOptions { name, description };
            if queue {
                let task_id = app.service.create_snapshot_queue(&volume, &options).await?;
                println!("Queued create task {}", task_id);
            } else {
                let snapshot = app.service.create_snapshot(&volume, &options).await?;
                print_snapshot(&snapshot);
            }
        }

        SnapshotCommand::Update {
            id,
            name,
            description,
        } => {
            let changes = SnapshotChanges { name, description };
            let snapshot = app.service.update_snapshot(&id, &changes).await?;
            print_snapshot(&snapshot);
        }

        SnapshotCommand::Delete { id } => {
            app.service.delete_snapshot(&id).await?;
            println!("Snapshot {} deleted", id);
        }

        SnapshotCommand::Refresh { id } => {
            let snapshot = app.service.refresh_snapshot(&id).await?;
            print_snapshot(&snapshot);
        }

        SnapshotCommand::Show { id } => match app.store.get_snapshot(&id).await? {
            Some(snapshot) => print_snapshot(&snapshot),
            None => anyhow::bail!("Snapshot {} not found", id),
        },

        SnapshotCommand::List { volume } => {
            let snapshots = app.store.list_snapshots(volume.as_deref()).await?;
            if snapshots.is_empty() {
                println!("No snapshots found");
            } else {
                let rows: Vec<SnapshotRow> = snapshots.iter().map(SnapshotRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(())
}
