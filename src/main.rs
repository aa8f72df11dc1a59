use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use bookkeeper_operator::health::{HealthState, run_health_server};
use bookkeeper_operator::{LEADER_LEASE_NAME, OperatorConfig, run_controller};
use bookkeeper_operator::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_webhook_server};

const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to a running reconcile pass after SIGTERM
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    install_crypto_provider()?;
    init_tracing()?;

    let config = Arc::new(OperatorConfig::from_env());
    info!(
        test_mode = config.test_mode,
        disable_finalizer = config.disable_finalizer,
        supported_versions = %config.supported_versions_path.display(),
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        "starting bookkeeper-operator"
    );

    let client = Client::try_default().await?;

    // Probes and admission are served by every replica, leader or not
    let health = Arc::new(HealthState::new());
    let health_task = tokio::spawn({
        let health = health.clone();
        async move {
            if let Err(e) = run_health_server(health).await {
                error!(error = %e, "health server stopped");
            }
        }
    });
    let webhook_task = spawn_webhook(client.clone(), config.clone());

    let holder_id = config.pod_name.clone().unwrap_or_else(|| {
        warn!("POD_NAME not set, falling back to hostname for the lease holder");
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "bookkeeper-operator".to_string())
    });
    let lease = LeaseLock::new(
        client.clone(),
        &config.pod_namespace,
        LeaseLockParams {
            holder_id: holder_id.clone(),
            lease_name: LEADER_LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    );

    tokio::select! {
        _ = acquire_leadership(&lease, &holder_id) => {}
        _ = shutdown_signal() => {
            info!("shutdown requested before leadership was acquired");
            return Ok(());
        }
    }
    let renew_task = tokio::spawn(keep_leadership(lease));

    let controller_task = tokio::spawn(run_controller(
        client,
        config.clone(),
        Some(health.clone()),
    ));

    tokio::select! {
        result = controller_task => log_exit("controller", result),
        result = health_task => log_exit("health server", result),
        result = renew_task => log_exit("lease renewal", result),
        result = wait_optional(webhook_task) => log_exit("webhook server", result),
        _ = shutdown_signal() => {
            info!(grace = ?SHUTDOWN_GRACE_PERIOD, "shutting down");
            health.set_ready(false);
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("operator stopped");
    Ok(())
}

/// rustls needs a process-wide provider before the client or webhook start TLS
fn install_crypto_provider() -> Result<(), BoxError> {
    let installed = rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok();
    if !installed && rustls::crypto::CryptoProvider::get_default().is_none() {
        return Err("no rustls crypto provider available".into());
    }
    Ok(())
}

fn init_tracing() -> Result<(), BoxError> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("bookkeeper_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Start the admission webhook when its certificate is mounted
fn spawn_webhook(client: Client, config: Arc<OperatorConfig>) -> Option<JoinHandle<()>> {
    if !Path::new(WEBHOOK_CERT_PATH).exists() || !Path::new(WEBHOOK_KEY_PATH).exists() {
        info!(
            cert = WEBHOOK_CERT_PATH,
            key = WEBHOOK_KEY_PATH,
            "webhook certificate not mounted, admission validation disabled"
        );
        return None;
    }
    Some(tokio::spawn(async move {
        if let Err(e) = run_webhook_server(client, config, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await {
            error!(error = %e, "webhook server stopped");
        }
    }))
}

async fn wait_optional(task: Option<JoinHandle<()>>) -> Result<(), tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn log_exit(task: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => error!(task, "task exited unexpectedly"),
        Err(e) => error!(task, error = %e, "task panicked"),
    }
}

async fn acquire_leadership(lease: &LeaseLock, holder_id: &str) {
    info!(holder_id, lease = LEADER_LEASE_NAME, "waiting for leadership");
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!(holder_id, "acquired leadership");
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "lease acquisition failed, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renew the lease forever. Losing it ends the process so that two
/// operators never reconcile the same clusters.
async fn keep_leadership(lease: LeaseLock) {
    loop {
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("leadership lost, exiting");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "lease renewal failed, exiting");
                std::process::exit(1);
            }
        }
    }
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
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
}
