use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use yardbay::auth::YardAuthSource;
use yardbay::config::{Config, TableFormat};
use yardbay::session::Yard;
use yardbay::store::{CsvCodec, FileRepository, JsonCodec, ScheduleStore, TableCodec};
use yardbay::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env()?;
    yardbay::observability::init(cfg.metrics_port)?;
    let tls_acceptor =
        yardbay::tls::load_tls_acceptor(cfg.tls_cert.as_deref(), cfg.tls_key.as_deref())?;

    let codec: Arc<dyn TableCodec> = match cfg.table_format {
        TableFormat::Csv => Arc::new(CsvCodec),
        TableFormat::Json => Arc::new(JsonCodec),
    };
    let store = Arc::new(ScheduleStore::new(
        Arc::new(FileRepository::new(cfg.table_path.clone())),
        codec,
        cfg.cache_ttl,
    ));

    // Surface a broken schedule at startup rather than on the first query.
    match store.fetch().await {
        Ok(fetched) => info!(
            "schedule loaded: {} bookings, {} rejected rows",
            fetched.table.len(),
            fetched.table.rejected.len()
        ),
        Err(e) => tracing::warn!("schedule not readable yet: {e}"),
    }

    let yard = Arc::new(Yard::new(store, cfg.zones.clone()));
    let auth_source = YardAuthSource::new(
        cfg.office_user.clone(),
        cfg.office_secret.clone(),
        cfg.viewer_password.clone(),
    );
    if cfg.office_secret.is_none() {
        tracing::warn!("YARD_OFFICE_SECRET not set: office role disabled, all logins are read-only");
    }

    let max_connections = cfg.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("yardbay listening on {addr}");
    info!("  table: {} ({:?})", cfg.table_path.display(), cfg.table_format);
    info!("  zones: {}", cfg.zones.iter().map(|z| format!("{}={}", z.name, z.bays)).collect::<Vec<_>>().join(", "));
    info!("  cache_ttl: {:?}", cfg.cache_ttl);
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", cfg.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(yardbay::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(yardbay::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(yardbay::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let yard = yard.clone();
                let auth = auth_source.clone();
                let office_user = cfg.office_user.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, yard, auth, office_user, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(yardbay::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("yardbay stopped");
    Ok(())
}
