use std::{process, sync::Arc, time::Duration};

use render_cache::{
    cache::{self, AllocationResolver, CacheConfig, ExperimentRegistry, RenderCache},
    config,
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, AdminState, OriginClient, PageCache, ProxyState},
        telemetry,
    },
};
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let origin = OriginClient::from_settings(&settings.origin)?;

    let registry = ExperimentRegistry::from_experiments(settings.experiments.clone())
        .map_err(|err| AppError::validation(err.to_string()))?;
    let resolver: Arc<dyn AllocationResolver> = Arc::new(registry);

    let cache_config = CacheConfig::from(&settings);
    let sweep_interval = cache_config.sweep_interval;
    let leak_interval = cache_config.leak_interval;
    let page_cache: PageCache = RenderCache::new(cache_config, resolver)?;

    info!(
        origin = %origin.base(),
        enabled = page_cache.config().enabled,
        max_bytes = page_cache.config().max_bytes.get(),
        max_age_seconds = page_cache.config().max_age.as_secs(),
        experiments = settings.experiments.len(),
        "Render cache initialised"
    );

    let maintenance_handle = cache::maintenance::spawn(page_cache.clone(), sweep_interval);
    let monitor_handle = cache::monitor::spawn(page_cache.clone(), leak_interval);

    let proxy_state = ProxyState::new(
        page_cache.clone(),
        origin,
        settings.bypass.auth_cookie.as_str(),
        settings.origin.max_body_bytes.get(),
    );
    let admin_state = AdminState { cache: page_cache };

    let result = serve_http(&settings, proxy_state, admin_state).await;

    maintenance_handle.abort();
    let _ = maintenance_handle.await;
    monitor_handle.abort();
    let _ = monitor_handle.await;

    result
}

async fn serve_http(
    settings: &config::Settings,
    proxy_state: ProxyState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_router(proxy_state);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "Listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

    let servers = async {
        try_join!(public_server, admin_server)
            .map_err(|err| AppError::unexpected(format!("server error: {err}")))
    };
    let deadline = shutdown_deadline(shutdown_rx, settings.server.graceful_shutdown);

    let result = tokio::select! {
        result = servers => result.map(|_| ()),
        () = deadline => {
            warn!("Graceful shutdown timed out; dropping open connections");
            Ok(())
        }
    };

    signal_handle.abort();
    result
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn shutdown_deadline(shutdown: watch::Receiver<bool>, grace: Duration) {
    wait_for_shutdown(shutdown).await;
    tokio::time::sleep(grace).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
