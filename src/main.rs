use branchchat::chat::{audit, config::Config, server};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env().with_port_arg(std::env::args().nth(1).as_deref());

    // Console log, plus a daily-rolling JSON audit file when configured.
    // The guard must live as long as the process so the writer keeps flushing.
    let (audit_layer, _guard) = match &config.audit_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "audit.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(format!("{}=info", audit::TARGET)));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
            ),
        )
        .with(audit_layer)
        .init();

    info!("branchchat starting");
    if let Some(dir) = &config.audit_dir {
        info!("audit log directory: {}", dir.display());
    }

    server::run_until(&config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
