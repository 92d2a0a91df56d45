use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging for the storage controller.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("storagecontroller=debug")
        } else {
            EnvFilter::new("storagecontroller=info")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("storage controller logging initialized");
    Ok(())
}

/// Initialize logging with fallback behavior if setup fails.
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!(
            "warning: failed to set up tracing subscriber: {}. continuing without it",
            e
        );
    }
}

/// Log a protocol state transition (announce/proposal/handshake/send-file/ping-pong).
pub fn log_protocol_event(event: &str, order_hash: &str, details: &str) {
    info!(target: "storagecontroller::protocol", "{} order={} {}", event, order_hash, details);
}

/// Log a replica lifecycle event (created, sent, validated, rejected, stored).
pub fn log_replica_operation(operation: &str, order_hash: &str, details: &str) {
    info!(target: "storagecontroller::replica", "{} order={}: {}", operation, order_hash, details);
}

/// Log a heap allocation event.
pub fn log_heap_operation(operation: &str, uri: &str, details: &str) {
    info!(target: "storagecontroller::heap", "{} uri={}: {}", operation, uri, details);
}

/// Log an error with context, used on the silent-drop paths mandated by the
/// error handling design (message handlers never propagate failures to the transport).
pub fn log_error_with_context(context: &str, error: &dyn std::error::Error) {
    error!(target: "storagecontroller::error", "{}: {}", context, error);
}
