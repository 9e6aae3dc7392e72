use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use toolshim::logging::setup_panic_hook;
use toolshim::main_helper::LogFormat;
use toolshim::redaction_layer::RedactingMakeWriter;
use toolshim::{build_router, AppState, Args};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

fn init_tracing(args: &Args) -> Option<WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match tracing_subscriber::EnvFilter::try_new(&args.log_level) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Invalid --log-level '{}' ({}), using info", args.log_level, e);
                "info".into()
            }
        },
    };

    let console = RedactingMakeWriter::new(std::io::stderr);
    let (text_layer, json_layer) = match args.log_format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer().with_writer(console)), None),
        LogFormat::Json => (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_writer(console)),
        ),
    };

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let file_name = match path.file_name() {
                Some(name) => name.to_os_string(),
                None => "toolshim.log".into(),
            };
            let file_appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(RedactingMakeWriter::new(non_blocking))
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let _guard = init_tracing(&args);
    setup_panic_hook();

    let addr = format!("{}:{}", args.host, args.port);
    let upstream = args.upstream_url();
    let state = match AppState::new(args) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Options: strict_xml={} unknown_as_mcp={} multi_tool={:?} flush_threshold={} guardrail={} grammar={:?}",
        state.args.strict_xml,
        state.args.allow_unknown_as_mcp,
        state.args.multi_tool_policy,
        state.args.text_flush_threshold,
        state.args.inject_guardrail,
        state.args.grammar_hint
    );

    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("toolshim listening on {} -> {}", addr, upstream);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}
