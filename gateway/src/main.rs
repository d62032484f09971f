//! Process entry point: configuration, logging, and the actix-web
//! server that hosts every route in [`http`].
//!
//! Grounded on `shelter::main`'s shape (`#[actix_web::main]`, `Cli::parse()`,
//! `HttpServer::new(move || App::new()...)`), with the teacher's plain
//! `env_logger::init_from_env` replaced by `tracing-subscriber` (so
//! `tracing-actix-web`'s request spans and `gateway-core`'s `log::*`
//! calls land in the same output) bridged in via `tracing-log`.

mod config;
mod error;
mod http;
mod state;
mod upgrade;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;

use config::{Cli, Config};
use state::AppState;

fn init_logging() {
    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).init();
    tracing_log::LogTracer::init().expect("tracing-log bridge installs exactly once per process");
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    let cli = Cli::parse();
    if let Some(path) = &cli.config_file {
        if let Err(e) = config::apply_config_file(path) {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    }
    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::error!("{e}");
        std::process::exit(1);
    });
    let listen_addr = cli.listen_addr().unwrap_or_else(|e| {
        tracing::error!("invalid listen address: {e}");
        std::process::exit(1);
    });

    let shutdown_grace_ms = config.shutdown_grace_ms;
    let state = AppState::new(&config);
    let shutdown_state = Arc::clone(&state);

    tracing::info!("listening on {listen_addr}");

    let server = HttpServer::new(move || {
        App::new()
            .wrap(tracing_actix_web::TracingLogger::default())
            .app_data(web::Data::new(Arc::clone(&state)))
            .route("/healthz", web::get().to(http::healthz))
            .route("/readyz", web::get().to(http::readyz))
            .route("/version", web::get().to(http::version))
            .route("/session", web::post().to(http::create_session))
            .route("/metrics", web::get().to(http::metrics))
            .route("/dns-query", web::get().to(http::dns_query_get))
            .route("/dns-query", web::post().to(http::dns_query_post))
            .route("/dns-json", web::get().to(http::dns_json))
            .route("/tcp", web::get().to(http::tcp_tunnel))
            .route("/tcp-mux", web::get().to(http::tcp_mux_tunnel))
            .default_service(web::route().to(http::not_found))
    })
    .shutdown_timeout(shutdown_grace_ms.div_ceil(1000))
    .bind(listen_addr)?
    .run();

    let handle = server.handle();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining for up to {shutdown_grace_ms}ms");
        shutdown_state.shutting_down.store(true, Ordering::SeqCst);
        handle.stop(true).await;
    });

    server.await
}
