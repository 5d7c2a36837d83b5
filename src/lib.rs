use std::{future::Future, sync::Arc};

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use config::Config;
use error::Error;
use gateway::Gateway;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};
use worker::DeliveryEngine;

pub mod api;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod service;
pub mod timing;
pub mod tracking;
pub mod worker;

/// Returns a builder for the main application.
///
/// The gateway factory receives the loaded configuration and produces the
/// send gateway the workers will use, so callers can wire a real provider,
/// the built-in HTTP gateway, or a recording one for development.
#[bon::builder(finish_fn = start)]
pub async fn run<G, F>(gateway_factory: G) -> eyre::Result<()>
where
    G: FnOnce(Config) -> F,
    F: Future<Output = Result<Arc<dyn Gateway>, Error>>,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DRIFTQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DRIFTQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let gateway = gateway_factory(config.clone()).await?;

    let service = service::Service::connect_with(config.clone()).await?;

    let mut engine = DeliveryEngine::new(service.db().clone(), config.clone(), gateway);
    engine.start();

    let data = Data::new(service);

    HttpServer::new(move || {
        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .service(api::messages::service())
            .service(api::data::service())
            .service(api::dead_letter::service())
            .app_data(data.clone())
            .app_data(json_cfg)
    })
    .bind(config.listen_addr.as_str())?
    .run()
    .await?;

    engine.shutdown().await;

    Ok(())
}
