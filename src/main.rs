use std::{sync::Arc, time::Duration};

use driftq::{
    error::Error,
    gateway::{http::HttpGateway, memory::InMemoryGateway, Gateway},
};
use tracing::warn;
use url::Url;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    driftq::run()
        .gateway_factory(|config: driftq::config::Config| async move {
            let gateway: Arc<dyn Gateway> = match config.gateway_url.as_deref() {
                Some(raw) => {
                    let endpoint = raw
                        .parse::<Url>()
                        .map_err(|e| Error::invalid_parameter(format!("gateway_url: {e}")))?;

                    Arc::new(HttpGateway::new(
                        endpoint,
                        Duration::from_secs(config.gateway_timeout_seconds),
                    )?)
                }
                None => {
                    warn!("no gateway configured, sends will only be recorded in memory");
                    Arc::new(InMemoryGateway::new())
                }
            };

            Ok(gateway)
        })
        .start()
        .await
}
