use std::sync::Arc;
use tracing::{error, info, info_span};

use bulklog::env::{env_or, BULKLOG_DATABASE_ENV};
use bulklog::http::{HttpDocumentSink, HttpSinkConfig};
use bulklog::init::init_tracing_with_fmt;
use bulklog::record::Level;
use bulklog::shipper::{LogShipper, ShipperOptions};

#[tokio::main]
async fn main() {
    let sink = Arc::new(HttpDocumentSink::new(HttpSinkConfig::from_env()));
    let database = env_or(BULKLOG_DATABASE_ENV, "logs");
    let shipper = LogShipper::start(sink, ShipperOptions::new(database));
    init_tracing_with_fmt(&shipper);

    // Through the tracing front end, scopes included.
    {
        let span = info_span!("checkout", order = 1207);
        let _guard = span.enter();
        info!(target: "svc.billing", amount = 42.50, "payment captured");
        error!(target: "svc.billing", code = "card_declined", "payment retry failed");
    }

    // Or through the direct producer API.
    let logger = shipper.logger("svc.auth");
    logger
        .log(logger.record(Level::Warning, "token about to expire").with_field("userId", 42))
        .await;

    shipper.shutdown().await;
    let metrics = shipper.metrics();
    println!(
        "shipped {} record(s), dropped {}, abandoned {}",
        metrics.committed, metrics.dropped, metrics.abandoned
    );
}
