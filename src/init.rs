use crate::layer::ShipperLayer;
use crate::shipper::LogShipper;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Install a global `tracing` subscriber that forwards every event to the
/// given shipper.
///
/// **Effects**
///
/// Sets the process-wide default subscriber; call once at startup, after
/// [`LogShipper::start`]. Panics if a global subscriber is already set.
pub fn init_tracing(shipper: &LogShipper) {
    let subscriber = Registry::default().with(ShipperLayer::new(shipper));
    tracing::subscriber::set_global_default(subscriber).expect("set global subscriber");
}

/// Like [`init_tracing`], but also prints events to the console through a
/// `fmt` layer. Recommended for services where stdout is collected anyway.
pub fn init_tracing_with_fmt(shipper: &LogShipper) {
    let fmt_layer = tracing_subscriber::fmt::layer();
    let subscriber = Registry::default().with(ShipperLayer::new(shipper)).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("set global subscriber");
}
