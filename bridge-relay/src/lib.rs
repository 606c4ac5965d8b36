//! Relay tier of the bridge
//!
//! Forwards page messages across the privilege boundary, tagging each one
//! with the page origin and refusing network work for disabled domains.

pub mod meta;
pub mod router;

pub use meta::detect_meta_signal;
pub use router::RelayRouter;

use bridge_common::{window_pair, PageToRelay, RelayToPage, RuntimeChannel, SenderInfo, WindowEndpoint};
use std::sync::Arc;

/// Start a relay for one document and return the page end of its window bus.
/// `document_html` is scanned once for the opt-in meta tag.
pub fn spawn_relay(
    runtime: Arc<dyn RuntimeChannel>,
    origin: &str,
    document_html: &str,
) -> WindowEndpoint<PageToRelay, RelayToPage> {
    let (page_side, relay_side) = window_pair::<PageToRelay, RelayToPage>();
    let router = Arc::new(RelayRouter::new(
        runtime,
        SenderInfo::new(origin),
        detect_meta_signal(document_html),
    ));
    tokio::spawn(router.run(relay_side));
    page_side
}
