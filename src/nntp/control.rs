//! Control-message authorization and side effects
//!
//! Invoked only after POST has accepted the containing message. Side
//! effects are best-effort: failures are logged, never surfaced to the
//! posting client.

use tracing::{debug, info, warn};

use crate::store::{Identity, Store};

/// Whether the identity may issue this control message at all
///
/// A denial here makes POST answer `480` before anything is stored.
pub(super) fn authorized(identity: &Identity, control: &str, targets: &[String]) -> bool {
    let verb = control
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match verb.as_str() {
        "cancel" => {
            identity.flags.can_cancel || targets.iter().any(|c| identity.moderates(c))
        }
        "newgroup" => identity.flags.can_create_catalogs,
        "rmgroup" => identity.flags.can_delete_catalogs,
        "checkgroups" => identity.flags.can_check_catalogs,
        _ => false,
    }
}

/// Apply an authorized control message
pub(super) fn apply(
    store: &dyn Store,
    identity: &Identity,
    control: &str,
    targets: &[String],
    control_message_id: &str,
) {
    let mut tokens = control.split_whitespace();
    let verb = tokens.next().unwrap_or("").to_ascii_lowercase();
    let argument = tokens.next().unwrap_or("");

    match verb.as_str() {
        "cancel" => {
            if argument.is_empty() {
                warn!("cancel control message without a target message-id");
                return;
            }
            for catalog in targets {
                match store.cancel_message(identity, argument, catalog) {
                    Ok(true) => debug!(catalog = %catalog, target = %argument, "cancelled"),
                    Ok(false) => debug!(catalog = %catalog, target = %argument, "no link to cancel"),
                    Err(e) => warn!(catalog = %catalog, error = %e, "cancel failed"),
                }
                // the cancel message itself is hidden along with its target
                if let Err(e) = store.cancel_message(identity, control_message_id, catalog) {
                    warn!(catalog = %catalog, error = %e, "hiding cancel message failed");
                }
            }
        }
        "newgroup" => {
            if argument.is_empty() {
                warn!("newgroup control message without a name");
                return;
            }
            match store.create_catalog(identity, argument) {
                Ok(true) => info!(catalog = %argument, "catalog created by control message"),
                Ok(false) => debug!(catalog = %argument, "newgroup: catalog already exists"),
                Err(e) => warn!(catalog = %argument, error = %e, "newgroup failed"),
            }
        }
        "rmgroup" => {
            if argument.is_empty() {
                warn!("rmgroup control message without a name");
                return;
            }
            match store.delete_catalog(identity, argument) {
                Ok(true) => info!(catalog = %argument, "catalog removed by control message"),
                Ok(false) => debug!(catalog = %argument, "rmgroup: no such catalog"),
                Err(e) => warn!(catalog = %argument, error = %e, "rmgroup failed"),
            }
        }
        // only cancel/newgroup/rmgroup have store-defined effects
        "checkgroups" => {
            info!(stamp = %argument, username = identity.username, "checkgroups requested");
        }
        other => warn!(verb = %other, "unsupported control verb reached the handler"),
    }
}
