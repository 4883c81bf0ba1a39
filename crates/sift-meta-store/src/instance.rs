//! Persistent deployment identity.

use crate::error::MetaStoreResult;
use crate::keys;
use crate::store::MetaStore;
use sift_common::Node;
use tracing::info;

/// Return the deployment's instance id, minting and persisting one with
/// `node` on first use.
pub async fn instance_id(store: &dyn MetaStore, node: &Node) -> MetaStoreResult<String> {
    match store.get(keys::INSTANCE_ID).await {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(id) if !id.is_empty() => return Ok(id),
            _ => info!("Replacing unreadable instance id"),
        },
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let id = node.generate();
    store.set(keys::INSTANCE_ID, id.as_bytes()).await?;
    info!("Assigned instance id {}", id);
    Ok(id)
}
