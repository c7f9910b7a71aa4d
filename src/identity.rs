//! Device identity resolution.
//!
//! Devices provisioned before identity persistence existed only know their
//! id from the provisioning parameter. The first startup with network access
//! pulls the canonical record and persists it; afterwards the persisted
//! record is authoritative unless the supplied id disagrees with it.

use crate::api::ServerClient;
use crate::error::{AgentError, Result};
use crate::model::DeviceIdentity;
use crate::store::Store;
use std::sync::Arc;

pub struct IdentityResolver {
    store: Arc<Store>,
    api: ServerClient,
}

impl IdentityResolver {
    pub fn new(store: Arc<Store>, api: ServerClient) -> Self {
        Self { store, api }
    }

    /// Resolve the persisted identity, migrating it from the server when it is
    /// missing or belongs to a different device than `supplied_device_id`.
    ///
    /// Never fails: server or disk errors leave whatever identity could be
    /// read (possibly none) and the migration is retried on the next start.
    pub async fn resolve(&self, supplied_device_id: Option<&str>) -> Option<DeviceIdentity> {
        let persisted = match self.store.load_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("Failed to read persisted device identity: {}", e);
                None
            }
        };

        let Some(supplied) = supplied_device_id else {
            return persisted;
        };

        if let Some(identity) = &persisted {
            if identity.device_id == supplied {
                return persisted;
            }
            tracing::info!(
                "Supplied device id {} differs from persisted {}, re-resolving",
                supplied,
                identity.device_id
            );
        }

        match self.refresh(supplied).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!("Device identity migration failed, will retry on next start: {}", e);
                // a mismatched identity is never handed out in place of the supplied one
                persisted.filter(|identity| identity.device_id == supplied)
            }
        }
    }

    /// Pull the canonical record for `device_id` and overwrite the persisted
    /// identity with it. Used for migration and explicit area reassignment.
    pub async fn refresh(&self, device_id: &str) -> Result<DeviceIdentity> {
        let record = self.api.fetch_device(device_id).await?;
        let identity = DeviceIdentity::from(record);

        if identity.device_id != device_id {
            return Err(AgentError::MalformedServerResponse(format!(
                "requested device {} but server returned {}",
                device_id, identity.device_id
            )));
        }

        self.store.save_identity(&identity).await?;
        tracing::info!(
            "Device identity persisted: {} ({}) in area {}",
            identity.device_id,
            identity.device_code,
            identity.area_id
        );
        Ok(identity)
    }
}

/// The device id the agent operates under: an externally supplied id wins
/// over the persisted identity.
pub fn effective_device_id(
    supplied: Option<&str>,
    identity: Option<&DeviceIdentity>,
) -> Result<String> {
    supplied
        .map(str::to_string)
        .or_else(|| identity.map(|i| i.device_id.clone()))
        .ok_or(AgentError::MissingDeviceId)
}
