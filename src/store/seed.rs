//! JSON fixture describing devices, clients, and subscriptions.

use std::path::Path;

use serde::Deserialize;

use super::MemoryStore;
use crate::core::{BaseId, ClientId, ConfigError};
use crate::crypto::DeviceKey;

/// Registered Base.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedBase {
    /// Hex identity.
    pub id: BaseId,
    /// Hex device key.
    pub key: DeviceKey,
    /// Installation timezone offset in minutes.
    #[serde(default)]
    pub timezone_offset_minutes: i16,
}

/// Registered Client.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedClient {
    /// Numeric id.
    pub id: ClientId,
    /// Login token.
    pub token: String,
}

/// Client-to-Base subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedSubscription {
    /// Subscribed Client.
    pub client: ClientId,
    /// Followed Base.
    pub base: BaseId,
}

/// Contents of a `--seed` file.
///
/// ```json
/// {
///   "bases": [{ "id": "00..0f", "key": "2b7e..3c", "timezone_offset_minutes": 60 }],
///   "clients": [{ "id": 1, "token": "secret" }],
///   "subscriptions": [{ "client": 1, "base": "00..0f" }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    /// Bases.
    pub bases: Vec<SeedBase>,
    /// Clients.
    pub clients: Vec<SeedClient>,
    /// Subscriptions.
    pub subscriptions: Vec<SeedSubscription>,
}

impl Seed {
    /// Read a seed file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Build a store holding exactly this fixture.
    pub fn into_store(self) -> MemoryStore {
        let store = MemoryStore::new();
        for base in self.bases {
            store.add_base_with_timezone(base.id, base.key, base.timezone_offset_minutes);
        }
        for client in self.clients {
            store.add_client(client.id, client.token);
        }
        for sub in self.subscriptions {
            store.subscribe(sub.client, sub.base);
        }
        store
    }
}
