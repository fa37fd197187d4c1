//! GUID-keyed pseudo-identity registry.
//!
//! Used only in Disabled mode, where no verified credential exists and callers
//! are attributed via caller-supplied GUIDs. Records persist for the process
//! lifetime; they are looked up, never mutated, on each token operation.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::settings::AuthenticationMode;

/// A pseudo-identity registered for attribution when user authentication is
/// switched off. The GUID is caller-supplied, not server-generated; this
/// path is restricted to non-production mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudoUser {
    pub id: Uuid,
    /// Server-generated secondary GUID for audit cross-referencing.
    pub audit_guid: Uuid,
    pub display_name: Option<String>,
    pub contact_email: Option<String>,
    pub originating_mode: AuthenticationMode,
    pub registered_at: DateTime<Utc>,
}

/// Registry of pseudo-identities, keyed by caller-supplied GUID.
///
/// Read-heavy: lookups take the shared lock; registration is rare and takes
/// the exclusive lock.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: RwLock<HashMap<Uuid, PseudoUser>>,
}

impl UserRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) existence check.
    pub fn is_registered(&self, guid: Uuid) -> bool {
        self.users
            .read()
            .map(|users| users.contains_key(&guid))
            .unwrap_or(false)
    }

    /// Idempotent insert. Returns the stored record; if the GUID was already
    /// registered, the existing record is returned unchanged.
    pub fn register(
        &self,
        guid: Uuid,
        display_name: Option<&str>,
        contact_email: Option<&str>,
        originating_mode: AuthenticationMode,
    ) -> PseudoUser {
        let mut users = match self.users.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        users
            .entry(guid)
            .or_insert_with(|| {
                let user = PseudoUser {
                    id: guid,
                    audit_guid: Uuid::new_v4(),
                    display_name: display_name.map(str::to_string),
                    contact_email: contact_email.map(str::to_string),
                    originating_mode,
                    registered_at: Utc::now(),
                };
                info!(
                    user_guid = %guid,
                    audit_guid = %user.audit_guid,
                    mode = %originating_mode,
                    "registered pseudo-identity"
                );
                user
            })
            .clone()
    }

    /// Bulk-insert pre-built records, typically at startup from a fixture.
    ///
    /// Existing registrations win, matching [`UserRegistry::register`].
    /// Returns the number of records actually inserted.
    pub fn seed(&self, users: impl IntoIterator<Item = PseudoUser>) -> usize {
        let mut map = match self.users.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut inserted = 0;
        for user in users {
            if let std::collections::hash_map::Entry::Vacant(slot) = map.entry(user.id) {
                slot.insert(user);
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!(count = inserted, "seeded pseudo-identities");
        }
        inserted
    }

    /// Look up a registered pseudo-identity.
    pub fn get(&self, guid: Uuid) -> Option<PseudoUser> {
        self.users
            .read()
            .ok()
            .and_then(|users| users.get(&guid).cloned())
    }

    /// Remove a registration. All outstanding service tokens carrying this
    /// GUID become invalid immediately, independent of remaining lifetime.
    pub fn deregister(&self, guid: Uuid) -> bool {
        let mut users = match self.users.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = users.remove(&guid).is_some();
        if removed {
            info!(user_guid = %guid, "deregistered pseudo-identity");
        }
        removed
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or(0)
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
