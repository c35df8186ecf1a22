//! Contact records.
//!
//! Remote `Person` entries created by manual entry, phonebook import, or a
//! completed handshake. `paired` is only ever set alongside a public key that
//! was cryptographically bound to the contact's AFN-ID.

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::KeyValueStore;

const CONTACTS_KEY: &str = "contacts:v1";

/// A remote contact. `afn_id` and `pub_key` start out unknown for manually
/// entered people and are filled in by the pairing handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub display_name: String,
    pub afn_id: Option<String>,
    /// Base64 Ed25519 public key, present only once learned.
    pub pub_key: Option<String>,
    pub phone: Option<String>,
    pub paired: bool,
    /// Unix millis of the last time this contact was heard from.
    pub last_seen: Option<i64>,
}

impl Person {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            afn_id: None,
            pub_key: None,
            phone: None,
            paired: false,
            last_seen: None,
        }
    }

    pub fn with_afn_id(mut self, afn_id: impl Into<String>) -> Self {
        self.afn_id = Some(afn_id.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

/// Contact store collaborator, persisted as a single JSON document keyed by
/// AFN-ID. People without an AFN-ID yet are keyed by display name.
pub struct ContactStore {
    store: Arc<dyn KeyValueStore>,
    people: DashMap<String, Person>,
}

impl ContactStore {
    /// Load persisted contacts; an unreadable record starts an empty store
    /// rather than failing the caller.
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let people = DashMap::new();
        match store.get(CONTACTS_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Person>>(&raw) {
                Ok(list) => {
                    for person in list {
                        people.insert(Self::key_of(&person), person);
                    }
                }
                Err(e) => warn!("Corrupt contact records, starting empty: {e}"),
            },
            Ok(None) => {}
            Err(e) => warn!("Contact storage unreadable, starting empty: {e}"),
        }
        debug!("Loaded {} contacts", people.len());
        Self { store, people }
    }

    fn key_of(person: &Person) -> String {
        person
            .afn_id
            .clone()
            .unwrap_or_else(|| person.display_name.clone())
    }

    /// Insert or replace a contact.
    pub async fn upsert(&self, person: Person) -> Result<()> {
        self.people.insert(Self::key_of(&person), person);
        self.persist().await
    }

    /// Mark a contact as paired with their verified public key, creating the
    /// record if the handshake came from someone not yet in the store.
    pub async fn mark_paired(&self, afn_id: &str, pub_key_b64: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut entry = self
            .people
            .entry(afn_id.to_string())
            .or_insert_with(|| Person::new(afn_id).with_afn_id(afn_id));
        entry.afn_id = Some(afn_id.to_string());
        entry.pub_key = Some(pub_key_b64.to_string());
        entry.paired = true;
        entry.last_seen = Some(now);
        drop(entry);
        self.persist().await
    }

    /// Update the last-seen timestamp if the contact exists.
    pub fn touch(&self, afn_id: &str) {
        if let Some(mut person) = self.people.get_mut(afn_id) {
            person.last_seen = Some(Utc::now().timestamp_millis());
        }
    }

    pub fn find_by_afn_id(&self, afn_id: &str) -> Option<Person> {
        self.people.get(afn_id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Person> {
        self.people.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn persist(&self) -> Result<()> {
        let list: Vec<Person> = self.all();
        let raw = serde_json::to_string(&list).context("serialize contacts")?;
        if let Err(e) = self.store.set(CONTACTS_KEY, &raw).await {
            // Degraded mode: in-memory contacts keep working.
            warn!("Failed to persist contacts: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn mark_paired_upgrades_existing_contact() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let contacts = ContactStore::load(store.clone()).await;

        contacts
            .upsert(Person::new("Ayşe").with_afn_id("AFN-TEST-TEST-TEST"))
            .await
            .unwrap();
        contacts
            .mark_paired("AFN-TEST-TEST-TEST", "cHVia2V5")
            .await
            .unwrap();

        let person = contacts.find_by_afn_id("AFN-TEST-TEST-TEST").unwrap();
        assert!(person.paired);
        assert_eq!(person.pub_key.as_deref(), Some("cHVia2V5"));
        assert!(person.last_seen.is_some());

        // Survives a reload through the same backing store.
        let reloaded = ContactStore::load(store).await;
        assert!(reloaded.find_by_afn_id("AFN-TEST-TEST-TEST").unwrap().paired);
    }

    #[tokio::test]
    async fn mark_paired_creates_unknown_contact() {
        let contacts = ContactStore::load(Arc::new(MemoryStore::new()) as _).await;
        contacts.mark_paired("AFN-NEWW-NEWW-NEWW", "a2V5").await.unwrap();
        let person = contacts.find_by_afn_id("AFN-NEWW-NEWW-NEWW").unwrap();
        assert!(person.paired);
    }
}
