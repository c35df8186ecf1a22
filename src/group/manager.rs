//! Group lifecycle and persistence.
//!
//! A creator holds the seed and can re-derive the shared key for any member
//! set; a joiner holds only the AFN-GID plus a key obtained out-of-band and
//! can never mint keys for new member sets.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::codec::{self, GROUP_KEY_LEN, SEED_LEN};
use crate::storage::KeyValueStore;

const GROUP_INDEX_KEY: &str = "groups:v1";

fn group_key(gid: &str) -> String {
    format!("group:{gid}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub afn_id: String,
    /// Base64 Ed25519 public key, once learned.
    pub pub_key: Option<String>,
    /// True when the key was learned through a verified pairing rather than
    /// asserted by the member themselves.
    pub verified: bool,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub gid: String,
    pub name: String,
    /// Present only on the creator's device.
    pub seed: Option<Vec<u8>>,
    pub shared_key: Option<Vec<u8>>,
    pub members: Vec<GroupMember>,
    pub created_at: i64,
    pub last_activity: i64,
    pub is_creator: bool,
}

impl Group {
    pub fn shared_key_bytes(&self) -> Option<[u8; GROUP_KEY_LEN]> {
        self.shared_key
            .as_deref()
            .and_then(|k| <[u8; GROUP_KEY_LEN]>::try_from(k).ok())
    }
}

/// Owns group records and their derivation lifecycle on top of the key-value
/// collaborator.
pub struct GroupManager {
    store: Arc<dyn KeyValueStore>,
    groups: DashMap<String, Group>,
}

impl GroupManager {
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let groups = DashMap::new();
        let gids: Vec<String> = match store.get(GROUP_INDEX_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Group index unreadable, starting empty: {e}");
                Vec::new()
            }
        };
        for gid in gids {
            match store.get(&group_key(&gid)).await {
                Ok(Some(raw)) => match serde_json::from_str::<Group>(&raw) {
                    Ok(group) => {
                        groups.insert(gid, group);
                    }
                    Err(e) => warn!("Corrupt group record {gid}: {e}"),
                },
                Ok(None) => debug!("Indexed group {gid} has no record"),
                Err(e) => warn!("Group {gid} unreadable: {e}"),
            }
        }
        debug!("Loaded {} groups", groups.len());
        Self { store, groups }
    }

    /// Create a new group. The caller becomes its first, verified member and
    /// the only holder of the seed.
    pub async fn create(
        &self,
        name: &str,
        my_afn_id: &str,
        my_pub_key: &[u8],
        my_pub_key_b64: &str,
    ) -> Result<Group> {
        let seed = codec::generate_seed();
        let gid = codec::gid_from_seed(&seed);
        let now = Utc::now().timestamp_millis();

        let members = vec![GroupMember {
            afn_id: my_afn_id.to_string(),
            pub_key: Some(my_pub_key_b64.to_string()),
            verified: true,
            joined_at: now,
        }];
        let key = codec::derive_group_key(&seed, &[my_pub_key.to_vec()]);

        let group = Group {
            id: Uuid::new_v4(),
            gid: gid.clone(),
            name: name.to_string(),
            seed: Some(seed.to_vec()),
            shared_key: Some(key.to_vec()),
            members,
            created_at: now,
            last_activity: now,
            is_creator: true,
        };
        self.groups.insert(gid.clone(), group.clone());
        self.persist(&gid).await?;
        info!("Created group {name} ({gid})");
        Ok(group)
    }

    /// Instantiate a group from a shared AFN-GID and an out-of-band key.
    /// No seed: this device can use the key but never derive new ones.
    pub async fn join(&self, gid: &str, name: &str, key: [u8; GROUP_KEY_LEN]) -> Result<Group> {
        if !codec::validate_gid(gid).ok {
            bail!("invalid AFN-GID");
        }
        if self.groups.contains_key(gid) {
            bail!("already a member of {gid}");
        }
        let now = Utc::now().timestamp_millis();
        let group = Group {
            id: Uuid::new_v4(),
            gid: gid.to_string(),
            name: name.to_string(),
            seed: None,
            shared_key: Some(key.to_vec()),
            members: Vec::new(),
            created_at: now,
            last_activity: now,
            is_creator: false,
        };
        self.groups.insert(gid.to_string(), group.clone());
        self.persist(gid).await?;
        info!("Joined group {name} ({gid})");
        Ok(group)
    }

    /// Add a member. On the creator's device this re-derives the shared key
    /// from the seed and the full member key set.
    pub async fn add_member(&self, gid: &str, member: GroupMember) -> Result<Group> {
        {
            let mut group = self
                .groups
                .get_mut(gid)
                .with_context(|| format!("unknown group {gid}"))?;
            if group.members.iter().any(|m| m.afn_id == member.afn_id) {
                bail!("{} is already a member of {gid}", member.afn_id);
            }
            group.members.push(member);
            group.last_activity = Utc::now().timestamp_millis();

            if group.is_creator {
                let seed_bytes = group
                    .seed
                    .as_deref()
                    .context("creator group record lost its seed")?;
                let seed = <[u8; SEED_LEN]>::try_from(seed_bytes)
                    .map_err(|_| anyhow::anyhow!("stored seed has wrong length"))?;
                let member_keys: Vec<Vec<u8>> = group
                    .members
                    .iter()
                    .filter_map(|m| m.pub_key.as_deref())
                    .filter_map(|b64| {
                        use base64::Engine;
                        base64::engine::general_purpose::STANDARD.decode(b64).ok()
                    })
                    .collect();
                let key = codec::derive_group_key(&seed, &member_keys);
                group.shared_key = Some(key.to_vec());
            }
        }
        self.persist(gid).await?;
        self.get(gid)
            .with_context(|| format!("unknown group {gid}"))
    }

    /// Record activity on a group (a message sent or received).
    pub async fn touch(&self, gid: &str) -> Result<()> {
        if let Some(mut group) = self.groups.get_mut(gid) {
            group.last_activity = Utc::now().timestamp_millis();
        }
        self.persist(gid).await
    }

    pub fn get(&self, gid: &str) -> Option<Group> {
        self.groups.get(gid).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Group> {
        self.groups.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn persist(&self, gid: &str) -> Result<()> {
        if let Some(group) = self.groups.get(gid) {
            let raw = serde_json::to_string(group.value()).context("serialize group")?;
            if let Err(e) = self.store.set(&group_key(gid), &raw).await {
                warn!("Failed to persist group {gid}: {e}");
            }
        }
        let index: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        if let Err(e) = self
            .store
            .set(GROUP_INDEX_KEY, &serde_json::to_string(&index)?)
            .await
        {
            warn!("Failed to persist group index: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::storage::MemoryStore;

    fn member(identity: &Identity) -> GroupMember {
        GroupMember {
            afn_id: identity.afn_id().to_string(),
            pub_key: Some(identity.public_key_b64()),
            verified: true,
            joined_at: Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn creator_key_matches_independent_derivation() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let manager = GroupManager::load(store).await;

        let alice = Identity::generate();
        let bob = Identity::generate();
        let carol = Identity::generate();

        let group = manager
            .create("aile", alice.afn_id(), &alice.public_key_bytes(), &alice.public_key_b64())
            .await
            .unwrap();
        manager.add_member(&group.gid, member(&bob)).await.unwrap();
        let group = manager.add_member(&group.gid, member(&carol)).await.unwrap();

        // Any member holding the seed and the same member set reaches the
        // identical key, regardless of collection order.
        let seed = <[u8; SEED_LEN]>::try_from(group.seed.clone().unwrap().as_slice()).unwrap();
        let independent = codec::derive_group_key(
            &seed,
            &[
                carol.public_key_bytes().to_vec(),
                alice.public_key_bytes().to_vec(),
                bob.public_key_bytes().to_vec(),
            ],
        );
        assert_eq!(group.shared_key_bytes().unwrap(), independent);
    }

    #[tokio::test]
    async fn joiner_has_key_but_no_seed() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let manager = GroupManager::load(store.clone()).await;

        let key = [4u8; GROUP_KEY_LEN];
        let gid = codec::gid_from_seed(&codec::generate_seed());
        let group = manager.join(&gid, "komsu", key).await.unwrap();
        assert!(group.seed.is_none());
        assert!(!group.is_creator);
        assert_eq!(group.shared_key_bytes().unwrap(), key);

        // Records survive a reload.
        let reloaded = GroupManager::load(store).await;
        assert!(reloaded.get(&gid).is_some());
    }

    #[tokio::test]
    async fn join_rejects_bad_gid() {
        let manager = GroupManager::load(Arc::new(MemoryStore::new()) as _).await;
        assert!(manager.join("AFN-GID-XXXX-!!!!", "x", [0u8; GROUP_KEY_LEN]).await.is_err());
    }
}
