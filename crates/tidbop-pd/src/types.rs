//! Wire types of the placement-service API.

use serde::{Deserialize, Serialize};

/// Placement-side state of a store, from its `state_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdStoreState {
    Up,
    Disconnected,
    Down,
    Offline,
    Tombstone,
    Unknown,
}

impl PdStoreState {
    pub fn parse(name: &str) -> Self {
        match name {
            "Up" => PdStoreState::Up,
            "Disconnected" => PdStoreState::Disconnected,
            "Down" => PdStoreState::Down,
            "Offline" => PdStoreState::Offline,
            "Tombstone" => PdStoreState::Tombstone,
            _ => PdStoreState::Unknown,
        }
    }
}

/// One store as reported by the placement service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub id: u64,
    pub address: String,
    /// Numeric state: 0 Up, 1 Offline, 2 Tombstone.
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub state_name: String,
}

impl StoreInfo {
    pub fn pd_state(&self) -> PdStoreState {
        if self.state_name.is_empty() {
            return match self.state {
                0 => PdStoreState::Up,
                1 => PdStoreState::Offline,
                2 => PdStoreState::Tombstone,
                _ => PdStoreState::Unknown,
            };
        }
        PdStoreState::parse(&self.state_name)
    }

    pub fn is_up(&self) -> bool {
        self.pd_state() == PdStoreState::Up
    }

    pub fn is_tombstone(&self) -> bool {
        self.pd_state() == PdStoreState::Tombstone
    }

    /// Removal requested; the store drains until placement tombstones it.
    pub fn is_offline(&self) -> bool {
        self.pd_state() == PdStoreState::Offline
    }
}

/// `{ "store": {...}, "status": {...} }`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StoreEnvelope {
    pub store: StoreInfo,
}

/// `GET /pd/api/v1/stores`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StoresResponse {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub stores: Vec<StoreEnvelope>,
}

/// A placement-service member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    #[serde(default)]
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
    #[serde(default)]
    pub peer_urls: Vec<String>,
}

/// `GET /pd/api/v1/members`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MembersResponse {
    #[serde(default)]
    pub members: Vec<MemberInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_store_listing() {
        let body = r#"{
            "count": 2,
            "stores": [
                {"store": {"id": 1, "address": "10.0.0.5:20160", "state": 0, "state_name": "Up"},
                 "status": {"capacity": "10 GiB"}},
                {"store": {"id": 4, "address": "10.0.0.6:20160", "state": 2, "state_name": "Tombstone"}}
            ]
        }"#;
        let resp: StoresResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.count, 2);
        assert!(resp.stores[0].store.is_up());
        assert!(resp.stores[1].store.is_tombstone());
    }

    #[test]
    fn state_falls_back_to_numeric_code() {
        let store = StoreInfo {
            id: 3,
            address: "a:20160".to_string(),
            state: 1,
            state_name: String::new(),
        };
        assert_eq!(store.pd_state(), PdStoreState::Offline);
        assert!(store.is_offline() && !store.is_up());
        assert_eq!(PdStoreState::parse("Down"), PdStoreState::Down);
        assert_eq!(PdStoreState::parse("Weird"), PdStoreState::Unknown);
    }
}
