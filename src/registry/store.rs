use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::window::ProcessingWindow;

/// Config key overriding how many workers a store's pipeline needs.
pub const WORKERS_CONFIG_KEY: &str = "workers";

/// Scheduling tier of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Tiers in dequeue order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Base queue score for this tier.
    pub fn base_score(&self) -> i64 {
        match self {
            Priority::High => 1000,
            Priority::Medium => 500,
            Priority::Low => 100,
        }
    }

    /// Position of this tier in [`Priority::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Derived scheduling state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    Active,
    Inactive,
    Quarantined,
}

impl std::fmt::Display for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreState::Active => write!(f, "active"),
            StoreState::Inactive => write!(f, "inactive"),
            StoreState::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Scheduling metadata maintained by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub quarantined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quarantine_reason: Option<String>,
}

impl StoreMetadata {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            last_processed_at: None,
            failure_count: 0,
            quarantined: false,
            quarantined_at: None,
            quarantine_reason: None,
        }
    }
}

/// A tenant work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Scheduling tier.
    pub priority: Priority,
    /// Administrative on/off switch. Always false while quarantined.
    pub active: bool,
    /// Pipeline configuration, opaque to the scheduler.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Optional time restriction on when the store may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_window: Option<ProcessingWindow>,
    pub metadata: StoreMetadata,
}

impl Store {
    /// Creates an active store with empty configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            active: true,
            config: serde_json::Value::Object(serde_json::Map::new()),
            processing_window: None,
            metadata: StoreMetadata::new(Utc::now()),
        }
    }

    /// Sets the pipeline configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Sets the processing window.
    pub fn with_window(mut self, window: ProcessingWindow) -> Self {
        self.processing_window = Some(window);
        self
    }

    /// Sets the active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Returns the current scheduling state.
    pub fn state(&self) -> StoreState {
        if self.metadata.quarantined {
            StoreState::Quarantined
        } else if self.active {
            StoreState::Active
        } else {
            StoreState::Inactive
        }
    }

    /// Whether the store may be picked up by a scheduling pass.
    pub fn is_schedulable(&self) -> bool {
        self.state() == StoreState::Active
    }

    /// Worker count requested through the `workers` config key, if any.
    pub fn requested_workers(&self) -> Option<usize> {
        self.config
            .get(WORKERS_CONFIG_KEY)
            .and_then(|v| v.as_u64())
            .filter(|n| *n > 0)
            .map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_base_scores() {
        assert_eq!(Priority::High.base_score(), 1000);
        assert_eq!(Priority::Medium.base_score(), 500);
        assert_eq!(Priority::Low.base_score(), 100);
    }

    #[test]
    fn test_priority_parse_and_display() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(Priority::Low.to_string(), "low");
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_store_state() {
        let mut store = Store::new("s1", "Store 1", Priority::Medium);
        assert_eq!(store.state(), StoreState::Active);

        store.active = false;
        assert_eq!(store.state(), StoreState::Inactive);

        store.metadata.quarantined = true;
        assert_eq!(store.state(), StoreState::Quarantined);
        assert!(!store.is_schedulable());
    }

    #[test]
    fn test_requested_workers() {
        let store = Store::new("s1", "Store 1", Priority::High);
        assert_eq!(store.requested_workers(), None);

        let store = store.with_config(json!({ "workers": 2 }));
        assert_eq!(store.requested_workers(), Some(2));

        let store = store.with_config(json!({ "workers": 0 }));
        assert_eq!(store.requested_workers(), None);
    }

    #[test]
    fn test_store_serde_roundtrip_defaults() {
        let raw = json!({
            "id": "s1",
            "name": "Store 1",
            "priority": "low",
            "active": true,
            "metadata": {
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            }
        });
        let store: Store = serde_json::from_value(raw).unwrap();
        assert_eq!(store.priority, Priority::Low);
        assert_eq!(store.metadata.failure_count, 0);
        assert!(!store.metadata.quarantined);
        assert!(store.processing_window.is_none());
    }
}
