use std::path::PathBuf;
use std::time::Duration;

use proptest::prelude::*;
use test_case::test_case;

use super::*;

// ============================================================================
// Health
// ============================================================================

#[test]
fn health_states_are_ordered() {
    assert!(HealthState::Red < HealthState::Yellow);
    assert!(HealthState::Yellow < HealthState::Green);
    assert!(HealthState::Green.satisfies(HealthState::Yellow));
    assert!(HealthState::Yellow.satisfies(HealthState::Yellow));
    assert!(!HealthState::Red.satisfies(HealthState::Yellow));
}

#[test_case("red", HealthState::Red; "red")]
#[test_case("YELLOW", HealthState::Yellow; "upper case yellow")]
#[test_case("green", HealthState::Green; "green")]
fn health_state_parses(raw: &str, expected: HealthState) {
    assert_eq!(raw.parse::<HealthState>().unwrap(), expected);
}

#[test]
fn unknown_health_state_is_rejected() {
    assert!("purple".parse::<HealthState>().is_err());
}

#[test]
fn health_state_serializes_lowercase() {
    let json = serde_json::to_string(&HealthState::Yellow).unwrap();
    assert_eq!(json, "\"yellow\"");
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn identity_derives_node_directories() {
    let identity = ClusterIdentity::new("test-cluster", "/tmp/quarry");
    assert_eq!(identity.name(), "test-cluster");
    assert_eq!(identity.node_data_dir(0), PathBuf::from("/tmp/quarry/node_1"));
    assert_eq!(identity.node_data_dir(2), PathBuf::from("/tmp/quarry/node_3"));
}

#[test]
fn identity_clones_compare_equal() {
    let identity = ClusterIdentity::new("a", "/tmp/a");
    let clone = identity.clone();
    assert_eq!(identity, clone);
    assert_ne!(identity, ClusterIdentity::new("b", "/tmp/a"));
}

proptest! {
    /// Property: display names are distinct for distinct ordinals
    #[test]
    fn prop_node_names_are_distinct(a in 0usize..10_000, b in 0usize..10_000) {
        prop_assume!(a != b);
        prop_assert_ne!(node_name(a), node_name(b));
    }
}

// ============================================================================
// Settings
// ============================================================================

#[test]
fn settings_typed_getters() {
    let settings = Settings::builder()
        .put(keys::HTTP_PORT, 9200)
        .put(keys::NODE_MASTER, "false")
        .put(keys::ALLOCATION_DELAY_MS, 25)
        .build();

    assert_eq!(settings.get_as::<u16>(keys::HTTP_PORT).unwrap(), Some(9200));
    assert!(!settings.get_bool(keys::NODE_MASTER, true).unwrap());
    assert!(settings.get_bool(keys::NODE_DATA, true).unwrap());
    assert_eq!(
        settings
            .get_duration_ms(keys::ALLOCATION_DELAY_MS, Duration::ZERO)
            .unwrap(),
        Duration::from_millis(25)
    );
    assert_eq!(settings.get_or(keys::NUMBER_OF_SHARDS, 5u32).unwrap(), 5);
}

#[test]
fn settings_reject_malformed_values() {
    let settings = Settings::builder().put(keys::HTTP_PORT, "eighty").build();
    let err = settings.get_as::<u16>(keys::HTTP_PORT).unwrap_err();
    assert_eq!(err.key, keys::HTTP_PORT);
    assert_eq!(err.value, "eighty");

    let settings = Settings::builder().put(keys::HTTP_ENABLED, "maybe").build();
    assert!(settings.get_bool(keys::HTTP_ENABLED, true).is_err());
}

#[test]
fn builder_put_if_absent_keeps_existing() {
    let mut builder = SettingsBuilder::new();
    builder.put("a", 1).put_if_absent("a", 2).put_if_absent("b", 3);
    let settings = builder.build();
    assert_eq!(settings.get("a"), Some("1"));
    assert_eq!(settings.get("b"), Some("3"));
}

#[test]
fn to_builder_round_trips_entries() {
    let settings: Settings = [("x", "1"), ("y", "2")].into_iter().collect();
    let mut builder = settings.to_builder();
    builder.put("z", 3);
    let extended = builder.build();
    assert_eq!(extended.len(), 3);
    assert_eq!(extended.get("x"), Some("1"));
}

#[test]
fn storage_mode_settings() {
    assert_eq!(StorageMode::Memory.as_setting(), "memory");
    assert_eq!(StorageMode::from_setting("fs"), Some(StorageMode::Fs));
    assert_eq!(StorageMode::from_setting("ram"), Some(StorageMode::Memory));
    assert_eq!(StorageMode::from_setting("tape"), None);
}

// ============================================================================
// Search types
// ============================================================================

#[test]
fn search_response_survives_postcard() {
    let response = SearchResponse {
        took_ms: 3,
        timed_out: false,
        total_hits: 1,
        hits: vec![SearchHit {
            index: "i".into(),
            doc_type: "t".into(),
            id: "1".into(),
            source: r#"{"msg":"hello"}"#.into(),
        }],
    };
    let bytes = postcard::to_allocvec(&response).unwrap();
    let decoded: SearchResponse = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, response);
    assert_eq!(decoded.hits[0].source_value().unwrap()["msg"], "hello");
}

#[test]
fn sort_builder() {
    let sort = Sort::field("order").order(SortOrder::Desc);
    assert_eq!(sort.field, "order");
    assert_eq!(sort.order, SortOrder::Desc);
}
