use rusqlite::Connection;
use tempfile::tempdir;

use ozone_device::identity::Identity;
use ozone_device::link::WifiCredentials;
use ozone_device::storage::{CounterState, StateStore, StoreError, COUNTER_MARKER};
use ozone_device::types::CounterSnapshot;

#[test]
fn first_boot_initializes_zeroed_valid_counters() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let mut store = StateStore::open(&path).unwrap();
    assert_eq!(store.load_counters().unwrap(), CounterState::default());
    drop(store);

    let conn = Connection::open(&path).unwrap();
    let marker: i64 = conn
        .query_row("SELECT marker FROM counters WHERE id = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(marker, COUNTER_MARKER);
}

#[test]
fn counters_and_epoch_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let state = CounterState {
        counters: CounterSnapshot {
            basic: 12,
            standard: 4,
            premium: 1,
        },
        reset_epoch: 9,
    };
    {
        let mut store = StateStore::open(&path).unwrap();
        store.save_counters(&state).unwrap();
    }
    let mut store = StateStore::open(&path).unwrap();
    assert_eq!(store.load_counters().unwrap(), state);
}

#[test]
fn invalid_marker_self_heals_to_zero() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    {
        let mut store = StateStore::open(&path).unwrap();
        store
            .save_counters(&CounterState {
                counters: CounterSnapshot {
                    basic: 50,
                    standard: 5,
                    premium: 2,
                },
                reset_epoch: 3,
            })
            .unwrap();
    }
    {
        // A write interrupted before the marker landed.
        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE counters SET marker = 0, basic = 51 WHERE id = 1", [])
            .unwrap();
    }

    let mut store = StateStore::open(&path).unwrap();
    assert_eq!(store.load_counters().unwrap(), CounterState::default());
    drop(store);

    let conn = Connection::open(&path).unwrap();
    let (basic, marker): (i64, i64) = conn
        .query_row("SELECT basic, marker FROM counters WHERE id = 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(basic, 0);
    assert_eq!(marker, COUNTER_MARKER);
}

#[test]
fn unknown_schema_version_is_refused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA user_version = 7;").unwrap();
    }
    match StateStore::open(&path) {
        Err(StoreError::SchemaVersion { found }) => assert_eq!(found, 7),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("store with schema version 7 was accepted"),
    }
}

#[test]
fn identity_is_saved_only_when_complete() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let mut store = StateStore::open(&path).unwrap();
    assert_eq!(store.load_identity().unwrap(), None);

    let incomplete = Identity {
        device_id: "dev-1".to_string(),
        token: String::new(),
        assigned: true,
    };
    assert!(store.save_identity(&incomplete).is_err());
    assert_eq!(store.load_identity().unwrap(), None);

    let identity = Identity {
        device_id: "dev-1".to_string(),
        token: "tok-1".to_string(),
        assigned: false,
    };
    store.save_identity(&identity).unwrap();
    drop(store);

    let store = StateStore::open(&path).unwrap();
    assert_eq!(store.load_identity().unwrap(), Some(identity));
}

#[test]
fn wifi_credentials_round_trip_and_reject_oversized() {
    let dir = tempdir().unwrap();
    let mut store = StateStore::open(&dir.path().join("state.db")).unwrap();
    assert_eq!(store.load_wifi().unwrap(), None);

    let too_long = WifiCredentials {
        ssid: "s".repeat(33),
        password: "pw".to_string(),
    };
    assert!(store.save_wifi(&too_long).is_err());

    let creds = WifiCredentials {
        ssid: "salon".to_string(),
        password: "p".repeat(64),
    };
    store.save_wifi(&creds).unwrap();
    assert_eq!(store.load_wifi().unwrap(), Some(creds));
}

#[test]
fn generated_mac_is_stable_across_boots() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let first = StateStore::open(&path)
        .unwrap()
        .load_or_init_mac(|| "02:AA:BB:CC:DD:EE".to_string())
        .unwrap();
    let second = StateStore::open(&path)
        .unwrap()
        .load_or_init_mac(|| panic!("mac regenerated"))
        .unwrap();
    assert_eq!(first, "02:AA:BB:CC:DD:EE");
    assert_eq!(second, first);
}
