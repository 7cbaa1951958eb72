#![no_main]

//! Arbitrary bytes fed to the snapshot importer. Garbage must come back
//! as an error and leave the store as it was.

use libfuzzer_sys::fuzz_target;

use quickdesk::storage::MemoryStorage;
use quickdesk::store::LocalStore;

fuzz_target!(|data: &[u8]| {
    let Ok(json) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(mut store) = LocalStore::open(MemoryStorage::new()) else {
        return;
    };
    let _ = store.initialize_data();
    let before = store.snapshot();

    if store.from_json(json).is_err() {
        assert_eq!(store.snapshot(), before);
        return;
    }

    // Whatever was accepted must survive a second round.
    if let Ok(again) = store.to_json() {
        assert!(store.from_json(&again).is_ok());
    }
});
