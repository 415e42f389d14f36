#![cfg(feature = "serde")]

use std::collections::BTreeMap;

use syncmap::SyncMap;

#[test]
fn test_syncmap_serde_serialize() {
    let map: SyncMap<String, u32> = SyncMap::new();
    map.store("a".to_string(), 1);
    map.store("b".to_string(), 2);
    map.store("c".to_string(), 3);
    map.delete("c");

    let json = serde_json::to_string(&map).unwrap();
    // Order is unspecified, so compare through an ordered map.
    let back: BTreeMap<String, u32> = serde_json::from_str(&json).unwrap();
    assert_eq!(
        back,
        BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 2)])
    );
}

#[test]
fn test_syncmap_serde_deserialize() {
    let map: SyncMap<u64, String> =
        serde_json::from_str(r#"{"10": "ten", "20": "twenty"}"#).unwrap();
    assert_eq!(map.load(&10).as_deref(), Some("ten"));
    assert_eq!(map.load(&20).as_deref(), Some("twenty"));
    assert_eq!(map.load(&30), None);
    // Deserialised maps are built straight into the read snapshot.
    assert_eq!(map.stats().locked_ops, 0);

    let empty: SyncMap<u64, String> = serde_json::from_str("{}").unwrap();
    assert_eq!(format!("{:?}", empty), "{}");

    assert!(serde_json::from_str::<SyncMap<u64, String>>("[1, 2]").is_err());
}
