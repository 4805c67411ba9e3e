use kiosk_player_rs::DeviceIdentityStore;

#[test]
fn identity_is_created_once_and_stable_across_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device-identity.json");
    let missing = dir.path().join("missing");

    let store = DeviceIdentityStore::new(&path).with_sources(&missing, &missing, &missing);
    let first = store.get_or_create();
    assert!(!first.id.is_empty());
    assert!(path.exists());

    // immediately re-running returns the identical id
    let second = store.get_or_create();
    assert_eq!(first.id, second.id);
    assert_eq!(first.created_at, second.created_at);

    // a fresh store over the same file also agrees
    let third = DeviceIdentityStore::new(&path)
        .with_sources(&missing, &missing, &missing)
        .get_or_create();
    assert_eq!(first.id, third.id);
}

#[test]
fn identity_file_is_read_only_and_carries_a_warning_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device-identity.json");
    let missing = dir.path().join("missing");

    DeviceIdentityStore::new(&path)
        .with_sources(&missing, &missing, &missing)
        .get_or_create();

    let metadata = std::fs::metadata(&path).unwrap();
    assert!(metadata.permissions().readonly());

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.starts_with('#'));
    assert!(raw.contains("DO NOT EDIT"));
}

#[test]
fn hardware_serial_wins_over_machine_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device-identity.json");
    let cpuinfo = dir.path().join("cpuinfo");
    let machine_id = dir.path().join("machine-id");
    let missing = dir.path().join("missing");

    std::fs::write(
        &cpuinfo,
        "processor\t: 0\nmodel name\t: ARMv8\nSerial\t\t: 10000000abcd1234\n",
    )
    .unwrap();
    std::fs::write(&machine_id, "ffffffffffffffffffffffffffffffff\n").unwrap();

    let identity = DeviceIdentityStore::new(&path)
        .with_sources(&cpuinfo, &missing, &machine_id)
        .get_or_create();
    assert_eq!(identity.id, "10000000abcd1234");
}

#[test]
fn machine_id_is_the_fallback_when_no_serial_exists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device-identity.json");
    let cpuinfo = dir.path().join("cpuinfo");
    let machine_id = dir.path().join("machine-id");
    let missing = dir.path().join("missing");

    // x86-style cpuinfo has no Serial line
    std::fs::write(&cpuinfo, "processor\t: 0\nvendor_id\t: GenuineIntel\n").unwrap();
    std::fs::write(&machine_id, "0123456789abcdef0123456789abcdef\n").unwrap();

    let identity = DeviceIdentityStore::new(&path)
        .with_sources(&cpuinfo, &missing, &machine_id)
        .get_or_create();
    assert_eq!(identity.id, "0123456789abcdef0123456789abcdef");
}

#[test]
fn corrupt_identity_file_is_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device-identity.json");
    let machine_id = dir.path().join("machine-id");
    let missing = dir.path().join("missing");

    std::fs::write(&path, "# header only, no body\n").unwrap();
    std::fs::write(&machine_id, "5555\n").unwrap();

    let identity = DeviceIdentityStore::new(&path)
        .with_sources(&missing, &missing, &machine_id)
        .get_or_create();
    assert_eq!(identity.id, "5555");
}
