use libclock::Layout;

/// `Layout` is meant to be loaded the same way sibling configuration
/// structs in this codebase load their cache/memory shape from a config
/// file, rather than hand-assembled in code.
#[test]
fn layout_deserializes_from_json() {
    let json = r#"{
        "ways": 16,
        "tag_bits": 8,
        "clock_bits": 2,
        "cache_line_size": 64
    }"#;

    let layout: Layout = serde_json::from_str(json).unwrap();

    assert_eq!(layout, Layout::sixteen_way());
    assert_eq!(layout.value_alignment, None);
}

#[test]
fn layout_deserializes_with_explicit_value_alignment() {
    let json = r#"{
        "ways": 4,
        "tag_bits": 16,
        "clock_bits": 4,
        "cache_line_size": 128,
        "value_alignment": 32
    }"#;

    let layout: Layout = serde_json::from_str(json).unwrap();

    assert_eq!(layout.ways, 4);
    assert_eq!(layout.value_alignment, Some(32));
}
