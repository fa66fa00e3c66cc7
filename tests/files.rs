use std::io::Write;

use magheap::{
    error::FromFileError,
    heap::{BlockState, Granule},
    inspect::Inspector,
    layout::{layout_for, Architecture, LayoutCatalog, LinkEncoding, SizeClass},
    source::{MemorySource, Snapshot},
    synth::{compact_layout, HeapImage},
};
use pretty_assertions::assert_eq;

#[test]
fn snapshots_survive_a_file_round_trip() {
    let layout = compact_layout(layout_for(Architecture::X86_64, 8).unwrap(), 256);
    let mut image = HeapImage::new(&layout);
    let zone = image.zone(0x10_0000, Some("DefaultMallocZone"));
    image.magazines(&zone, SizeClass::Tiny, 1, 0x30_0000);
    image.region(SizeClass::Tiny, 0x1000, 0);
    image.link_regions(&zone, SizeClass::Tiny, 0, &[0x1000]);
    image.mark(SizeClass::Tiny, 0x1000, 5, 1, Granule::InUse);
    let snapshot = image.finish();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heap.json");
    snapshot.write_to_file(&path).unwrap();
    let loaded = Snapshot::from_file(&path).unwrap();
    assert_eq!(loaded, snapshot);
    assert_eq!(loaded.segments().collect::<Vec<_>>(), snapshot.segments().collect::<Vec<_>>());

    let inspector = Inspector::new(&loaded, &layout);
    let zone = inspector.zone(0x10_0000).unwrap();
    let resolution = inspector.resolve(&zone, 0x1050).unwrap();
    assert_eq!(resolution.block().map(|b| b.state), Some(BlockState::InUse));
}

#[test]
fn hand_written_snapshots_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"segments": [{{"address": "0x1000", "bytes": "efbeadde"}}, {{"address": "0x1004", "bytes": "01"}}]}}"#
    )
    .unwrap();
    let snapshot = Snapshot::from_file(file.path()).unwrap();
    assert_eq!(snapshot.read_u32(0x1000).unwrap(), 0xdead_beef);
    assert_eq!(snapshot.read(0x1004, 1).unwrap(), vec![1]);
    assert_eq!(snapshot.segments().collect::<Vec<_>>(), vec![0x1000..0x1005]);
}

#[test]
fn broken_snapshot_files_are_errors() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"segments": [{{"address": "0x1000", "bytes": "xyz"}}]}}"#).unwrap();
    assert!(matches!(
        Snapshot::from_file(file.path()),
        Err(FromFileError::SerdeJsonError(_))
    ));
    assert!(matches!(
        Snapshot::from_file("/nonexistent/heap.json"),
        Err(FromFileError::IoError(_))
    ));
}

#[test]
fn extra_layouts_load_from_json() {
    let mut plain = layout_for(Architecture::Aarch64, 8).unwrap().clone();
    plain.version = 9;
    plain.free_node.link_encoding = LinkEncoding::Plain;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&serde_json::to_vec(&[&plain]).unwrap()).unwrap();

    let mut catalog = LayoutCatalog::builtin().clone();
    assert_eq!(catalog.load_file(file.path()).unwrap(), 1);
    let snapshot = Snapshot::new();
    let inspector = Inspector::for_target(&snapshot, &catalog, Architecture::Aarch64, 9).unwrap();
    assert_eq!(inspector.layout().free_node.link_encoding, LinkEncoding::Plain);
    assert!(Inspector::for_target(&snapshot, &catalog, Architecture::Aarch64, 10).is_err());
}

#[test]
fn segments_that_wrap_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"segments": [{{"address": "0xfffffffffffffffe", "bytes": "00112233"}}]}}"#
    )
    .unwrap();
    match Snapshot::from_file(file.path()) {
        Err(FromFileError::WrappingSegment { address }) => assert_eq!(address, 0xffff_ffff_ffff_fffe),
        other => panic!("expected a wrapping segment error, got {other:?}"),
    }
}
