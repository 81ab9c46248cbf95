use binedit_core::{MemorySource, Repository, SegmentKind};
use pretty_assertions::assert_eq;

#[test]
fn test_write_through_document_copy_detaches_shared_bytes() {
    let mut repository = Repository::new();
    let id = repository.create_document();
    repository.document(id).unwrap().insert(0, b"shared").unwrap();

    let copy = repository.document(id).unwrap().copy().unwrap();
    repository.document(copy).unwrap().set_byte(0, b'S').unwrap();
    repository.document(id).unwrap().set_byte(5, b'D').unwrap();

    assert_eq!(repository.document(id).unwrap().read_all().unwrap(), b"shareD");
    assert_eq!(repository.document(copy).unwrap().read_all().unwrap(), b"Shared");
    repository.validate_indices().unwrap();
}

#[test]
fn test_copied_segment_is_independent_of_the_original() {
    let mut repository = Repository::new();
    let memory = repository.open_memory_source();
    repository.write_source(memory, 0, b"abcdef").unwrap();
    let original = repository.create_memory_segment(memory, 0, 6).unwrap();
    let copy = repository.copy_segment(original).unwrap();

    let id = repository.create_document();
    let mut document = repository.document(id).unwrap();
    document.insert_segment(0, copy).unwrap();
    document.replace(1, b"XY").unwrap();
    assert_eq!(document.read_all().unwrap(), b"aXYdef");

    let segment = repository.segment(original).unwrap();
    let mut bytes = [0; 6];
    repository
        .read_source(segment.source().unwrap(), segment.start().unwrap(), &mut bytes)
        .unwrap();
    assert_eq!(&bytes, b"abcdef");
}

#[test]
fn test_pasting_within_a_document_then_editing_one_copy() {
    let mut repository = Repository::new();
    let id = repository.create_document();
    let mut document = repository.document(id).unwrap();

    document.insert(0, b"0123").unwrap();
    document.insert_document(4, id, 0, 4).unwrap();
    document.set_byte(6, b'x').unwrap();

    assert_eq!(document.read_all().unwrap(), b"012301x3");
    document.validate().unwrap();
}

#[test]
fn test_overwriting_file_bytes_leaves_the_file_untouched() {
    let mut repository = Repository::new();
    let file = repository.register_source(MemorySource::from_vec(b"file".to_vec()));
    let id = repository.create_document_from(file).unwrap();

    let mut document = repository.document(id).unwrap();
    document.replace(0, b"FI").unwrap();
    let kinds: Vec<SegmentKind> = document.segments().iter().map(|s| s.kind()).collect();
    assert_eq!(kinds, vec![SegmentKind::Memory, SegmentKind::Source]);

    let mut bytes = [0; 4];
    repository.read_source(file, 0, &mut bytes).unwrap();
    assert_eq!(&bytes, b"file");
}

#[test]
fn test_private_sources_are_released_with_their_segments() {
    let mut repository = Repository::new();
    let id = repository.create_document();
    repository.document(id).unwrap().insert(0, b"abc").unwrap();
    let copy = repository.document(id).unwrap().copy().unwrap();
    let baseline = repository.source_count();

    // Detaching gives the copy a private source.
    repository.document(copy).unwrap().set_byte(1, b'B').unwrap();
    assert_eq!(repository.source_count(), baseline + 1);

    repository.dispose_document(id).unwrap();
    repository.document(copy).unwrap().clear();
    repository.dispose_document(copy).unwrap();
    assert_eq!(repository.source_count(), 0);
}
