//! Save validation
//!
//! Saves documents whose segments read from the very file they are written to and checks the
//! file afterwards, including files shared with other open documents.

use binedit_core::{
    ByteSource, DocumentId, FileSource, MemorySource, Repository, RepositoryConfig,
    RepositoryError, SegmentKind, SourceId,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn source_bytes(repository: &mut Repository, source: SourceId) -> Vec<u8> {
    let mut bytes = vec![0; repository.source_length(source).unwrap() as usize];
    repository.read_source(source, 0, &mut bytes).unwrap();
    bytes
}

fn open(repository: &mut Repository, bytes: &[u8]) -> (SourceId, DocumentId) {
    let file = repository.register_source(MemorySource::from_vec(bytes.to_vec()));
    let id = repository.create_document_from(file).unwrap();
    (file, id)
}

fn assert_saved(repository: &mut Repository, file: SourceId, id: DocumentId, expected: &[u8]) {
    assert_eq!(source_bytes(repository, file), expected);
    let mut document = repository.document(id).unwrap();
    assert_eq!(document.read_all().unwrap(), expected);
    assert_eq!(document.segment_count(), usize::from(!expected.is_empty()));
    if let Some(segment) = document.segments().first() {
        assert_eq!(segment.kind(), SegmentKind::Source);
    }
    document.validate().unwrap();
    repository.validate_indices().unwrap();
}

#[test]
fn test_save_unmodified_document_writes_nothing() {
    let mut repository = Repository::new();
    let (file, id) = open(&mut repository, b"unchanged");
    repository.document(id).unwrap().save().unwrap();
    assert_saved(&mut repository, file, id, b"unchanged");
}

#[test]
fn test_save_self_overlapping_copy() {
    let mut repository = Repository::new();
    let (file, id) = open(&mut repository, b"0123456789");

    let mut document = repository.document(id).unwrap();
    document.insert_document(0, id, 5, 5).unwrap();
    document.save().unwrap();

    assert_saved(&mut repository, file, id, b"567890123456789");
}

#[test]
fn test_save_insert_at_front_shifts_file_right() {
    // Small blocks force the shifted segment to be copied back to front in several steps.
    let config = RepositoryConfig::default().with_buffer_size(3);
    let mut repository = Repository::with_config(config);
    let original: Vec<u8> = (0..40).collect();
    let (file, id) = open(&mut repository, &original);

    repository.document(id).unwrap().insert(0, b"head").unwrap();
    repository.save_document(id).unwrap();

    let mut expected = b"head".to_vec();
    expected.extend_from_slice(&original);
    assert_saved(&mut repository, file, id, &expected);
}

#[test]
fn test_save_truncates_file() {
    let mut repository = Repository::new();
    let (file, id) = open(&mut repository, b"keep-drop-keep");

    repository.document(id).unwrap().remove(4, 6).unwrap();
    repository.save_document(id).unwrap();
    assert_saved(&mut repository, file, id, b"keepkeep");

    repository.document(id).unwrap().clear();
    repository.save_document(id).unwrap();
    assert_saved(&mut repository, file, id, b"");
}

#[test]
fn test_save_random_edits_with_small_chunks() {
    let mut rng = StdRng::seed_from_u64(42);

    for round in 0..20 {
        let config = RepositoryConfig::default()
            .with_buffer_size(rng.gen_range(1..9))
            .with_save_chunk_size(rng.gen_range(1..17));
        let mut repository = Repository::with_config(config);
        let original: Vec<u8> = (0..256).map(|_| rng.r#gen()).collect();
        let (file, id) = open(&mut repository, &original);
        let mut reference = original;

        let mut document = repository.document(id).unwrap();
        for _ in 0..30 {
            let length = reference.len();
            match rng.gen_range(0..3) {
                0 if length > 0 => {
                    // Move a block of the file somewhere else.
                    let from = rng.gen_range(0..length);
                    let count = rng.gen_range(1..=(length - from).min(48));
                    let position = rng.gen_range(0..=length);
                    document
                        .insert_document(position as u64, id, from as u64, count as u64)
                        .unwrap();
                    let block = reference[from..from + count].to_vec();
                    reference.splice(position..position, block);

                    let removed = if position <= from { from + count } else { from };
                    document.remove(removed as u64, count as u64).unwrap();
                    reference.drain(removed..removed + count);
                }
                1 if length > 0 => {
                    let position = rng.gen_range(0..length);
                    let count = rng.gen_range(0..=(length - position).min(20));
                    document.remove(position as u64, count as u64).unwrap();
                    reference.drain(position..position + count);
                }
                _ => {
                    let position = rng.gen_range(0..=length);
                    let data: Vec<u8> = (0..rng.gen_range(1..10)).map(|_| rng.r#gen()).collect();
                    document.insert(position as u64, &data).unwrap();
                    reference.splice(position..position, data);
                }
            }
        }
        assert_eq!(document.read_all().unwrap(), reference, "round {round}");
        document.save().unwrap();

        assert_saved(&mut repository, file, id, &reference);
    }
}

#[test]
fn test_save_keeps_sibling_documents_intact() {
    let mut repository = Repository::with_config(RepositoryConfig::default().with_save_chunk_size(3));
    let original = b"abcdefghijklmnopqrstuvwxyz".to_vec();
    let (file, id) = open(&mut repository, &original);

    // The sibling mixes untouched file ranges with its own edits.
    let sibling = repository.create_document_from(file).unwrap();
    {
        let mut document = repository.document(sibling).unwrap();
        document.insert(10, b"--").unwrap();
        document.remove(20, 3).unwrap();
    }
    let sibling_before = repository.document(sibling).unwrap().read_all().unwrap();

    {
        let mut document = repository.document(id).unwrap();
        document.remove(0, 5).unwrap();
        document.insert_document(10, id, 0, 8).unwrap();
        document.insert(3, b"1234").unwrap();
        document.save().unwrap();
    }

    let mut sibling_document = repository.document(sibling).unwrap();
    assert_eq!(sibling_document.read_all().unwrap(), sibling_before);
    sibling_document.validate().unwrap();
    repository.validate_indices().unwrap();

    // The sibling can itself be saved afterwards.
    repository.save_document(sibling).unwrap();
    assert_saved(&mut repository, file, sibling, &sibling_before);
}

#[test]
fn test_save_document_copy_of_file_is_unaffected() {
    let mut repository = Repository::new();
    let (file, id) = open(&mut repository, b"0123456789");
    let copy = repository.document(id).unwrap().copy_range(0, 5).unwrap();

    let mut document = repository.document(id).unwrap();
    document.remove(0, 6).unwrap();
    document.save().unwrap();

    assert_eq!(source_bytes(&mut repository, file), b"6789");
    let mut copied = repository.document(copy).unwrap();
    assert_eq!(copied.read_all().unwrap(), b"0123456789");
}

#[test]
fn test_save_to_file_source() {
    let mut temp = tempfile::NamedTempFile::new().unwrap();
    temp.write_all(b"The quick brown fox").unwrap();
    temp.flush().unwrap();

    let mut repository = Repository::new();
    let source = FileSource::open(temp.path()).unwrap().with_block_size(4);
    let file = repository.register_source(source);
    let id = repository.create_document_from(file).unwrap();

    let mut document = repository.document(id).unwrap();
    document.remove(4, 6).unwrap();
    document.insert(4, b"slow ").unwrap();
    document.insert_document(0, id, 9, 5).unwrap();
    assert_eq!(document.read_all().unwrap(), b"brownThe slow brown fox");
    document.save().unwrap();

    assert_saved(&mut repository, file, id, b"brownThe slow brown fox");
    assert_eq!(
        std::fs::read(temp.path()).unwrap(),
        b"brownThe slow brown fox"
    );
}

#[test]
fn test_save_from_another_source() {
    let mut repository = Repository::new();
    let (file, id) = open(&mut repository, b"target");
    let other = repository.register_source(MemorySource::from_vec(b"OTHER".to_vec()));
    let key = repository.create_source_segment(other, 1, 3).unwrap();

    let mut document = repository.document(id).unwrap();
    document.insert_segment(0, key).unwrap();
    document.save().unwrap();

    assert_saved(&mut repository, file, id, b"THEtarget");
    assert_eq!(source_bytes(&mut repository, other), b"OTHER");
}

#[test]
fn test_save_requirements() {
    let mut repository = Repository::new();
    let scratch = repository.create_document();
    assert!(matches!(
        repository.save_document(scratch),
        Err(RepositoryError::NoOrigin(_))
    ));

    let (_, id) = open(&mut repository, b"abc");
    repository.dispose_document(id).unwrap();
    assert!(matches!(
        repository.save_document(id),
        Err(RepositoryError::DocumentNotFound(_))
    ));
}

#[test]
fn test_save_frees_the_insert_buffer() {
    let mut repository = Repository::new();
    let (file, id) = open(&mut repository, &[7; 16]);
    let before = repository.source_count();

    let mut document = repository.document(id).unwrap();
    for _ in 0..64 {
        document.insert(8, &[1; 16 * 1024]).unwrap();
        document.remove(8, 16 * 1024).unwrap();
    }
    document.insert(16, &[2; 1024 * 1024]).unwrap();
    document.save().unwrap();
    assert_eq!(repository.source_count(), before);

    // Later edits get a fresh buffer, which a clear releases again.
    let mut document = repository.document(id).unwrap();
    document.insert(0, b"new").unwrap();
    assert_eq!(document.get_byte(2).unwrap(), b'w');
    document.clear();
    assert_eq!(repository.source_count(), before);
    assert_eq!(repository.source_length(file).unwrap(), 16 + 1024 * 1024);
}

#[test]
fn test_save_hands_shared_insert_buffer_to_its_last_reader() {
    let mut repository = Repository::new();
    let (file, id) = open(&mut repository, b"file");
    repository.document(id).unwrap().insert(0, b"typed").unwrap();
    let copy = repository.document(id).unwrap().copy_range(0, 5).unwrap();
    let before = repository.source_count();

    repository.save_document(id).unwrap();
    assert_eq!(repository.source_count(), before);
    assert_eq!(
        repository.document(copy).unwrap().read_all().unwrap(),
        b"typed"
    );

    repository.dispose_document(copy).unwrap();
    assert_eq!(repository.source_count(), before - 1);
    assert_saved(&mut repository, file, id, b"typedfile");
}

/// Memory-backed source whose reads can be made to fail.
#[derive(Debug)]
struct FlakySource {
    data: MemorySource,
    failing: Arc<AtomicBool>,
}

impl ByteSource for FlakySource {
    fn length(&self) -> u64 {
        self.data.length()
    }

    fn set_length(&mut self, length: u64) -> io::Result<()> {
        self.data.set_length(length)
    }

    fn read(&mut self, position: u64, buffer: &mut [u8]) -> io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("read failure"));
        }
        self.data.read(position, buffer)
    }

    fn write(&mut self, position: u64, data: &[u8]) -> io::Result<()> {
        self.data.write(position, data)
    }
}

#[test]
fn test_failed_sibling_preload_leaves_documents_untouched() {
    let failing = Arc::new(AtomicBool::new(false));
    let mut repository = Repository::new();
    let file = repository.register_source(FlakySource {
        data: MemorySource::from_vec(b"0123456789abcdef".to_vec()),
        failing: Arc::clone(&failing),
    });
    let id = repository.create_document_from(file).unwrap();
    let siblings: Vec<DocumentId> = (0..3)
        .map(|_| repository.create_document_from(file).unwrap())
        .collect();
    repository.document(siblings[1]).unwrap().remove(2, 3).unwrap();

    let mut expected = Vec::new();
    for &sibling in &siblings {
        expected.push(repository.document(sibling).unwrap().read_all().unwrap());
    }
    let sources = repository.source_count();

    // Dropping the front forces every sibling to preload it.
    repository.document(id).unwrap().remove(0, 6).unwrap();
    let records_after_edit = repository.source_segment_count(file).unwrap();
    failing.store(true, Ordering::SeqCst);
    assert!(matches!(
        repository.save_document(id),
        Err(RepositoryError::Io(_))
    ));
    failing.store(false, Ordering::SeqCst);

    assert_eq!(repository.source_segment_count(file).unwrap(), records_after_edit);
    assert_eq!(repository.source_count(), sources);
    repository.validate_indices().unwrap();
    for (&sibling, bytes) in siblings.iter().zip(&expected) {
        let mut document = repository.document(sibling).unwrap();
        assert_eq!(&document.read_all().unwrap(), bytes);
        document.validate().unwrap();
    }

    repository.save_document(id).unwrap();
    assert_saved(&mut repository, file, id, b"6789abcdef");
    for (&sibling, bytes) in siblings.iter().zip(&expected) {
        assert_eq!(&repository.document(sibling).unwrap().read_all().unwrap(), bytes);
    }
}

/// One random edit on `id`, mirrored on `reference`.
fn random_edit(
    rng: &mut StdRng,
    repository: &mut Repository,
    id: DocumentId,
    reference: &mut Vec<u8>,
) {
    let mut document = repository.document(id).unwrap();
    let length = reference.len();
    match rng.gen_range(0..5) {
        0 if length > 0 => {
            let position = rng.gen_range(0..length);
            let count = rng.gen_range(0..=(length - position).min(24));
            document.remove(position as u64, count as u64).unwrap();
            reference.drain(position..position + count);
        }
        1 if length > 0 => {
            let position = rng.gen_range(0..length);
            let value: u8 = rng.r#gen();
            document.set_byte(position as u64, value).unwrap();
            reference[position] = value;
        }
        2 if length > 0 => {
            let from = rng.gen_range(0..length);
            let count = rng.gen_range(1..=(length - from).min(32));
            let position = rng.gen_range(0..=length);
            document
                .insert_document(position as u64, id, from as u64, count as u64)
                .unwrap();
            let block = reference[from..from + count].to_vec();
            reference.splice(position..position, block);
        }
        _ => {
            let position = rng.gen_range(0..=length);
            let data: Vec<u8> = (0..rng.gen_range(1..12)).map(|_| rng.r#gen()).collect();
            document.insert(position as u64, &data).unwrap();
            reference.splice(position..position, data);
        }
    }
}

#[test]
fn test_random_edits_and_saves_across_sibling_documents() {
    let mut rng = StdRng::seed_from_u64(0xb1ed);

    for round in 0..40 {
        let config = RepositoryConfig::default()
            .with_buffer_size(rng.gen_range(1..9))
            .with_save_chunk_size(rng.gen_range(1..33));
        let mut repository = Repository::with_config(config);
        let original: Vec<u8> = (0..rng.gen_range(1..200)).map(|_| rng.r#gen()).collect();
        let (file, first) = open(&mut repository, &original);

        let mut documents = vec![first];
        for _ in 0..3 {
            documents.push(repository.create_document_from(file).unwrap());
        }
        let mut references = vec![original; documents.len()];

        for step in 0..60 {
            let which = rng.gen_range(0..documents.len());
            if rng.gen_ratio(1, 8) {
                repository.save_document(documents[which]).unwrap();
                assert_eq!(
                    source_bytes(&mut repository, file),
                    references[which],
                    "round {round} step {step}"
                );
            } else {
                random_edit(&mut rng, &mut repository, documents[which], &mut references[which]);
            }

            for (&id, reference) in documents.iter().zip(&references) {
                let mut document = repository.document(id).unwrap();
                assert_eq!(&document.read_all().unwrap(), reference, "round {round} step {step}");
                document.validate().unwrap();
            }
            repository.validate_indices().unwrap();
        }
    }
}

