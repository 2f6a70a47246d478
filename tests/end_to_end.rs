use zipedit::checksum::{crc32, CRC32_SEED};
use zipedit::{
    AccessMode, Archive, CompressionMethod, EntryKind, EntryOptions, FileStore, ZipResult,
    DEFAULT_BUFFER_SIZE,
};

fn provider_over(data: Vec<u8>) -> impl FnMut(u64, usize) -> ZipResult<Vec<u8>> {
    move |position, count| {
        let start = position as usize;
        Ok(data[start..start + count].to_vec())
    }
}

fn verify(archive: &mut Archive<FileStore>, path: &str, expected: &[u8]) -> ZipResult<()> {
    let entry = archive.entry(path)?.expect("entry should exist");
    assert_eq!(entry.uncompressed_size(), expected.len() as u64);
    assert_eq!(entry.checksum(), crc32(CRC32_SEED, expected));

    let mut out = Vec::new();
    archive.extract(&entry, DEFAULT_BUFFER_SIZE, false, |chunk: &[u8]| {
        out.extend_from_slice(chunk);
        Ok(())
    })?;
    assert_eq!(out, expected);
    Ok(())
}

#[test]
fn build_reopen_and_verify() -> ZipResult<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("end_to_end.zip");

    let mut random = vec![0u8; 512 * 1024];
    getrandom::fill(&mut random).expect("rng");
    let text = b"a line of compressible text\n".repeat(4096);

    let mut archive = Archive::open(&path, AccessMode::Create)?;
    archive.add_entry(
        "data",
        0,
        &EntryOptions::new().kind(EntryKind::Directory),
        |_, _| Ok(Vec::new()),
    )?;
    archive.add_entry(
        "data/random.bin",
        random.len() as u64,
        &EntryOptions::new().compression_method(CompressionMethod::Stored),
        provider_over(random.clone()),
    )?;
    archive.add_entry(
        "data/text.txt",
        text.len() as u64,
        &EntryOptions::new(),
        provider_over(text.clone()),
    )?;
    archive.add_entry(
        "data/link",
        15,
        &EntryOptions::new().kind(EntryKind::Symlink),
        provider_over(b"data/random.bin".to_vec()),
    )?;
    drop(archive);

    let mut archive = Archive::open(&path, AccessMode::Read)?;
    assert_eq!(archive.total_entries(), 4);

    let paths = archive
        .entries()
        .map(|entry| Ok(entry?.path().into_owned()))
        .collect::<ZipResult<Vec<_>>>()?;
    assert_eq!(paths, ["data/", "data/random.bin", "data/text.txt", "data/link"]);

    let kinds = archive
        .entries()
        .map(|entry| Ok(entry?.kind()))
        .collect::<ZipResult<Vec<_>>>()?;
    assert_eq!(
        kinds,
        [
            EntryKind::Directory,
            EntryKind::File,
            EntryKind::File,
            EntryKind::Symlink
        ]
    );

    verify(&mut archive, "data/random.bin", &random)?;
    verify(&mut archive, "data/text.txt", &text)?;
    verify(&mut archive, "data/link", b"data/random.bin")?;
    Ok(())
}

#[test]
fn every_member_extracts_with_matching_checksum() -> ZipResult<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("checksums.zip");

    let mut archive = Archive::open(&path, AccessMode::Create)?;
    for i in 0..16u8 {
        let mut payload = vec![0u8; 4096 + i as usize * 97];
        getrandom::fill(&mut payload).expect("rng");
        let method = if i % 2 == 0 {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        archive.add_entry(
            &format!("member-{i:02}.bin"),
            payload.len() as u64,
            &EntryOptions::new().compression_method(method),
            provider_over(payload),
        )?;
    }
    drop(archive);

    let mut archive = Archive::open(&path, AccessMode::Read)?;
    let entries = archive.entries().collect::<ZipResult<Vec<_>>>()?;
    assert_eq!(entries.len(), 16);
    for entry in entries {
        let mut total = 0u64;
        // skip_crc32 = false makes extract verify the stored checksum.
        archive.extract(&entry, 1024, false, |chunk: &[u8]| {
            total += chunk.len() as u64;
            Ok(())
        })?;
        assert_eq!(total, entry.uncompressed_size());
    }
    Ok(())
}

#[test]
fn archive_comment_survives_mutation() -> ZipResult<()> {
    // Minimal empty archive with a comment, built byte by byte.
    let comment = b"nightly backup set";
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x06054b50u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 16]);
    bytes.extend_from_slice(&(comment.len() as u16).to_le_bytes());
    bytes.extend_from_slice(comment);

    let mut archive = Archive::from_vec(bytes, AccessMode::Update)?;
    assert_eq!(archive.comment(), comment);

    archive.add_entry(
        "file.txt",
        4,
        &EntryOptions::new(),
        provider_over(b"abcd".to_vec()),
    )?;
    assert_eq!(archive.comment(), comment);

    let mut reopened = Archive::from_vec(archive.into_vec(), AccessMode::Read)?;
    assert_eq!(reopened.comment(), comment);
    assert!(reopened.entry("file.txt")?.is_some());
    Ok(())
}
