//! Save-and-upload round trips at the archive level, no registry needed.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use image_transmit::archive::{ArchiveWriter, CompressedTarReader, CompressedTarWriter, Compressor};
use image_transmit::metadata::CompressionMetadata;
use image_transmit::registry::manifest::{patch_manifest, BlobInfo, Manifest};
use image_transmit::squashfs::SquashfsTar;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read, Write};
use std::sync::Mutex;

fn gzip_layer(files: &[(&str, &[u8])]) -> (Vec<u8>, String) {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, *name, Cursor::new(content.to_vec()))
            .unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::best());
    gz.write_all(&tar_bytes).unwrap();
    let gz = gz.finish().unwrap();
    let digest = hex::encode(Sha256::digest(&gz));
    (gz, digest)
}

/// Two images sharing a layer, saved by concurrent workers into parallel
/// writers: the shared digest lands in exactly one datafile and the
/// ledger credits both references.
#[test]
fn shared_layer_saved_once_across_parallel_writers() {
    let dir = tempfile::tempdir().unwrap();
    let meta = CompressionMetadata::new("tar");

    let writers: Vec<Mutex<CompressedTarWriter>> = (0..4)
        .map(|i| {
            let name = format!("work_{}.tar", i);
            meta.add_datafile(&name, 0);
            Mutex::new(CompressedTarWriter::new(dir.path().join(name), Compressor::Tar).unwrap())
        })
        .collect();

    let shared = BlobInfo {
        digest: "sha256:aaaa000000000000000000000000000000000000000000000000000000000000".into(),
        size: 6,
        media_type: "application/octet-stream".into(),
    };
    let images = [
        ("hub.x.io/ns/one:1", 0usize),
        ("hub.x.io/ns/two:1", 3usize),
    ];

    std::thread::scope(|scope| {
        for (reference, tid) in images {
            let meta = &meta;
            let writers = &writers;
            let shared = &shared;
            scope.spawn(move || {
                if meta.should_skip(shared.hex(), tid) {
                    meta.blob_shared(shared.hex(), reference);
                    return;
                }
                writers[tid]
                    .lock()
                    .unwrap()
                    .append_file_stream(
                        &shared.blob_filename(),
                        shared.size,
                        &mut Cursor::new(b"shared".to_vec()),
                    )
                    .unwrap();
                meta.blob_done(shared.hex(), reference);
            });
        }
    });

    for writer in &writers {
        writer.lock().unwrap().close().unwrap();
    }

    // exactly one datafile contains the digest
    let mut holders = 0;
    for (name, _) in meta.datafiles() {
        let reader =
            CompressedTarReader::new(&dir.path().join(&name), Compressor::Tar).unwrap();
        if reader
            .copy_blob_to(shared.hex(), &mut Vec::new())
            .unwrap()
            .is_some()
        {
            holders += 1;
        }
    }
    assert_eq!(holders, 1);

    // both references own the blob and the meta file round-trips
    assert_eq!(meta.blob_owners(shared.hex()).len(), 2);
    let meta_file = meta.save(dir.path(), "work").unwrap();
    let loaded = CompressionMetadata::load(&meta_file).unwrap();
    assert!(loaded.blob_exists(shared.hex()));
    loaded.verify_datafiles(dir.path()).unwrap();
}

/// The reservation holder fails before writing a byte while a sibling
/// image has already skipped and recorded its ownership. The retry pass
/// must fetch and write the blob anyway; the sibling's record alone must
/// never satisfy the dedup oracle.
#[test]
fn failed_writer_retries_fetch_despite_sibling_skip() {
    let dir = tempfile::tempdir().unwrap();
    let meta = CompressionMetadata::new("tar");
    meta.add_datafile("work_0.tar", 0);
    let mut writer =
        CompressedTarWriter::new(dir.path().join("work_0.tar"), Compressor::Tar).unwrap();

    let shared = BlobInfo {
        digest: "sha256:bbbb000000000000000000000000000000000000000000000000000000000000".into(),
        size: 6,
        media_type: "application/octet-stream".into(),
    };

    // first pass: worker 0 wins the reservation for image one
    assert!(!meta.should_skip(shared.hex(), 0));
    // worker 1 saves image two, sees the reservation and skips
    assert!(meta.should_skip(shared.hex(), 1));
    meta.blob_shared(shared.hex(), "hub.x.io/ns/two:1");

    // worker 0's fetch fails; task teardown releases the reservation and
    // the engine requeues the task
    meta.clear_doing(0);
    assert!(!meta.blob_exists(shared.hex()));

    // retry pass: the writer must not be pre-empted by the skip record
    assert!(!meta.should_skip(shared.hex(), 0));
    writer
        .append_file_stream(
            &shared.blob_filename(),
            shared.size,
            &mut Cursor::new(b"shared".to_vec()),
        )
        .unwrap();
    meta.blob_done(shared.hex(), "hub.x.io/ns/one:1");
    meta.clear_doing(0);
    writer.close().unwrap();

    // the blob is discoverable the way the upload task resolves it
    let reader = CompressedTarReader::new(&dir.path().join("work_0.tar"), Compressor::Tar).unwrap();
    let mut sink = Vec::new();
    let (name, size) = reader.copy_blob_to(shared.hex(), &mut sink).unwrap().unwrap();
    assert_eq!(name, shared.blob_filename());
    assert_eq!(size, shared.size);
    assert_eq!(sink, b"shared");

    // both images own the digest in the persisted ledger
    let meta_file = meta.save(dir.path(), "work").unwrap();
    let loaded = CompressionMetadata::load(&meta_file).unwrap();
    assert_eq!(
        loaded.blob_owners(shared.hex()),
        vec!["hub.x.io/ns/one:1", "hub.x.io/ns/two:1"]
    );
}

/// A layer that goes through disassembly and reassembly comes back as a
/// valid gzip tar with the same contents; when its gzip digest drifts the
/// manifest patch swaps exactly that layer's digest and size.
#[test]
fn squashfs_layer_drift_patches_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let store = SquashfsTar::new(dir.path(), "work", None).unwrap();

    let (gz, digest) = gzip_layer(&[
        ("app/server", b"binary bits"),
        ("app/config.toml", b"port = 8080"),
    ]);
    let original_tar = {
        let mut tar_bytes = Vec::new();
        GzDecoder::new(Cursor::new(&gz))
            .read_to_end(&mut tar_bytes)
            .unwrap();
        tar_bytes
    };
    let layer = BlobInfo {
        digest: format!("sha256:{}", digest),
        size: gz.len() as i64,
        media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".into(),
    };

    store
        .append_file_stream(&layer.blob_filename(), layer.size, Cursor::new(gz))
        .unwrap();

    // hash pass, the way the upload task measures drift
    let mut reassembled = Vec::new();
    store
        .get_file_stream(layer.hex())
        .unwrap()
        .read_to_end(&mut reassembled)
        .unwrap();
    let new_digest = format!("sha256:{}", hex::encode(Sha256::digest(&reassembled)));
    let new_size = reassembled.len() as i64;

    // contents survive even though the gzip envelope may differ
    let mut rebuilt_tar = Vec::new();
    GzDecoder::new(Cursor::new(&reassembled))
        .read_to_end(&mut rebuilt_tar)
        .unwrap();
    assert_eq!(rebuilt_tar, original_tar);

    let manifest_text = format!(
        r#"{{"schemaVersion":2,"config":{{"mediaType":"application/vnd.docker.container.image.v1+json","size":100,"digest":"sha256:cfg"}},"layers":[{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","size":{},"digest":"{}"}}]}}"#,
        layer.size, layer.digest
    );

    if new_digest != layer.digest {
        let patched = patch_manifest(&manifest_text, &layer, &new_digest, new_size).unwrap();
        let m = Manifest::parse(patched.as_bytes()).unwrap();
        assert_eq!(m.layers[0].digest, new_digest);
        assert_eq!(m.layers[0].size, new_size);
        assert_eq!(m.config.digest, "sha256:cfg");
    } else {
        // byte-identical reassembly needs no patch; the manifest parses
        // unchanged
        let m = Manifest::parse(manifest_text.as_bytes()).unwrap();
        assert_eq!(m.layers[0].digest, layer.digest);
    }
}
