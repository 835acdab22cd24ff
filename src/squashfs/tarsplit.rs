//! Tar disassembly and byte-identical reassembly
//!
//! A gzip tar layer is opaque to a filesystem, so identical content never
//! deduplicates while it stays a blob. The splitter walks the raw 512-byte
//! blocks of a tar stream and produces two outputs: the regular-file
//! payloads extracted onto disk, and a recipe capturing every other byte
//! verbatim (headers, pax records, padding, trailer). Interleaving the
//! recipe with the extracted files reproduces the original tar stream bit
//! for bit.
//!
//! The recipe is a stream of JSON lines. A segment entry carries raw bytes
//! base64-encoded; a file entry references an extracted file by its
//! original member name and size.

use crate::error::{Result, TransmitError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufRead, Read, Write};
use std::path::{Component, Path, PathBuf};

const BLOCK_SIZE: usize = 512;

const KIND_FILE: u32 = 1;
const KIND_SEGMENT: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct RecipeEntry {
    #[serde(rename = "type")]
    kind: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    position: u64,
}

/// Fetches extracted file contents during reassembly.
pub trait FileGetter: Send + Sync {
    fn get(&self, name: &str) -> Result<Box<dyn Read + Send>>;
}

/// Getter over an extracted directory tree.
pub struct PathFileGetter {
    root: PathBuf,
}

impl PathFileGetter {
    pub fn new(root: impl Into<PathBuf>) -> PathFileGetter {
        PathFileGetter { root: root.into() }
    }
}

impl FileGetter for PathFileGetter {
    fn get(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.root.join(sanitize_member_path(name)?);
        Ok(Box::new(File::open(path)?))
    }
}

/// Split a tar stream: extract regular files and directories under
/// `out_dir`, write everything else into the recipe.
pub fn disassemble<R: Read, W: Write>(mut tar: R, mut recipe: W, out_dir: &Path) -> Result<()> {
    let mut position: u64 = 0;
    let mut segment: Vec<u8> = Vec::new();
    let mut long_name: Option<String> = None;
    let mut pax_path: Option<String> = None;
    let mut block = [0u8; BLOCK_SIZE];

    fs::create_dir_all(out_dir)?;

    loop {
        if !read_block(&mut tar, &mut block)? {
            break;
        }
        segment.extend_from_slice(&block);

        if block.iter().all(|&b| b == 0) {
            // end-of-archive marker blocks stay in the segment
            continue;
        }

        let typeflag = block[156];
        let size = parse_size(&block[124..136])?;

        match typeflag {
            // GNU long name / long link name: the data block carries the
            // name that applies to the next real header
            b'L' | b'K' => {
                let data = read_padded(&mut tar, size, &mut segment)?;
                if typeflag == b'L' {
                    long_name = Some(trim_nul(&data));
                }
            }
            // pax extended headers; the global flavor never renames
            b'x' | b'X' => {
                let data = read_padded(&mut tar, size, &mut segment)?;
                if let Some(path) = parse_pax_path(&data) {
                    pax_path = Some(path);
                }
            }
            b'g' => {
                read_padded(&mut tar, size, &mut segment)?;
            }
            // regular file: the payload leaves the recipe and lands on disk
            b'0' | 0 | b'7' => {
                let name = pax_path
                    .take()
                    .or_else(|| long_name.take())
                    .unwrap_or_else(|| header_name(&block));
                if size > 0 {
                    flush_segment(&mut recipe, &mut segment, &mut position)?;
                    write_recipe_line(
                        &mut recipe,
                        &RecipeEntry {
                            kind: KIND_FILE,
                            name: Some(name.clone()),
                            size: Some(size as i64),
                            payload: None,
                            position,
                        },
                    )?;
                    position += 1;
                    extract_file(&mut tar, size, out_dir, &name)?;
                    read_exact_into(&mut tar, pad_len(size), &mut segment)?;
                } else {
                    create_parent(out_dir, &name)?;
                    File::create(out_dir.join(sanitize_member_path(&name)?))?;
                }
            }
            b'5' => {
                let name = pax_path
                    .take()
                    .or_else(|| long_name.take())
                    .unwrap_or_else(|| header_name(&block));
                let rel = sanitize_member_path(&name)?;
                if !rel.as_os_str().is_empty() {
                    fs::create_dir_all(out_dir.join(rel))?;
                }
            }
            // links, devices, fifos and anything exotic live entirely in
            // the recipe, including any payload their header declares
            _ => {
                pax_path.take();
                long_name.take();
                if size > 0 {
                    read_padded(&mut tar, size, &mut segment)?;
                }
            }
        }
    }

    flush_segment(&mut recipe, &mut segment, &mut position)?;
    recipe.flush()?;
    Ok(())
}

/// Replay a recipe, interleaving raw segments with file contents from the
/// getter. The output equals the original tar stream byte for byte.
pub fn assemble<R: BufRead, W: Write>(recipe: R, getter: &dyn FileGetter, mut out: W) -> Result<()> {
    for line in recipe.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: RecipeEntry = serde_json::from_str(&line)
            .map_err(|e| TransmitError::Parse(format!("tar-split recipe line unreadable: {}", e)))?;
        match entry.kind {
            KIND_SEGMENT => {
                let payload = entry.payload.unwrap_or_default();
                let bytes = BASE64
                    .decode(payload.as_bytes())
                    .map_err(|e| TransmitError::Parse(format!("recipe payload corrupt: {}", e)))?;
                out.write_all(&bytes)?;
            }
            KIND_FILE => {
                let name = entry
                    .name
                    .ok_or_else(|| TransmitError::Parse("file entry without name".to_string()))?;
                let size = entry.size.unwrap_or(0);
                let mut reader = getter.get(&name)?;
                let copied = io::copy(&mut reader, &mut out)? as i64;
                if copied != size {
                    return Err(TransmitError::Integrity(format!(
                        "extracted file {} size mismatch, recipe: {}, disk: {}",
                        name, size, copied
                    )));
                }
            }
            other => {
                return Err(TransmitError::Parse(format!(
                    "unknown recipe entry type: {}",
                    other
                )));
            }
        }
    }
    out.flush()?;
    Ok(())
}

/// Strip the path down to safe relative components; `..` is rejected.
pub fn sanitize_member_path(name: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(TransmitError::Integrity(format!(
                    "unsafe member path in layer: {}",
                    name
                )));
            }
        }
    }
    Ok(out)
}

/// Read one block; false on clean EOF, error on a truncated block.
fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> Result<bool> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut block[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(TransmitError::Integrity(
                "truncated tar stream inside a block".to_string(),
            ));
        }
        filled += n;
    }
    Ok(true)
}

/// Append `len` raw bytes from the stream to `sink`.
fn read_exact_into<R: Read>(reader: &mut R, len: usize, sink: &mut Vec<u8>) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let start = sink.len();
    sink.resize(start + len, 0);
    reader.read_exact(&mut sink[start..])?;
    Ok(())
}

/// Consume a payload plus its padding into the segment buffer, returning
/// the unpadded payload.
fn read_padded<R: Read>(reader: &mut R, size: u64, segment: &mut Vec<u8>) -> Result<Vec<u8>> {
    let start = segment.len();
    read_exact_into(reader, size as usize + pad_len(size), segment)?;
    Ok(segment[start..start + size as usize].to_vec())
}

fn pad_len(size: u64) -> usize {
    ((BLOCK_SIZE as u64 - size % BLOCK_SIZE as u64) % BLOCK_SIZE as u64) as usize
}

fn flush_segment<W: Write>(recipe: &mut W, segment: &mut Vec<u8>, position: &mut u64) -> Result<()> {
    if segment.is_empty() {
        return Ok(());
    }
    let entry = RecipeEntry {
        kind: KIND_SEGMENT,
        name: None,
        size: None,
        payload: Some(BASE64.encode(&segment)),
        position: *position,
    };
    *position += 1;
    segment.clear();
    write_recipe_line(recipe, &entry)
}

fn write_recipe_line<W: Write>(recipe: &mut W, entry: &RecipeEntry) -> Result<()> {
    serde_json::to_writer(&mut *recipe, entry)?;
    recipe.write_all(b"\n")?;
    Ok(())
}

fn extract_file<R: Read>(reader: &mut R, size: u64, out_dir: &Path, name: &str) -> Result<()> {
    create_parent(out_dir, name)?;
    let path = out_dir.join(sanitize_member_path(name)?);
    let mut file = File::create(&path)?;
    let copied = io::copy(&mut reader.take(size), &mut file)?;
    if copied != size {
        return Err(TransmitError::Integrity(format!(
            "layer member {} truncated, header: {}, stream: {}",
            name, size, copied
        )));
    }
    Ok(())
}

fn create_parent(out_dir: &Path, name: &str) -> Result<()> {
    let rel = sanitize_member_path(name)?;
    if let Some(parent) = rel.parent() {
        fs::create_dir_all(out_dir.join(parent))?;
    }
    Ok(())
}

fn header_name(block: &[u8; BLOCK_SIZE]) -> String {
    let name = trim_nul(&block[0..100]);
    // ustar prefix field extends the name
    if &block[257..262] == b"ustar" {
        let prefix = trim_nul(&block[345..500]);
        if !prefix.is_empty() {
            return format!("{}/{}", prefix, name);
        }
    }
    name
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Octal size field, or GNU base-256 when the high bit is set.
fn parse_size(field: &[u8]) -> Result<u64> {
    if field[0] & 0x80 != 0 {
        let mut value: u64 = (field[0] & 0x7f) as u64;
        for &b in &field[1..] {
            value = value << 8 | b as u64;
        }
        return Ok(value);
    }
    let text = String::from_utf8_lossy(field);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|e| TransmitError::Integrity(format!("bad tar size field: {}", e)))
}

/// Extract the `path` record of a pax extended header. Records look like
/// `LEN key=value\n` with LEN counting the whole record.
fn parse_pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest.iter().position(|&b| b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space + 1 || len > rest.len() {
            return None;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            return Some(String::from_utf8_lossy(value).to_string());
        }
        rest = &rest[len..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    fn build_fixture_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_cksum();
        builder
            .append_data(&mut dir_header, "etc/", io::empty())
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(12);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/passwd", Cursor::new(b"root:x:0:0::".to_vec()))
            .unwrap();

        // long names force the GNU longname extension path
        let long = format!("deep/{}/leaf.txt", "d".repeat(120));
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, long.as_str(), Cursor::new(b"hello".to_vec()))
            .unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_cksum();
        builder
            .append_link(&mut link, "etc/alias", "etc/passwd")
            .unwrap();

        let mut empty = tar::Header::new_gnu();
        empty.set_size(0);
        empty.set_mode(0o644);
        empty.set_cksum();
        builder
            .append_data(&mut empty, "etc/empty", io::empty())
            .unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn test_disassemble_extracts_files() {
        let tar_bytes = build_fixture_tar();
        let dir = tempfile::tempdir().unwrap();
        let mut recipe = Vec::new();

        disassemble(Cursor::new(&tar_bytes), &mut recipe, dir.path()).unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("etc/passwd")).unwrap(),
            b"root:x:0:0::"
        );
        let long = format!("deep/{}/leaf.txt", "d".repeat(120));
        assert_eq!(std::fs::read(dir.path().join(&long)).unwrap(), b"hello");
        assert!(dir.path().join("etc/empty").exists());
        assert!(dir.path().join("etc").is_dir());
        // the symlink lives only in the recipe
        assert!(!dir.path().join("etc/alias").exists());
    }

    #[test]
    fn test_reassembly_is_byte_identical() {
        let tar_bytes = build_fixture_tar();
        let dir = tempfile::tempdir().unwrap();
        let mut recipe = Vec::new();
        disassemble(Cursor::new(&tar_bytes), &mut recipe, dir.path()).unwrap();

        let getter = PathFileGetter::new(dir.path());
        let mut rebuilt = Vec::new();
        assemble(BufReader::new(Cursor::new(recipe)), &getter, &mut rebuilt).unwrap();

        assert_eq!(rebuilt, tar_bytes);
    }

    #[test]
    fn test_assemble_detects_modified_file() {
        let tar_bytes = build_fixture_tar();
        let dir = tempfile::tempdir().unwrap();
        let mut recipe = Vec::new();
        disassemble(Cursor::new(&tar_bytes), &mut recipe, dir.path()).unwrap();

        std::fs::write(dir.path().join("etc/passwd"), b"tampered").unwrap();
        let getter = PathFileGetter::new(dir.path());
        let err = assemble(BufReader::new(Cursor::new(recipe)), &getter, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, TransmitError::Integrity(_)));
    }

    #[test]
    fn test_sanitize_member_path() {
        assert_eq!(
            sanitize_member_path("./etc/passwd").unwrap(),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            sanitize_member_path("/abs/name").unwrap(),
            PathBuf::from("abs/name")
        );
        assert!(sanitize_member_path("../escape").is_err());
    }

    #[test]
    fn test_parse_size_base256() {
        let mut field = [0u8; 12];
        field[0] = 0x80;
        field[10] = 0x01;
        field[11] = 0x00;
        assert_eq!(parse_size(&field).unwrap(), 256);
        assert_eq!(parse_size(b"00000000012\0").unwrap(), 10);
    }
}
