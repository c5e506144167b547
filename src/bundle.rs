use crate::block::{Blob, ObjectHash};
use crate::error::{ChronError, Result};
use crate::store::commit::Commit;
use crate::store::tree::Tree;
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::io::{Read, Write};

/// A standard git bundle: a textual ref list followed by a packfile (spec
/// §4.B / §6 — git-tooling interoperability is a design requirement, not a
/// Non-goal). `BundleManifest` is what `export_bundle`/`import_bundle`
/// return to their caller; it isn't written to the wire itself, the ref
/// list and pack header are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub format: String,
    pub created_at: DateTime<Utc>,
    /// Commit the export was taken relative to; `None` means a full export
    /// from the root. Objects already reachable from this commit are
    /// excluded from the pack (the bundle's prerequisite line).
    pub base_commit: Option<ObjectHash>,
    pub refs: Vec<(String, ObjectHash)>,
    /// SHA-256 of the pack section (the trailing checksum is this value's
    /// raw bytes, not its hex string).
    pub checksum: String,
}

const FORMAT: &str = "v2 git bundle";
const HEADER_LINE: &str = "# v2 git bundle";
const PACK_MAGIC: &[u8; 4] = b"PACK";
const PACK_VERSION: u32 = 2;
const CHECKSUM_LEN: usize = 32;

const OBJ_COMMIT: u8 = 1;
const OBJ_TREE: u8 = 2;
const OBJ_BLOB: u8 = 3;

fn invalid(reason: impl Into<String>) -> ChronError {
    ChronError::BundleInvalid {
        path: "<stream>".to_string(),
        reason: reason.into(),
    }
}

/// Collects every commit reachable from `head` by walking all parent edges
/// (not just first-parent, since merges must be fully included), stopping
/// at `boundary` (exclusive) if given.
fn reachable_commits(store: &ObjectStore, head: &ObjectHash, boundary: Option<&str>) -> Result<Vec<Commit>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut stack = vec![head.clone()];
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if Some(id.as_str()) == boundary {
            continue;
        }
        let commit = store.load_commit(&id)?;
        stack.extend(commit.parents.iter().cloned());
        out.push(commit);
    }
    Ok(out)
}

/// git's variable-length object header: the low 4 bits of the first byte
/// hold the low bits of the size, the high 3 bits the type, and each
/// continuation byte contributes 7 more size bits, little-endian.
fn encode_object_header(obj_type: u8, size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut remaining = size >> 4;
    let mut first = (obj_type << 4) | ((size & 0x0F) as u8);
    if remaining > 0 {
        first |= 0x80;
    }
    out.push(first);
    while remaining > 0 {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining > 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

fn decode_object_header(input: &[u8]) -> Result<(u8, usize, usize)> {
    if input.is_empty() {
        return Err(invalid("truncated object header"));
    }
    let first = input[0];
    let obj_type = (first >> 4) & 0x07;
    let mut size = (first & 0x0F) as usize;
    let mut shift = 4u32;
    let mut consumed = 1usize;
    let mut more = first & 0x80 != 0;
    while more {
        let byte = *input
            .get(consumed)
            .ok_or_else(|| invalid("truncated object header"))?;
        size |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
        more = byte & 0x80 != 0;
        consumed += 1;
    }
    Ok((obj_type, size, consumed))
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates one zlib stream starting at `input`'s front, stopping exactly at
/// that stream's end regardless of trailing bytes (the next object's data).
/// Returns the decompressed bytes and how many input bytes the stream
/// consumed, so the caller can advance past it.
fn zlib_decompress_one(input: &[u8], size_hint: usize) -> Result<(Vec<u8>, usize)> {
    let mut decompressor = Decompress::new(true);
    let mut output = vec![0u8; size_hint.max(16)];
    loop {
        let in_before = decompressor.total_in() as usize;
        let out_before = decompressor.total_out() as usize;
        if out_before == output.len() {
            output.resize(output.len() * 2 + 16, 0);
        }
        let status = decompressor
            .decompress(&input[in_before..], &mut output[out_before..], FlushDecompress::None)
            .map_err(|e| invalid(format!("zlib error: {}", e)))?;
        if status == Status::StreamEnd {
            break;
        }
        if decompressor.total_in() as usize == in_before && decompressor.total_out() as usize == out_before {
            return Err(invalid("zlib stream stalled before completion"));
        }
    }
    let produced = decompressor.total_out() as usize;
    output.truncate(produced);
    Ok((output, decompressor.total_in() as usize))
}

fn write_object(out: &mut Vec<u8>, obj_type: u8, value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_vec(value)?;
    out.extend_from_slice(&encode_object_header(obj_type, json.len()));
    out.extend_from_slice(&zlib_compress(&json)?);
    Ok(())
}

fn read_line(buf: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let rest = buf.get(start..).ok_or_else(|| invalid("unexpected EOF in bundle header"))?;
    let nl = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| invalid("unexpected EOF in bundle header"))?;
    *pos = start + nl + 1;
    Ok(String::from_utf8_lossy(&rest[..nl]).to_string())
}

/// Exports every commit (and the trees/blobs they reference) reachable from
/// `branches`, down to `base_commit` if given, as a git bundle: the textual
/// `# v2 git bundle` header, an optional `-<base>` prerequisite line, one
/// `<head> <branch>` ref line per branch, a blank terminator, then a `PACK`
/// section (git-style object headers, zlib-deflated JSON content per
/// object) and a trailing SHA-256 checksum. Returns the manifest describing
/// what was written.
pub fn export_bundle(
    store: &ObjectStore,
    branches: &[String],
    base_commit: Option<&str>,
    writer: &mut impl Write,
) -> Result<BundleManifest> {
    let mut refs = Vec::new();
    let mut all_commits = Vec::new();
    let mut commit_ids_seen = HashSet::new();

    for branch in branches {
        let head = store
            .head(branch)?
            .ok_or_else(|| ChronError::BranchNotFound(branch.clone()))?;
        refs.push((branch.clone(), head.clone()));
        for commit in reachable_commits(store, &head, base_commit)? {
            if commit_ids_seen.insert(commit.id.clone()) {
                all_commits.push(commit);
            }
        }
    }

    let mut tree_hashes = BTreeSet::new();
    let mut trees = Vec::new();
    let mut blob_hashes = BTreeSet::new();
    let mut blobs = Vec::new();

    for commit in &all_commits {
        if tree_hashes.insert(commit.tree_root.clone()) {
            let tree = store.load_tree_by_hash(&commit.tree_root)?;
            for (_, blob_hash) in tree.walk() {
                if blob_hashes.insert(blob_hash.clone()) {
                    blobs.push(store.load_blob(&blob_hash)?);
                }
            }
            trees.push(tree);
        }
    }

    writer.write_all(format!("{}\n", HEADER_LINE).as_bytes())?;
    if let Some(base) = base_commit {
        writer.write_all(format!("-{}\n", base).as_bytes())?;
    }
    for (branch, head) in &refs {
        writer.write_all(format!("{} {}\n", head, branch).as_bytes())?;
    }
    writer.write_all(b"\n")?;

    let object_count = (all_commits.len() + trees.len() + blobs.len()) as u32;
    let mut pack = Vec::new();
    pack.extend_from_slice(PACK_MAGIC);
    pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
    pack.extend_from_slice(&object_count.to_be_bytes());
    for commit in &all_commits {
        write_object(&mut pack, OBJ_COMMIT, commit)?;
    }
    for tree in &trees {
        write_object(&mut pack, OBJ_TREE, tree)?;
    }
    for blob in &blobs {
        write_object(&mut pack, OBJ_BLOB, blob)?;
    }

    let mut hasher = Sha256::new();
    hasher.update(&pack);
    let checksum = hasher.finalize();

    writer.write_all(&pack)?;
    writer.write_all(&checksum)?;

    Ok(BundleManifest {
        format: FORMAT.to_string(),
        created_at: Utc::now(),
        base_commit: base_commit.map(String::from),
        refs,
        checksum: format!("{:x}", checksum),
    })
}

/// Imports a bundle produced by `export_bundle`: parses the textual header
/// and ref list, verifies the pack's trailing checksum before writing
/// anything, then lands every object, then — only once the full object
/// graph is present — advances each ref. `force` controls whether an
/// existing local branch may be overwritten; without it, importing onto a
/// branch that already exists fails with `BranchExists`.
pub fn import_bundle(store: &ObjectStore, reader: &mut impl Read, force: bool) -> Result<BundleManifest> {
    let mut all = Vec::new();
    reader.read_to_end(&mut all)?;

    let mut pos = 0usize;
    let header = read_line(&all, &mut pos)?;
    if header != HEADER_LINE {
        return Err(invalid(format!("unrecognized bundle header: {}", header)));
    }

    let mut base_commit = None;
    let mut refs: Vec<(String, ObjectHash)> = Vec::new();
    loop {
        let line = read_line(&all, &mut pos)?;
        if line.is_empty() {
            break;
        }
        if let Some(base) = line.strip_prefix('-') {
            base_commit = Some(base.to_string());
        } else if let Some((head, branch)) = line.split_once(' ') {
            refs.push((branch.to_string(), head.to_string()));
        } else {
            return Err(invalid(format!("malformed ref line: {}", line)));
        }
    }

    let pack_start = pos;
    if all.len() < pack_start + 12 + CHECKSUM_LEN || &all[pack_start..pack_start + 4] != PACK_MAGIC {
        return Err(invalid("missing PACK section"));
    }
    let pack_end = all.len() - CHECKSUM_LEN;
    let expected_checksum = &all[pack_end..];

    let mut hasher = Sha256::new();
    hasher.update(&all[pack_start..pack_end]);
    let actual_checksum = hasher.finalize();
    if actual_checksum.as_slice() != expected_checksum {
        return Err(invalid("checksum mismatch"));
    }

    let mut cursor = pack_start + 4;
    let version = u32::from_be_bytes(all[cursor..cursor + 4].try_into().unwrap());
    cursor += 4;
    if version != PACK_VERSION {
        return Err(invalid(format!("unsupported pack version: {}", version)));
    }
    let object_count = u32::from_be_bytes(all[cursor..cursor + 4].try_into().unwrap());
    cursor += 4;

    let mut commits = Vec::new();
    let mut trees = Vec::new();
    let mut blobs = Vec::new();
    for _ in 0..object_count {
        let (obj_type, size, header_len) = decode_object_header(&all[cursor..pack_end])?;
        cursor += header_len;
        let (content, consumed) = zlib_decompress_one(&all[cursor..pack_end], size)?;
        cursor += consumed;
        match obj_type {
            OBJ_COMMIT => commits.push(serde_json::from_slice::<Commit>(&content)?),
            OBJ_TREE => trees.push(serde_json::from_slice::<Tree>(&content)?),
            OBJ_BLOB => blobs.push(serde_json::from_slice::<Blob>(&content)?),
            other => return Err(invalid(format!("unknown object type: {}", other))),
        }
    }

    if !force {
        for (branch, _) in &refs {
            if store.head(branch)?.is_some() {
                return Err(ChronError::BranchExists(branch.clone()));
            }
        }
    }

    for blob in &blobs {
        store.import_blob(blob)?;
    }
    for tree in &trees {
        store.import_tree(tree)?;
    }
    for commit in &commits {
        store.import_commit(commit)?;
    }
    for (branch, commit_id) in &refs {
        store.import_ref(branch, commit_id)?;
    }

    Ok(BundleManifest {
        format: FORMAT.to_string(),
        created_at: Utc::now(),
        base_commit,
        refs,
        checksum: format!("{:x}", actual_checksum),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn round_trips_a_single_branch() {
        let (_tmp1, source) = test_store();
        let d = Document::from_json(&serde_json::json!({"id": "user:1", "name": "Alice"})).unwrap();
        source.put_document("main", &d, "a", "a", "m", None).unwrap();

        let mut buf = Vec::new();
        export_bundle(&source, &["main".to_string()], None, &mut buf).unwrap();
        assert!(buf.starts_with(HEADER_LINE.as_bytes()));

        let (_tmp2, dest) = test_store();
        let manifest = import_bundle(&dest, &mut buf.as_slice(), false).unwrap();
        assert_eq!(manifest.refs.len(), 1);

        let got = dest.get_document("main", "user:1", None).unwrap().unwrap();
        assert_eq!(got.fields.get("name").unwrap().as_str(), Some("Alice"));
    }

    #[test]
    fn importing_onto_existing_branch_without_force_fails() {
        let (_tmp1, source) = test_store();
        let d = Document::from_json(&serde_json::json!({"id": "a", "_table": "x"})).unwrap();
        source.put_document("main", &d, "a", "a", "m", None).unwrap();
        let mut buf = Vec::new();
        export_bundle(&source, &["main".to_string()], None, &mut buf).unwrap();

        let (_tmp2, dest) = test_store();
        let existing = Document::from_json(&serde_json::json!({"id": "b", "_table": "x"})).unwrap();
        dest.put_document("main", &existing, "a", "a", "m", None).unwrap();

        let result = import_bundle(&dest, &mut buf.as_slice(), false);
        assert!(matches!(result, Err(ChronError::BranchExists(_))));
    }

    #[test]
    fn force_import_overwrites_existing_branch() {
        let (_tmp1, source) = test_store();
        let d = Document::from_json(&serde_json::json!({"id": "a", "_table": "x"})).unwrap();
        source.put_document("main", &d, "a", "a", "m", None).unwrap();
        let mut buf = Vec::new();
        export_bundle(&source, &["main".to_string()], None, &mut buf).unwrap();

        let (_tmp2, dest) = test_store();
        let existing = Document::from_json(&serde_json::json!({"id": "b", "_table": "x"})).unwrap();
        dest.put_document("main", &existing, "a", "a", "m", None).unwrap();

        import_bundle(&dest, &mut buf.as_slice(), true).unwrap();
        assert!(dest.get_document("main", "a", None).unwrap().is_some());
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let (_tmp1, source) = test_store();
        let d = Document::from_json(&serde_json::json!({"id": "a", "_table": "x"})).unwrap();
        source.put_document("main", &d, "a", "a", "m", None).unwrap();
        let mut buf = Vec::new();
        export_bundle(&source, &["main".to_string()], None, &mut buf).unwrap();

        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let (_tmp2, dest) = test_store();
        let result = import_bundle(&dest, &mut buf.as_slice(), false);
        assert!(matches!(result, Err(ChronError::BundleInvalid { .. })));
    }

    #[test]
    fn incremental_export_excludes_base_commit_ancestry() {
        let (_tmp1, source) = test_store();
        let d1 = Document::from_json(&serde_json::json!({"id": "a", "_table": "x"})).unwrap();
        source.put_document("main", &d1, "a", "a", "v1", None).unwrap();
        let base = source.head("main").unwrap().unwrap();

        let d2 = Document::from_json(&serde_json::json!({"id": "b", "_table": "x"})).unwrap();
        source.put_document("main", &d2, "a", "a", "v2", None).unwrap();

        let mut buf = Vec::new();
        let manifest = export_bundle(&source, &["main".to_string()], Some(&base), &mut buf).unwrap();
        assert_eq!(manifest.base_commit, Some(base));
    }

    #[test]
    fn ref_list_is_plain_text_before_the_pack_section() {
        let (_tmp1, source) = test_store();
        let d = Document::from_json(&serde_json::json!({"id": "a", "_table": "x"})).unwrap();
        source.put_document("main", &d, "a", "a", "m", None).unwrap();
        let mut buf = Vec::new();
        let manifest = export_bundle(&source, &["main".to_string()], None, &mut buf).unwrap();

        let pack_at = buf.windows(4).position(|w| w == PACK_MAGIC).unwrap();
        let header = String::from_utf8_lossy(&buf[..pack_at]);
        assert!(header.starts_with("# v2 git bundle\n"));
        assert!(header.contains(&format!(" main\n")));
        let head = manifest.refs[0].1.clone();
        assert!(header.contains(&format!("{} main", head)));
    }
}
