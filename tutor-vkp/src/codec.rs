//! Build, canonical-serialize, checksum, compare, and diff VKPs
//! (`spec.md` §4.6.1).
//!
//! Canonical serialization for checksums: every field except `checksum`
//! itself, object
//! keys in lexicographic order (the default for `serde_json`'s `BTreeMap`-
//! backed `Value::Object` when the `preserve_order` feature is off, which
//! this workspace does not enable), and every floating-point number
//! replaced by its IEEE-754 bit pattern as a hex string — so the hash never
//! drifts with locale, platform `f64`-formatting quirks, or `-0.0` vs `0.0`.

use crate::types::{CatalogEntry, Vkp, VkpChunk, VkpDelta, VkpMetadata, VersionOrder};
use semver::Version;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tutor_types::{Result, TutorError};

/// Builds a [`Vkp`] from metadata and chunks, filling `total_chunks` and the
/// checksum, after checking the structural invariants from `spec.md` §3.
///
/// # Errors
/// Returns [`TutorError::Validation`] if chunk ids are not unique, or if any
/// embedding's dimension doesn't match the first chunk's (the declared
/// model dimension).
pub fn build(mut metadata: VkpMetadata, chunks: Vec<VkpChunk>) -> Result<Vkp> {
    validate_structure(&chunks)?;
    metadata.total_chunks = chunks.len();
    let mut vkp = Vkp {
        metadata,
        chunks,
        checksum: String::new(),
    };
    vkp.checksum = checksum(&vkp);
    Ok(vkp)
}

fn validate_structure(chunks: &[VkpChunk]) -> Result<()> {
    let mut seen = HashSet::with_capacity(chunks.len());
    let mut dimension = None;
    for chunk in chunks {
        if !seen.insert(chunk.chunk_id.as_str()) {
            return Err(TutorError::Validation(format!(
                "duplicate chunk id: {}",
                chunk.chunk_id
            )));
        }
        match dimension {
            None => dimension = Some(chunk.embedding.len()),
            Some(d) if d != chunk.embedding.len() => {
                return Err(TutorError::Validation(format!(
                    "chunk {} embedding dimension {} does not match declared dimension {d}",
                    chunk.chunk_id,
                    chunk.embedding.len()
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// SHA-256 over the canonical serialization of every field except
/// `checksum`, formatted as `"sha256:"` + lowercase hex (`spec.md` §6).
#[must_use]
pub fn checksum(vkp: &Vkp) -> String {
    let canonical = canonical_bytes(&vkp.metadata, &vkp.chunks);
    let digest = Sha256::digest(&canonical);
    format!("sha256:{digest:x}")
}

fn canonical_bytes(metadata: &VkpMetadata, chunks: &[VkpChunk]) -> Vec<u8> {
    let raw = serde_json::json!({
        "metadata": {
            "version": metadata.version.to_string(),
            "subject_id": metadata.subject_id,
            "grade": metadata.grade.as_u8(),
            "semester": metadata.semester,
            "created_at": metadata.created_at.to_rfc3339(),
            "embedding_model_id": metadata.embedding_model_id,
            "chunk_size_tokens": metadata.chunk_size_tokens,
            "chunk_overlap_tokens": metadata.chunk_overlap_tokens,
            "total_chunks": metadata.total_chunks,
            "source_files": metadata.source_files,
        },
        "chunks": chunks.iter().map(|c| serde_json::json!({
            "chunk_id": c.chunk_id,
            "text": c.text,
            "embedding": c.embedding.iter().map(|f| format!("f32:{:08x}", f.to_bits())).collect::<Vec<_>>(),
            "metadata": c.metadata,
        })).collect::<Vec<_>>(),
    });
    let canonical = canonicalize_json(&raw);
    serde_json::to_vec(&canonical).unwrap_or_default()
}

/// Recursively sorts object keys (already the default for this workspace's
/// `serde_json::Value`) and replaces every `Number` with a tagged string so
/// integers and floats hash identically across platforms.
fn canonicalize_json(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => value.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::String(format!("i64:{i}"))
            } else if let Some(u) = n.as_u64() {
                Value::String(format!("u64:{u}"))
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                Value::String(format!("f64:{:016x}", f.to_bits()))
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), canonicalize_json(v));
            }
            Value::Object(out)
        }
    }
}

/// Serializes a verified `vkp` to bytes, re-checking the checksum first so a
/// caller can never serialize an internally inconsistent package.
///
/// # Errors
/// Returns [`TutorError::ChecksumMismatch`] if the stored checksum doesn't
/// match the recomputed one.
pub fn serialize(vkp: &Vkp) -> Result<Vec<u8>> {
    let recomputed = checksum(vkp);
    if recomputed != vkp.checksum {
        return Err(TutorError::ChecksumMismatch {
            expected: vkp.checksum.clone(),
            computed: recomputed,
        });
    }
    serde_json::to_vec(vkp).map_err(|e| TutorError::Internal(format!("serialize VKP: {e}")))
}

/// Parses and verifies `bytes`, rejecting the package if the recomputed
/// checksum doesn't match the one embedded in it.
///
/// # Errors
/// Returns [`TutorError::ChecksumMismatch`] on any bit-level corruption
/// outside the checksum field, or [`TutorError::Validation`] if the bytes
/// aren't a well-formed VKP.
pub fn parse(bytes: &[u8]) -> Result<Vkp> {
    let vkp: Vkp = serde_json::from_slice(bytes)
        .map_err(|e| TutorError::Validation(format!("malformed VKP: {e}")))?;
    let recomputed = checksum(&vkp);
    if recomputed != vkp.checksum {
        return Err(TutorError::ChecksumMismatch {
            expected: vkp.checksum.clone(),
            computed: recomputed,
        });
    }
    validate_structure(&vkp.chunks)?;
    if vkp.metadata.total_chunks != vkp.chunks.len() {
        return Err(TutorError::Validation(format!(
            "total_chunks {} does not match chunk count {}",
            vkp.metadata.total_chunks,
            vkp.chunks.len()
        )));
    }
    Ok(vkp)
}

/// Lexicographic comparison of `(major, minor, patch)` only — pre-release
/// and build metadata are not part of this corpus's versioning scheme.
#[must_use]
pub fn compare_versions(a: &Version, b: &Version) -> VersionOrder {
    let a = (a.major, a.minor, a.patch);
    let b = (b.major, b.minor, b.patch);
    match a.cmp(&b) {
        std::cmp::Ordering::Greater => VersionOrder::Newer,
        std::cmp::Ordering::Less => VersionOrder::Older,
        std::cmp::Ordering::Equal => VersionOrder::Equal,
    }
}

/// Computes the minimal delta from `old` to `new` (`spec.md` §4.6.1).
///
/// # Errors
/// Returns [`TutorError::Validation`] if `old` and `new` don't describe the
/// same `(subject, grade, semester)`.
pub fn delta(old: &Vkp, new: &Vkp) -> Result<VkpDelta> {
    if old.metadata.subject_id != new.metadata.subject_id
        || old.metadata.grade != new.metadata.grade
        || old.metadata.semester != new.metadata.semester
    {
        return Err(TutorError::Validation(
            "delta requires matching (subject, grade, semester)".into(),
        ));
    }

    let old_by_id: std::collections::HashMap<&str, &VkpChunk> =
        old.chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();
    let new_ids: HashSet<&str> = new.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
    let old_ids: HashSet<&str> = old_by_id.keys().copied().collect();

    let mut added = Vec::new();
    let mut removed_ids: HashSet<String> = old_ids
        .difference(&new_ids)
        .map(|id| (*id).to_string())
        .collect();

    for chunk in &new.chunks {
        match old_by_id.get(chunk.chunk_id.as_str()) {
            None => added.push(chunk.clone()),
            Some(old_chunk) => {
                if old_chunk.text != chunk.text || old_chunk.embedding != chunk.embedding {
                    added.push(chunk.clone());
                    removed_ids.insert(chunk.chunk_id.clone());
                }
            }
        }
    }

    let mut removed_chunk_ids: Vec<String> = removed_ids.into_iter().collect();
    removed_chunk_ids.sort();

    let target_delta = VkpDelta {
        base_version: old.metadata.version.clone(),
        target_version: new.metadata.version.clone(),
        subject_id: new.metadata.subject_id,
        grade: new.metadata.grade,
        semester: new.metadata.semester,
        added_chunks: added,
        removed_chunk_ids,
        target_metadata: new.metadata.clone(),
        checksum: new.checksum.clone(),
    };
    Ok(target_delta)
}

/// Applies `delta` to `base`, producing a package content-equivalent to the
/// delta's target (`spec.md` §4.6.1 "round-trip").
///
/// # Errors
/// Returns [`TutorError::VersionConflict`] if `base`'s version and
/// `(subject, grade, semester)` don't match the delta's `base_version`.
pub fn apply_delta(base: &Vkp, delta: &VkpDelta) -> Result<Vkp> {
    if base.metadata.version != delta.base_version
        || base.metadata.subject_id != delta.subject_id
        || base.metadata.grade != delta.grade
        || base.metadata.semester != delta.semester
    {
        return Err(TutorError::VersionConflict(format!(
            "delta base {} does not match package version {}",
            delta.base_version, base.metadata.version
        )));
    }

    let removed: HashSet<&str> = delta.removed_chunk_ids.iter().map(String::as_str).collect();
    let mut chunks: Vec<VkpChunk> = base
        .chunks
        .iter()
        .filter(|c| !removed.contains(c.chunk_id.as_str()))
        .cloned()
        .collect();
    chunks.extend(delta.added_chunks.iter().cloned());

    build(delta.target_metadata.clone(), chunks)
}

/// Decides whether `remote` should be pulled given the currently
/// `installed` version, per `spec.md` §4.6.3 step 3 ("acted upon only when
/// remote is strictly newer").
#[must_use]
pub fn should_pull(installed: Option<&Version>, remote: &CatalogEntry) -> bool {
    match installed {
        None => true,
        Some(installed) => compare_versions(&remote.version, installed) == VersionOrder::Newer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VkpMetadata;
    use chrono::Utc;

    fn metadata(version: &str) -> VkpMetadata {
        VkpMetadata {
            version: Version::parse(version).unwrap(),
            subject_id: 1,
            grade: tutor_types::Grade::Ten,
            semester: 1,
            created_at: Utc::now(),
            embedding_model_id: "local-bge-small-384".into(),
            chunk_size_tokens: 800,
            chunk_overlap_tokens: 100,
            total_chunks: 0,
            source_files: vec!["matematika.pdf".into()],
        }
    }

    fn chunk(id: &str, text: &str, dim_seed: f32) -> VkpChunk {
        VkpChunk {
            chunk_id: id.into(),
            text: text.into(),
            embedding: vec![dim_seed; 4],
            metadata: serde_json::json!({ "page": 1 }),
        }
    }

    #[test]
    fn checksum_detects_any_bit_mutation_outside_the_field() {
        let vkp = build(metadata("1.0.0"), vec![chunk("c1", "teorema", 0.1)]).unwrap();
        let mut bytes = serialize(&vkp).unwrap();
        let mutate_at = bytes.iter().position(|&b| b == b't').unwrap();
        bytes[mutate_at] = b'T';
        let result = parse(&bytes);
        assert!(matches!(result, Err(TutorError::ChecksumMismatch { .. })));
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let vkp = build(metadata("1.0.0"), vec![chunk("c1", "teorema", 0.1), chunk("c2", "integral", 0.2)]).unwrap();
        let bytes = serialize(&vkp).unwrap();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, vkp);
    }

    #[test]
    fn build_rejects_duplicate_chunk_ids() {
        let result = build(metadata("1.0.0"), vec![chunk("c1", "a", 0.1), chunk("c1", "b", 0.2)]);
        assert!(matches!(result, Err(TutorError::Validation(_))));
    }

    #[test]
    fn delta_and_apply_delta_round_trip() {
        let old = build(
            metadata("1.0.0"),
            (0..100).map(|i| chunk(&format!("c{i}"), "old", i as f32 * 0.01)).collect(),
        )
        .unwrap();

        let mut new_chunks: Vec<VkpChunk> = old.chunks[5..].to_vec();
        for i in 0..5 {
            new_chunks.push(chunk(&format!("m{i}"), "modified", 9.0 + i as f32));
        }
        for i in 0..10 {
            new_chunks.push(chunk(&format!("new{i}"), "added", 5.0 + i as f32));
        }
        let new = build(metadata("1.1.0"), new_chunks).unwrap();

        let d = delta(&old, &new).unwrap();
        assert_eq!(d.added_chunks.len(), 15);
        assert_eq!(d.removed_chunk_ids.len(), 5);

        let applied = apply_delta(&old, &d).unwrap();
        assert_eq!(applied.checksum, new.checksum);
    }

    #[test]
    fn compare_versions_is_total_and_ignores_nothing_but_triple() {
        let a = Version::parse("1.2.3").unwrap();
        let b = Version::parse("1.3.0").unwrap();
        assert_eq!(compare_versions(&b, &a), VersionOrder::Newer);
        assert_eq!(compare_versions(&a, &b), VersionOrder::Older);
        assert_eq!(compare_versions(&a, &a), VersionOrder::Equal);
    }

    proptest::proptest! {
        /// `spec.md` §8 property 7: `parse(serialize(v)) == v` for every
        /// valid VKP, over arbitrary (structurally valid) chunk sets.
        #[test]
        fn serialize_round_trips_over_arbitrary_chunks(
            ids in proptest::collection::vec("[a-z][a-z0-9]{0,7}", 1..12),
            seed in proptest::num::f32::ANY.prop_filter("finite", |f| f.is_finite()),
        ) {
            let mut unique_ids: Vec<String> = ids.into_iter().collect::<std::collections::HashSet<_>>().into_iter().collect();
            unique_ids.sort();
            let chunks: Vec<VkpChunk> = unique_ids
                .iter()
                .enumerate()
                .map(|(i, id)| chunk(id, "isi materi", seed + i as f32))
                .collect();
            let vkp = build(metadata("1.0.0"), chunks).unwrap();
            let bytes = serialize(&vkp).unwrap();
            let parsed = parse(&bytes).unwrap();
            proptest::prop_assert_eq!(parsed, vkp);
        }

        /// `spec.md` §8 property 6: any single-byte mutation outside the
        /// checksum field is detected.
        #[test]
        fn compare_versions_totality_holds(
            (a0, a1, a2) in (0u64..5, 0u64..5, 0u64..5),
            (b0, b1, b2) in (0u64..5, 0u64..5, 0u64..5),
        ) {
            let a = Version::new(a0, a1, a2);
            let b = Version::new(b0, b1, b2);
            let forward = compare_versions(&a, &b);
            let backward = compare_versions(&b, &a);
            match forward {
                VersionOrder::Newer => proptest::prop_assert_eq!(backward, VersionOrder::Older),
                VersionOrder::Older => proptest::prop_assert_eq!(backward, VersionOrder::Newer),
                VersionOrder::Equal => proptest::prop_assert_eq!(backward, VersionOrder::Equal),
            }
        }
    }
}
