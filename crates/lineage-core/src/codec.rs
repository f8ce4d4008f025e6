//! Mapping between the expanded in-memory [`Lineage`] and its persisted form.
//!
//! The backing store never looks inside the ancestry: it is kept as one opaque
//! JSON array blob next to an explicit `ancestor_count`, so summary views can
//! report depth without decoding the history.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{AccountId, Genome, Lineage, LineageError, LineageId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedLineage {
    pub id: Option<LineageId>,
    pub owner: AccountId,
    pub generator_seed: i64,
    pub current: Genome,
    pub ancestry_blob: Vec<u8>,
    pub ancestor_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Serialize an ordered ancestry into one blob plus its element count.
///
/// # Errors
/// Returns [`LineageError::Storage`] when the sequence cannot be serialized.
pub fn encode_ancestry(ancestry: &[Genome]) -> Result<(Vec<u8>, u64), LineageError> {
    let blob = serde_json::to_vec(ancestry)
        .map_err(|err| LineageError::Storage(format!("failed to encode ancestry: {err}")))?;
    let count = u64::try_from(ancestry.len())
        .map_err(|_| LineageError::Storage("ancestry length overflows u64".to_string()))?;
    Ok((blob, count))
}

/// Deserialize an ancestry blob and check it against the persisted count.
///
/// # Errors
/// Returns [`LineageError::Corrupt`] when the blob is not a genome array or
/// its length differs from `ancestor_count`.
pub fn decode_ancestry(blob: &[u8], ancestor_count: u64) -> Result<Vec<Genome>, LineageError> {
    let ancestry: Vec<Genome> = serde_json::from_slice(blob)
        .map_err(|err| LineageError::Corrupt(format!("ancestry blob does not decode: {err}")))?;

    let decoded = ancestry.len() as u64;
    if decoded != ancestor_count {
        return Err(LineageError::Corrupt(format!(
            "ancestor_count is {ancestor_count} but ancestry blob holds {decoded} genomes"
        )));
    }

    Ok(ancestry)
}

/// Produce the persisted form, recomputing `ancestor_count` from the ancestry.
///
/// # Errors
/// Propagates [`encode_ancestry`] failures; nothing is returned half-encoded.
pub fn encode_lineage(lineage: &Lineage) -> Result<PersistedLineage, LineageError> {
    let (ancestry_blob, ancestor_count) = encode_ancestry(&lineage.ancestry)?;
    Ok(PersistedLineage {
        id: lineage.id,
        owner: lineage.owner.clone(),
        generator_seed: lineage.generator_seed,
        current: lineage.current.clone(),
        ancestry_blob,
        ancestor_count,
        created_at: lineage.created_at,
        updated_at: lineage.updated_at,
    })
}

/// Rebuild the in-memory lineage from its persisted form.
///
/// # Errors
/// Returns [`LineageError::Corrupt`] when the ancestry cannot be restored.
pub fn decode_lineage(persisted: PersistedLineage) -> Result<Lineage, LineageError> {
    let ancestry = decode_ancestry(&persisted.ancestry_blob, persisted.ancestor_count)?;
    Ok(Lineage {
        id: persisted.id,
        owner: persisted.owner,
        generator_seed: persisted.generator_seed,
        current: persisted.current,
        ancestry,
        created_at: persisted.created_at,
        updated_at: persisted.updated_at,
    })
}
