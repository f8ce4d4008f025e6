use std::fmt::{Display, Formatter};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod codec;

pub use codec::{decode_ancestry, decode_lineage, encode_ancestry, encode_lineage, PersistedLineage};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LineageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("evolution error: {0}")]
    Evolution(String),
}

impl LineageError {
    /// Only transaction contention is worth re-running; every other kind is final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Corrupt(_) => "corrupt",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Storage(_) => "storage",
            Self::Evolution(_) => "evolution",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LineageId(pub Ulid);

impl LineageId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a caller-supplied lineage handle.
    ///
    /// # Errors
    /// Returns [`LineageError::InvalidInput`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, LineageError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| LineageError::InvalidInput(format!("invalid lineage id {raw:?}: {err}")))
    }
}

impl Default for LineageId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LineageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the identity provider hands over for an authenticated caller.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Identity {
    pub external_id: Option<String>,
    pub email: String,
}

impl Identity {
    /// Stable account key: the provider identifier, or the email when the
    /// provider supplies none.
    ///
    /// # Errors
    /// Returns [`LineageError::Unauthenticated`] when neither is present.
    pub fn account_id(&self) -> Result<AccountId, LineageError> {
        if let Some(external_id) = self.external_id.as_deref().map(str::trim) {
            if !external_id.is_empty() {
                return Ok(AccountId::new(external_id));
            }
        }

        let email = self.email.trim();
        if email.is_empty() {
            return Err(LineageError::Unauthenticated(
                "caller identity has neither an external id nor an email".to_string(),
            ));
        }
        Ok(AccountId::new(email))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub external_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One evolvable entity's encoded traits. The kernel never looks inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Genome(serde_json::Value);

impl Genome {
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// # Errors
    /// Returns [`LineageError::InvalidInput`] for an empty (`null`) genome.
    pub fn validate(&self) -> Result<(), LineageError> {
        if self.0.is_null() {
            return Err(LineageError::InvalidInput("genome MUST NOT be null".to_string()));
        }
        Ok(())
    }
}

/// A developed genome, as produced and consumed by an [`Evolver`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Individual {
    pub genotype: Genome,
}

/// Lifts a genome into a candidate individual.
pub type Development = fn(&Genome) -> Individual;

/// The development function the engines hand to the evolver: the individual
/// carries its genome unchanged.
#[must_use]
pub fn develop(genome: &Genome) -> Individual {
    Individual { genotype: genome.clone() }
}

/// Deterministic pseudo-random generator driving one generation-advance.
#[derive(Debug, Clone)]
pub struct GenerationRng(ChaCha8Rng);

impl GenerationRng {
    #[must_use]
    pub fn from_seed(seed: i64) -> Self {
        Self(ChaCha8Rng::seed_from_u64(u64::from_le_bytes(seed.to_le_bytes())))
    }

    /// Draw a fresh non-negative seed from the current generator state.
    pub fn next_seed(&mut self) -> i64 {
        i64::try_from(self.0.next_u64() >> 1).unwrap_or(i64::MAX)
    }
}

impl RngCore for GenerationRng {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.try_fill_bytes(dest)
    }
}

/// Contract of the external evolutionary algorithm.
///
/// Implementations must return exactly `count` individuals in a stable order
/// and must draw randomness only from `rng`, so equal seeds give equal output.
pub trait Evolver: Send + Sync {
    /// # Errors
    /// Returns [`LineageError::Evolution`] when offspring cannot be produced.
    fn evolve(
        &self,
        parent: &Genome,
        development: Development,
        rng: &mut GenerationRng,
        count: usize,
    ) -> Result<Vec<Individual>, LineageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lineage {
    pub id: Option<LineageId>,
    pub owner: AccountId,
    pub generator_seed: i64,
    pub current: Genome,
    #[serde(default)]
    pub ancestry: Vec<Genome>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Lineage {
    /// Start a lineage from an initial genome. A missing or zero seed is
    /// replaced by one derived from `now`.
    ///
    /// # Errors
    /// Returns [`LineageError::InvalidInput`] when the genome is rejected.
    pub fn new(
        owner: AccountId,
        genome: Genome,
        seed: Option<i64>,
        now: OffsetDateTime,
    ) -> Result<Self, LineageError> {
        genome.validate()?;
        let generator_seed = match seed {
            Some(seed) if seed != 0 => seed,
            _ => time_derived_seed(now),
        };

        Ok(Self {
            id: None,
            owner,
            generator_seed,
            current: genome,
            ancestry: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    #[must_use]
    pub fn ancestor_count(&self) -> usize {
        self.ancestry.len()
    }

    #[must_use]
    pub fn summary(&self) -> Option<LineageSummary> {
        Some(LineageSummary {
            id: self.id?,
            current: self.current.clone(),
            ancestor_count: self.ancestry.len() as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineageSummary {
    pub id: LineageId,
    pub current: Genome,
    pub ancestor_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[must_use]
pub fn time_derived_seed(now: OffsetDateTime) -> i64 {
    let nanos = now.unix_timestamp_nanos().rem_euclid(i128::from(i64::MAX));
    match i64::try_from(nanos) {
        Ok(0) | Err(_) => 1,
        Ok(seed) => seed,
    }
}

/// Produce `count` candidate genomes from the lineage's current genome.
///
/// Only `generator_seed` and `updated_at` change; `current` and `ancestry`
/// are left as they were. On error the lineage is untouched.
///
/// # Errors
/// Returns [`LineageError::InvalidInput`] for a zero count and
/// [`LineageError::Evolution`] when the evolver fails or breaks its contract.
pub fn advance_generation<E>(
    lineage: &mut Lineage,
    evolver: &E,
    count: usize,
    now: OffsetDateTime,
) -> Result<Vec<Genome>, LineageError>
where
    E: Evolver + ?Sized,
{
    if count == 0 {
        return Err(LineageError::InvalidInput("candidate count MUST be positive".to_string()));
    }

    let mut rng = GenerationRng::from_seed(lineage.generator_seed);
    let individuals = evolver.evolve(&lineage.current, develop, &mut rng, count)?;
    if individuals.len() != count {
        return Err(LineageError::Evolution(format!(
            "evolver returned {} individuals, expected {count}",
            individuals.len()
        )));
    }

    lineage.generator_seed = rng.next_seed();
    lineage.updated_at = now;
    Ok(individuals.into_iter().map(|individual| individual.genotype).collect())
}

/// Commit `survivor` as the current genome, pushing the previous one onto the
/// ancestry. Any genome is accepted, not only a recent candidate.
///
/// # Errors
/// Returns [`LineageError::InvalidInput`] when the survivor is rejected.
pub fn select_survivor(
    lineage: &mut Lineage,
    survivor: Genome,
    now: OffsetDateTime,
) -> Result<(), LineageError> {
    survivor.validate()?;
    let previous = std::mem::replace(&mut lineage.current, survivor);
    lineage.ancestry.push(previous);
    lineage.updated_at = now;
    Ok(())
}
