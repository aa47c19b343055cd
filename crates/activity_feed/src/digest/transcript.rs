//! A saved run of the feed and a SHA-256 over its key-sorted JSON, so two runs over the
//! same cache can be compared byte for byte.

use crate::feed::FeedBatch;
use crate::model::Activity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedTranscript {
    pub version: u32,
    pub created_utc_rfc3339: String,
    /// Cache keys the feed was built from (sorted).
    pub keys: Vec<String>,
    pub batches: usize,
    pub reached_end: bool,
    /// Released activities in feed order.
    pub activities: Vec<Activity>,
}

const TRANSCRIPT_VERSION: u32 = 1;

impl FeedTranscript {
    pub fn new(mut keys: Vec<String>) -> Self {
        keys.sort();
        let created_utc_rfc3339 = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        Self {
            version: TRANSCRIPT_VERSION,
            created_utc_rfc3339,
            keys,
            batches: 0,
            reached_end: false,
            activities: Vec::new(),
        }
    }

    pub fn record(&mut self, batch: &FeedBatch) {
        self.batches += 1;
        self.reached_end = batch.reached_end;
        self.activities.extend(batch.activities.iter().cloned());
    }
}

/// Normalize JSON for hashing: sorted keys, no whitespace.
pub fn normalize_for_hash(value: &serde_json::Value) -> Result<String, DigestError> {
    Ok(serde_json::to_string(&sort_json_keys(value))?)
}

fn sort_json_keys(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(m) => {
            let out: std::collections::BTreeMap<String, serde_json::Value> = m
                .iter()
                .map(|(k, v)| (k.clone(), sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(serde_json::Map::from_iter(out))
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

fn sha256_json<T: Serialize>(value: &T) -> Result<String, DigestError> {
    let json = serde_json::to_value(value)?;
    let normalized = normalize_for_hash(&json)?;
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Hash of the whole transcript file, creation time included.
pub fn transcript_hash(transcript: &FeedTranscript) -> Result<String, DigestError> {
    sha256_json(transcript)
}

/// Hash of an activity sequence alone; equal for a cold and a warm run over the
/// same history.
pub fn feed_digest(activities: &[Activity]) -> Result<String, DigestError> {
    sha256_json(&activities)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationResult {
    pub transcript_hash: String,
    pub expected_hash: Option<String>,
    pub matches: bool,
}

/// Compare against the content of a `.sha256` file.
pub fn verify_transcript_hash(
    transcript: &FeedTranscript,
    expected_hex: Option<&str>,
) -> Result<VerificationResult, DigestError> {
    let transcript_hash = transcript_hash(transcript)?;
    let expected = expected_hex.map(|e| e.trim().to_lowercase());
    let matches = expected.as_deref() == Some(transcript_hash.as_str());
    Ok(VerificationResult {
        transcript_hash,
        expected_hash: expected,
        matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::testing::act;

    #[test]
    fn normalize_deterministic() {
        let a = serde_json::json!({"z": 1, "a": {"y": 2, "b": 3}});
        let b = serde_json::json!({"a": {"b": 3, "y": 2}, "z": 1});
        assert_eq!(normalize_for_hash(&a).unwrap(), normalize_for_hash(&b).unwrap());
    }

    #[test]
    fn hash_tracks_content() {
        let mut transcript = FeedTranscript::new(vec!["evm:1/0xaa".into(), "evm:10/0xaa".into()]);
        transcript.record(&FeedBatch {
            activities: vec![act(3), act(2)],
            ..Default::default()
        });
        let h1 = transcript_hash(&transcript).unwrap();
        assert_eq!(h1.len(), 64);
        assert_eq!(h1, transcript_hash(&transcript.clone()).unwrap());

        let verified = verify_transcript_hash(&transcript, Some(&format!("{}\n", h1.to_uppercase()))).unwrap();
        assert!(verified.matches);

        transcript.activities.pop();
        assert_ne!(transcript_hash(&transcript).unwrap(), h1);
        assert!(!verify_transcript_hash(&transcript, None).unwrap().matches);
    }

    #[test]
    fn feed_digest_ignores_transcript_metadata() {
        let mut a = FeedTranscript::new(vec!["evm:1/0xaa".into()]);
        let mut b = FeedTranscript::new(vec!["evm:1/0xaa".into()]);
        b.created_utc_rfc3339 = "2000-01-01T00:00:00Z".into();
        let batch = FeedBatch {
            activities: vec![act(5), act(4)],
            ..Default::default()
        };
        a.record(&batch);
        b.record(&batch);
        assert_eq!(feed_digest(&a.activities).unwrap(), feed_digest(&b.activities).unwrap());
        assert_ne!(
            feed_digest(&a.activities).unwrap(),
            feed_digest(&a.activities[..1]).unwrap()
        );
    }
}
