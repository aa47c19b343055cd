//! Feed transcripts and their content hash.

mod transcript;

pub use transcript::normalize_for_hash;
pub use transcript::{
    feed_digest, transcript_hash, verify_transcript_hash, DigestError, FeedTranscript,
    VerificationResult,
};
