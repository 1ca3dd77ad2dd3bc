//! Optional deal-quality scoring hook.
use crate::model::{ListingDraft, SourceConfig};
use async_trait::async_trait;
use std::ops::RangeInclusive;
use tracing::warn;

pub const SCORE_RANGE: RangeInclusive<i64> = 1..=100;

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, listing: &ListingDraft, source: &SourceConfig)
        -> anyhow::Result<Option<i64>>;
}

/// Never scores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledScorer;

#[async_trait]
impl Scorer for DisabledScorer {
    async fn score(
        &self,
        _listing: &ListingDraft,
        _source: &SourceConfig,
    ) -> anyhow::Result<Option<i64>> {
        Ok(None)
    }
}

/// Ask `scorer` for a score; failures and out-of-range answers become `None`.
pub async fn score_or_none(
    scorer: &dyn Scorer,
    listing: &ListingDraft,
    source: &SourceConfig,
) -> Option<i64> {
    match scorer.score(listing, source).await {
        Ok(Some(score)) if SCORE_RANGE.contains(&score) => Some(score),
        Ok(Some(score)) => {
            warn!(item_id = listing.item_id, score, "discarding out-of-range score");
            None
        }
        Ok(None) => None,
        Err(err) => {
            warn!(item_id = listing.item_id, error = %err, "scoring failed");
            None
        }
    }
}
