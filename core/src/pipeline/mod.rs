//! Message processing pipeline
//!
//! An ordered list of stages turns one raw fetched message into a persisted
//! message bound to the right thread. Stages are values behind one narrow
//! interface; the terminal stage (thread aggregation) is the only one that
//! touches the store.

pub mod parse;
pub mod threading;

pub use parse::{HygieneStage, ParseStage};
pub use threading::ThreadAggregator;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{HeimdallError, HeimdallResult};
use crate::message::{Message, MessageDraft};
use crate::storage::Store;

/// Bumped when the stage list changes shape; stamped onto every message
pub const PIPELINE_VERSION: u32 = 1;

/// One transformation step. Pure with respect to the store: stages receive
/// the message-in-progress and give back an amended one.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, draft: MessageDraft) -> HeimdallResult<MessageDraft>;
}

/// The per-account pipeline: ordered stages, then thread aggregation
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
    aggregator: ThreadAggregator,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self { stages, aggregator: ThreadAggregator::new() }
    }

    /// The standard stage list
    pub fn standard() -> Self {
        Self::new(vec![Box::new(ParseStage), Box::new(HygieneStage)])
    }

    /// Run one draft through every stage and aggregate it into a thread.
    /// Returns `None` when a stage rejected the message; the caller logs the
    /// UID and carries on with the pass.
    pub async fn process(
        &self,
        store: &Store,
        draft: MessageDraft,
    ) -> HeimdallResult<Option<Message>> {
        let uid = draft.uid;
        let container = draft.container.name.clone();
        let mut draft = draft;

        for stage in &self.stages {
            draft = match stage.apply(draft).await {
                Ok(next) => next,
                Err(err) => {
                    warn!(
                        stage = stage.name(),
                        container = %container,
                        uid,
                        error = %err,
                        "pipeline stage rejected message"
                    );
                    return Ok(None);
                }
            };
            if draft.body.trim().is_empty() {
                warn!(
                    stage = stage.name(),
                    container = %container,
                    uid,
                    "pipeline stage produced an empty body"
                );
                return Ok(None);
            }
        }

        let message = self.aggregator.aggregate(store, draft).await?;
        Ok(Some(message))
    }
}

/// Convenience used by stages to reject a message
pub fn reject(reason: impl Into<String>) -> HeimdallError {
    HeimdallError::processing(reason)
}
