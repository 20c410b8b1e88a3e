//! Consistency detector -- classifies heard announcements against the
//! local session.

use serde::Serialize;
use sprinkler_protocol::Announcement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Same version, same content.
    Consistent,
    /// Same version, different content.
    Inconsistent,
    /// The neighbour is ahead of us.
    NewerVersion,
    /// The neighbour is behind us.
    StaleVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationCounts {
    pub consistent: u64,
    pub inconsistent: u64,
    pub newer: u64,
    pub stale: u64,
}

#[derive(Debug, Default)]
pub struct ConsistencyDetector {
    counts: ClassificationCounts,
}

impl ConsistencyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `local` is the announcement of the current session, if any.
    pub fn classify(
        &mut self,
        observation: &Announcement,
        local: Option<&Announcement>,
    ) -> Classification {
        let class = match local {
            None if observation.version > 0 => Classification::NewerVersion,
            None => Classification::Consistent,
            Some(ours) if observation.version > ours.version => Classification::NewerVersion,
            Some(ours) if observation.version < ours.version => Classification::StaleVersion,
            Some(ours) if ours.same_content(observation) => Classification::Consistent,
            Some(_) => Classification::Inconsistent,
        };

        match class {
            Classification::Consistent => self.counts.consistent += 1,
            Classification::Inconsistent => self.counts.inconsistent += 1,
            Classification::NewerVersion => self.counts.newer += 1,
            Classification::StaleVersion => self.counts.stale += 1,
        }
        class
    }

    pub fn counts(&self) -> &ClassificationCounts {
        &self.counts
    }
}
