use crate::core::Query;
use crate::model::Timestamp;

/// A live remote subscription bound to one query.
///
/// Carries the resume token and snapshot version of the last consistent
/// listen so reconnection resumes incrementally.
#[derive(Clone, Debug)]
pub struct TargetData {
    target_id: i32,
    query: Query,
    resume_token: Option<Vec<u8>>,
    snapshot_version: Option<Timestamp>,
}

impl TargetData {
    pub fn new(target_id: i32, query: Query) -> Self {
        Self {
            target_id,
            query,
            resume_token: None,
            snapshot_version: None,
        }
    }

    pub fn target_id(&self) -> i32 {
        self.target_id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn resume_token(&self) -> Option<&[u8]> {
        self.resume_token.as_deref()
    }

    pub fn snapshot_version(&self) -> Option<Timestamp> {
        self.snapshot_version
    }

    pub fn with_resume_token(mut self, token: Option<Vec<u8>>) -> Self {
        self.resume_token = token;
        self
    }

    pub fn with_snapshot_version(mut self, version: Option<Timestamp>) -> Self {
        self.snapshot_version = version;
        self
    }
}
