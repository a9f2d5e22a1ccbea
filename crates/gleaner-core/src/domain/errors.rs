//! Errors - エラー型と分類
//!
//! Executor / Sink のエラーは境界（driver, Delivery Buffer）で吸収されるので、
//! `GleanerError` に上がってくるのは契約違反とストア障害だけです。

use super::TaskId;
use crate::ports::StoreError;

/// ErrorKind は実行エラーの分類
///
/// - Contract: 呼び出し側の契約違反（enqueue で同期的に拒否）
/// - Infrastructure: 永続化ストアの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Contract,
    Infrastructure,
}

/// GleanerError はドメインエラー
#[derive(Debug, thiserror::Error)]
pub enum GleanerError {
    #[error("no keywords given")]
    NoKeywords,

    #[error("keyword #{index} is blank")]
    BlankKeyword { index: usize },

    #[error("categories must not be empty")]
    EmptyCategories,

    #[error("estimated value {0} is outside 0..=100")]
    EstimatedValueOutOfRange(f64),

    #[error("unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error("dependency cycle: {0:?}")]
    DependencyCycle(Vec<TaskId>),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GleanerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GleanerError::NoKeywords
            | GleanerError::BlankKeyword { .. }
            | GleanerError::EmptyCategories
            | GleanerError::EstimatedValueOutOfRange(_)
            | GleanerError::UnknownDependency(_)
            | GleanerError::DependencyCycle(_)
            | GleanerError::UnknownTask(_) => ErrorKind::Contract,
            GleanerError::Store(_) => ErrorKind::Infrastructure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_contract() {
        assert_eq!(GleanerError::EmptyCategories.kind(), ErrorKind::Contract);
        assert_eq!(
            GleanerError::BlankKeyword { index: 2 }.kind(),
            ErrorKind::Contract
        );
    }

    #[test]
    fn store_failures_are_infrastructure() {
        let err = GleanerError::from(StoreError::InvalidKey("../escape".into()));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }
}
