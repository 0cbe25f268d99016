use indoc::formatdoc;
use searchjobs_job::JobState;
use serde::Serialize;
use sqlx::{query_as, FromRow};

use super::ExhaustiveSearchStore;
use crate::errors::Result;

/// Progress of a search job and all of its descendants, computed on read.
///
/// Errored rows count as failed: they only run again when the worker store
/// retries errored rows.
#[derive(FromRow, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub in_progress: i64,
    pub canceled: i64,
}

/// Single state summarizing `stats`.
///
/// Cancellation wins over everything, then anything still queued or processing,
/// then any failure.
pub fn aggregate_state(stats: &AggregateStats) -> JobState {
    if stats.canceled > 0 {
        JobState::Canceled
    } else if stats.in_progress > 0 {
        JobState::Processing
    } else if stats.failed > 0 {
        JobState::Failed
    } else if stats.total > 0 {
        JobState::Completed
    } else {
        JobState::Queued
    }
}

impl ExhaustiveSearchStore {
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn get_aggregate_repo_rev_state(&self, search_job_id: i64) -> Result<AggregateStats> {
        let search_jobs = self.search_jobs_table();
        let repo_jobs = self.repo_jobs_table();
        let repo_revision_jobs = self.repo_revision_jobs_table();
        let sql = formatdoc!(
            r#"
                select
                    count(*) as total,
                    count(*) filter (where state = 'completed') as completed,
                    count(*) filter (where state in ('failed', 'errored')) as failed,
                    count(*) filter (where state in ('queued', 'processing')) as in_progress,
                    count(*) filter (where state = 'canceled') as canceled
                from (
                    select state from {search_jobs} where id = $1::bigint
                    union all
                    select state from {repo_jobs} where search_job_id = $1::bigint
                    union all
                    select rrj.state
                        from {repo_revision_jobs} as rrj
                        join {repo_jobs} as rj on rj.id = rrj.search_repo_job_id
                        where rj.search_job_id = $1::bigint
                ) as states
            "#
        );

        Ok(self
            .store()
            .query_one(query_as::<_, AggregateStats>(&sql).bind(search_job_id))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(completed: i64, failed: i64, in_progress: i64, canceled: i64) -> AggregateStats {
        AggregateStats {
            total: completed + failed + in_progress + canceled,
            completed,
            failed,
            in_progress,
            canceled,
        }
    }

    #[test]
    fn aggregate_state_precedence() {
        assert_eq!(aggregate_state(&stats(6, 0, 0, 0)), JobState::Completed);
        assert_eq!(aggregate_state(&stats(4, 1, 0, 0)), JobState::Failed);
        assert_eq!(aggregate_state(&stats(4, 1, 1, 0)), JobState::Processing);
        assert_eq!(aggregate_state(&stats(4, 1, 1, 2)), JobState::Canceled);
        assert_eq!(aggregate_state(&AggregateStats::default()), JobState::Queued);
    }
}
