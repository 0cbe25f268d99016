use std::time::Duration;

use searchjobs::search::{SearchContext, Searcher, SearcherError};
use searchjobs::store::{aggregate_state, REPO_JOBS_TABLE, REPO_REVISION_JOBS_TABLE, SEARCH_JOBS_TABLE};
use searchjobs::{
    AggregateStats, BlobstoreCsvWriter, ExhaustiveSearchStore, JobState, ListSearchJobsArgs,
    MemoryUploadStore, SearchJobsError, UploadStore,
};

use crate::helpers::{FakeQuery, FakeSearcher, TEST_SCHEMA};

mod helpers;

async fn object(uploads: &MemoryUploadStore, key: &str) -> String {
    String::from_utf8(uploads.get(key).await.expect("Object not found")).unwrap()
}

#[tokio::test]
async fn it_should_fan_out_and_upload_one_object_per_revision() {
    helpers::with_test_db(|test_db| async move {
        helpers::enable_logs().await;

        let searcher = FakeSearcher::new();
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(searcher.clone(), uploads.clone())
            .await
            .expect("Failed to init runtime");
        let service = runtime.service();

        let search_job = service
            .create_search_job(1, "1@rev1 1@rev2 2@rev3")
            .await
            .unwrap();
        let search_job_id = *search_job.job().id();
        assert_eq!(*search_job.job().state(), JobState::Queued);

        runtime.run_once().await.expect("Failed to run once");

        assert_eq!(test_db.states(SEARCH_JOBS_TABLE).await, vec!["completed"]);
        assert_eq!(
            test_db.states(REPO_JOBS_TABLE).await,
            vec!["completed", "completed"]
        );
        assert_eq!(
            test_db.states(REPO_REVISION_JOBS_TABLE).await,
            vec!["completed", "completed", "completed"]
        );

        let repo_jobs = runtime.store().list_repo_jobs(search_job_id).await.unwrap();
        let ref_specs: Vec<(i32, &str)> = repo_jobs
            .iter()
            .map(|j| (*j.repo_id(), j.ref_spec().as_str()))
            .collect();
        assert_eq!(ref_specs, vec![(1, "rev1:rev2"), (2, "rev3")]);

        let revision_jobs = runtime
            .store()
            .list_repo_revision_jobs(search_job_id)
            .await
            .unwrap();
        assert_eq!(revision_jobs.len(), 3);

        let mut keys = uploads.list(&format!("{search_job_id}-")).await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 3);
        for job in &revision_jobs {
            let key = format!("{search_job_id}-{}", job.job().id());
            let contents = object(&uploads, &key).await;
            let lines: Vec<&str> = contents.lines().collect();
            assert_eq!(lines[0], "repo,revision");
            assert_eq!(lines.len(), 2, "one data row in {key}");
            assert!(lines[1].ends_with(&format!(",{}", job.revision())));
        }

        let stats = service.get_aggregate_repo_rev_state(search_job_id).await.unwrap();
        assert_eq!(
            stats,
            AggregateStats {
                total: 6,
                completed: 6,
                failed: 0,
                in_progress: 0,
                canceled: 0,
            }
        );
        assert_eq!(aggregate_state(&stats), JobState::Completed);

        // One search per stage invocation.
        assert_eq!(searcher.new_search_calls(), 6);
    })
    .await;
}

#[tokio::test]
async fn a_failed_resolve_only_fails_its_own_repo_job() {
    helpers::with_test_db(|test_db| async move {
        let searcher = FakeSearcher {
            fail_resolve_repo: Some(2),
            ..FakeSearcher::default()
        };
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(searcher, uploads.clone())
            .await
            .unwrap();
        let service = runtime.service();

        let search_job = service.create_search_job(1, "1@rev1 1@rev2 2@rev3").await.unwrap();
        let search_job_id = *search_job.job().id();
        runtime.run_once().await.unwrap();

        let repo_jobs = runtime.store().list_repo_jobs(search_job_id).await.unwrap();
        let failed = repo_jobs
            .iter()
            .find(|j| *j.repo_id() == 2)
            .expect("Missing repo job");
        assert_eq!(*failed.job().state(), JobState::Failed);
        assert!(failed
            .job()
            .failure_message()
            .as_deref()
            .unwrap_or_default()
            .contains("unknown revision"));

        assert_eq!(test_db.count_rows(REPO_REVISION_JOBS_TABLE).await, 2);
        assert_eq!(uploads.len().await, 2);

        let stats = service.get_aggregate_repo_rev_state(search_job_id).await.unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(aggregate_state(&stats), JobState::Failed);
    })
    .await;
}

#[tokio::test]
async fn a_failed_search_does_not_upload_anything() {
    helpers::with_test_db(|test_db| async move {
        let searcher = FakeSearcher {
            fail_search_revision: Some("rev2".into()),
            ..FakeSearcher::default()
        };
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(searcher, uploads.clone())
            .await
            .unwrap();

        let search_job = runtime
            .service()
            .create_search_job(1, "1@rev1 1@rev2 2@rev3")
            .await
            .unwrap();
        runtime.run_once().await.unwrap();

        let search_job_id = *search_job.job().id();
        let mut states: Vec<(String, JobState)> = runtime
            .store()
            .list_repo_revision_jobs(search_job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|j| (j.revision().clone(), *j.job().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            states,
            vec![
                ("rev1".to_string(), JobState::Completed),
                ("rev2".to_string(), JobState::Failed),
                ("rev3".to_string(), JobState::Completed),
            ]
        );
        assert_eq!(uploads.len().await, 2);

        let stats = runtime
            .service()
            .get_aggregate_repo_rev_state(search_job_id)
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
    })
    .await;
}

#[tokio::test]
async fn an_invalid_query_fails_the_search_job() {
    helpers::with_test_db(|test_db| async move {
        let runtime = test_db
            .create_runtime_options()
            .init(FakeSearcher::new(), MemoryUploadStore::new())
            .await
            .unwrap();

        let search_job = runtime.service().create_search_job(1, "no-at-sign").await.unwrap();
        runtime.run_once().await.unwrap();

        let search_job = runtime
            .service()
            .get_search_job(*search_job.job().id())
            .await
            .unwrap();
        assert_eq!(*search_job.job().state(), JobState::Failed);
        assert!(search_job
            .job()
            .failure_message()
            .as_deref()
            .unwrap_or_default()
            .contains("Failed to create search"));
        assert_eq!(test_db.count_rows(REPO_JOBS_TABLE).await, 0);
    })
    .await;
}

#[tokio::test]
async fn cancel_is_idempotent() {
    helpers::with_test_db(|test_db| async move {
        let runtime = test_db
            .create_runtime_options()
            .init(FakeSearcher::new(), MemoryUploadStore::new())
            .await
            .unwrap();
        let service = runtime.service();

        let search_job = service.create_search_job(1, "1@rev1").await.unwrap();
        let id = *search_job.job().id();

        assert_eq!(service.cancel_search_job(id).await.unwrap(), 1);
        assert_eq!(service.cancel_search_job(id).await.unwrap(), 0);

        runtime.run_once().await.unwrap();

        let search_job = service.get_search_job(id).await.unwrap();
        assert_eq!(*search_job.job().state(), JobState::Canceled);
        assert!(*search_job.job().cancel());
        assert!(search_job.job().finished_at().is_some());
        assert_eq!(test_db.count_rows(REPO_JOBS_TABLE).await, 0);

        // Nothing left to cancel on a finished job either.
        let done = service.create_search_job(1, "1@rev1").await.unwrap();
        runtime.run_once().await.unwrap();
        assert_eq!(service.cancel_search_job(*done.job().id()).await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn canceling_a_running_search_cancels_every_descendant() {
    helpers::with_test_db(|test_db| async move {
        let searcher = FakeSearcher {
            search_delay: Some(Duration::from_secs(30)),
            ..FakeSearcher::default()
        };
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(searcher, uploads.clone())
            .await
            .unwrap();
        let service = runtime.service();

        let search_job = service.create_search_job(1, "1@rev1 2@rev2").await.unwrap();
        let id = *search_job.job().id();

        let control = async {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            loop {
                let states = test_db.states(REPO_REVISION_JOBS_TABLE).await;
                if states.len() == 2 && states.iter().all(|s| s == "processing") {
                    break;
                }
                assert!(tokio::time::Instant::now() < deadline, "revision jobs never started");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            // Only the revision jobs are still running.
            assert_eq!(service.cancel_search_job(id).await.unwrap(), 2);

            // Heartbeats notice the cancellation and stop the searches.
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            while !runtime.repo_revision_job_worker().running_ids().await.is_empty() {
                assert!(tokio::time::Instant::now() < deadline, "searches never stopped");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            runtime.request_shutdown();
        };

        let (run, ()) = tokio::join!(runtime.run(), control);
        run.expect("Runtime failed");

        assert_eq!(
            test_db.states(REPO_REVISION_JOBS_TABLE).await,
            vec!["canceled", "canceled"]
        );
        assert_eq!(
            test_db.states(REPO_JOBS_TABLE).await,
            vec!["completed", "completed"]
        );
        assert!(uploads.is_empty().await);
    })
    .await;
}

#[tokio::test]
async fn delete_removes_rows_and_uploaded_objects() {
    helpers::with_test_db(|test_db| async move {
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(FakeSearcher::new(), uploads.clone())
            .await
            .unwrap();
        let service = runtime.service();

        let deleted = service.create_search_job(1, "1@rev1 1@rev2 2@rev3").await.unwrap();
        let kept = service.create_search_job(2, "3@main").await.unwrap();
        runtime.run_once().await.unwrap();
        assert_eq!(uploads.len().await, 4);

        service.delete_search_job(*deleted.job().id()).await.unwrap();

        assert_eq!(test_db.count_rows(SEARCH_JOBS_TABLE).await, 1);
        assert_eq!(test_db.count_rows(REPO_JOBS_TABLE).await, 1);
        assert_eq!(test_db.count_rows(REPO_REVISION_JOBS_TABLE).await, 1);
        assert_eq!(uploads.len().await, 1);
        assert_eq!(
            uploads.list(&format!("{}-", kept.job().id())).await.unwrap().len(),
            1
        );

        let err = service.delete_search_job(*deleted.job().id()).await.unwrap_err();
        assert!(matches!(err, SearchJobsError::SearchJobNotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn it_should_list_search_jobs_with_keyset_pagination() {
    helpers::with_test_db(|test_db| async move {
        let runtime = test_db
            .create_runtime_options()
            .init(FakeSearcher::new(), MemoryUploadStore::new())
            .await
            .unwrap();
        let service = runtime.service();

        let mut ids = Vec::new();
        for initiator_id in [1, 2, 1, 1] {
            let job = service.create_search_job(initiator_id, "1@main").await.unwrap();
            ids.push(*job.job().id());
        }
        service.cancel_search_job(ids[3]).await.unwrap();

        let page = service
            .list_search_jobs(&ListSearchJobsArgs {
                first: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let page_ids: Vec<i64> = page.iter().map(|j| *j.job().id()).collect();
        assert_eq!(page_ids, vec![ids[0], ids[1]]);

        let page = service
            .list_search_jobs(&ListSearchJobsArgs {
                after: Some(ids[1]),
                first: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let page_ids: Vec<i64> = page.iter().map(|j| *j.job().id()).collect();
        assert_eq!(page_ids, vec![ids[2], ids[3]]);

        let page = service
            .list_search_jobs(&ListSearchJobsArgs {
                initiator_id: Some(1),
                states: vec![JobState::Queued],
                ..Default::default()
            })
            .await
            .unwrap();
        let page_ids: Vec<i64> = page.iter().map(|j| *j.job().id()).collect();
        assert_eq!(page_ids, vec![ids[0], ids[2]]);
    })
    .await;
}

#[tokio::test]
async fn it_should_write_search_job_logs_as_csv() {
    helpers::with_test_db(|test_db| async move {
        let runtime = test_db
            .create_runtime_options()
            .init(
                FakeSearcher {
                    fail_search_revision: Some("rev3".into()),
                    ..FakeSearcher::default()
                },
                MemoryUploadStore::new(),
            )
            .await
            .unwrap();
        let service = runtime.service();

        let search_job = service.create_search_job(1, "1@rev1 1@rev2 2@rev3").await.unwrap();
        runtime.run_once().await.unwrap();

        let logs = MemoryUploadStore::new();
        let mut writer = BlobstoreCsvWriter::new(logs.clone(), "logs", 1024 * 1024);
        let written = service
            .write_search_job_logs(*search_job.job().id(), &mut writer)
            .await
            .unwrap();
        writer.close().await.unwrap();
        assert_eq!(written, 6);

        let contents = object(&logs, "logs").await;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "repository,revision,started_at,finished_at,status,failure_message"
        );
        assert_eq!(lines.len(), 7);
        assert!(lines[1].starts_with(",,"));
        assert!(lines[1].ends_with(",completed,"));
        assert!(lines[2].starts_with("1,rev1:rev2,"));
        assert!(lines[3].starts_with("2,rev3,"));

        // Revision jobs of different repositories are created concurrently.
        let mut revision_lines = lines[4..].to_vec();
        revision_lines.sort();
        assert!(revision_lines[0].starts_with("1,rev1,"));
        assert!(revision_lines[0].contains(",completed,"));
        assert!(revision_lines[1].starts_with("1,rev2,"));
        assert!(revision_lines[1].contains(",completed,"));
        assert!(revision_lines[2].starts_with("2,rev3,"));
        assert!(revision_lines[2].contains(",failed,"));
    })
    .await;
}

#[tokio::test]
async fn init_requires_a_database() {
    let err = searchjobs::ExhaustiveSearchOptions::default()
        .init(FakeSearcher::new(), MemoryUploadStore::new())
        .await
        .err()
        .expect("init should fail without a database");
    assert!(matches!(err, SearchJobsError::InvalidOptions(_)));
}

/// Cancels every search job from inside the `cancel_on_call`-th search creation,
/// while the calling handler still holds its record.
#[derive(Clone)]
struct CancelingSearcher {
    inner: FakeSearcher,
    store: ExhaustiveSearchStore,
    cancel_on_call: usize,
}

impl Searcher for CancelingSearcher {
    type Query = FakeQuery;

    async fn new_search(&self, ctx: &SearchContext, query: &str) -> Result<FakeQuery, SearcherError> {
        let query = self.inner.new_search(ctx, query).await?;
        if self.inner.new_search_calls() == self.cancel_on_call {
            let to_search_error = |e: SearchJobsError| SearcherError::Search(e.to_string());
            let jobs = self
                .store
                .list_search_jobs(&ListSearchJobsArgs::default())
                .await
                .map_err(to_search_error)?;
            for job in jobs {
                self.store
                    .cancel_search_job(*job.job().id())
                    .await
                    .map_err(to_search_error)?;
            }
        }
        Ok(query)
    }
}

#[tokio::test]
async fn a_search_job_canceled_while_fanning_out_creates_no_repo_jobs() {
    helpers::with_test_db(|test_db| async move {
        let searcher = CancelingSearcher {
            inner: FakeSearcher::new(),
            store: ExhaustiveSearchStore::new(test_db.test_pool.clone(), TEST_SCHEMA),
            cancel_on_call: 1,
        };
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(searcher, uploads.clone())
            .await
            .unwrap();

        runtime
            .service()
            .create_search_job(1, "1@rev1 2@rev2")
            .await
            .unwrap();
        runtime.run_once().await.unwrap();

        assert_eq!(test_db.states(SEARCH_JOBS_TABLE).await, vec!["canceled"]);
        assert_eq!(test_db.count_rows(REPO_JOBS_TABLE).await, 0);
        assert_eq!(test_db.count_rows(REPO_REVISION_JOBS_TABLE).await, 0);
        assert!(uploads.is_empty().await);
    })
    .await;
}

#[tokio::test]
async fn a_repo_job_canceled_while_fanning_out_creates_no_revision_jobs() {
    helpers::with_test_db(|test_db| async move {
        let searcher = CancelingSearcher {
            inner: FakeSearcher::new(),
            store: ExhaustiveSearchStore::new(test_db.test_pool.clone(), TEST_SCHEMA),
            // The first repo job creates the second search
            cancel_on_call: 2,
        };
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .num_handlers(1)
            .init(searcher, uploads.clone())
            .await
            .unwrap();

        runtime
            .service()
            .create_search_job(1, "1@rev1 2@rev2")
            .await
            .unwrap();
        runtime.run_once().await.unwrap();

        assert_eq!(test_db.states(SEARCH_JOBS_TABLE).await, vec!["completed"]);
        assert_eq!(
            test_db.states(REPO_JOBS_TABLE).await,
            vec!["canceled", "canceled"]
        );
        assert_eq!(test_db.count_rows(REPO_REVISION_JOBS_TABLE).await, 0);
        assert!(uploads.is_empty().await);
    })
    .await;
}

#[tokio::test]
async fn a_failed_fan_out_insert_persists_no_revision_jobs() {
    helpers::with_test_db(|test_db| async move {
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(FakeSearcher::new(), uploads.clone())
            .await
            .unwrap();

        sqlx::query(
            r#"
                create function searchjobs.reject_poisoned_revision() returns trigger as $$
                begin
                    if new.revision = 'poison' then
                        raise exception 'poisoned revision %', new.revision;
                    end if;
                    return new;
                end;
                $$ language plpgsql
            "#,
        )
        .execute(&test_db.test_pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
                create trigger reject_poisoned_revision
                    before insert on searchjobs.exhaustive_search_repo_revision_jobs
                    for each row execute function searchjobs.reject_poisoned_revision()
            "#,
        )
        .execute(&test_db.test_pool)
        .await
        .unwrap();

        // The second revision of repository 1 cannot be inserted.
        let search_job = runtime
            .service()
            .create_search_job(1, "1@rev1 1@poison 2@rev3")
            .await
            .unwrap();
        let search_job_id = *search_job.job().id();
        runtime.run_once().await.unwrap();

        let repo_jobs = runtime.store().list_repo_jobs(search_job_id).await.unwrap();
        let failed = repo_jobs
            .iter()
            .find(|j| *j.repo_id() == 1)
            .expect("Missing repo job");
        assert_eq!(*failed.job().state(), JobState::Failed);
        assert!(failed
            .job()
            .failure_message()
            .as_deref()
            .unwrap_or_default()
            .contains("poisoned revision"));

        let revisions: Vec<String> = runtime
            .store()
            .list_repo_revision_jobs(search_job_id)
            .await
            .unwrap()
            .iter()
            .map(|j| j.revision().clone())
            .collect();
        assert_eq!(revisions, vec!["rev3"]);
        assert_eq!(uploads.len().await, 1);
    })
    .await;
}

#[tokio::test]
async fn errored_revisions_are_retried_until_the_budget_is_spent() {
    helpers::with_test_db(|test_db| async move {
        let searcher = FakeSearcher {
            fail_search_revision: Some("rev1".into()),
            ..FakeSearcher::default()
        };
        let runtime = test_db
            .create_runtime_options()
            .max_num_retries(3)
            .retry_after(Duration::ZERO)
            .init(searcher.clone(), MemoryUploadStore::new())
            .await
            .unwrap();

        let search_job = runtime.service().create_search_job(1, "1@rev1").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            runtime.run_once().await.unwrap();
            if test_db.states(REPO_REVISION_JOBS_TABLE).await == vec!["failed"] {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "revision job never failed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let revision_jobs = runtime
            .store()
            .list_repo_revision_jobs(*search_job.job().id())
            .await
            .unwrap();
        assert_eq!(*revision_jobs[0].job().num_failures(), 3);
        assert!(revision_jobs[0]
            .job()
            .failure_message()
            .as_deref()
            .unwrap_or_default()
            .contains("search of"));
        // One search per stage, three attempts of the last one.
        assert_eq!(searcher.new_search_calls(), 5);
    })
    .await;
}

#[tokio::test]
async fn a_rerun_revision_job_replaces_its_previous_objects() {
    helpers::with_test_db(|test_db| async move {
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(FakeSearcher::new(), uploads.clone())
            .await
            .unwrap();

        let search_job = runtime.service().create_search_job(1, "1@rev1").await.unwrap();
        let search_job_id = *search_job.job().id();
        runtime.search_job_worker().run_once().await.unwrap();
        runtime.repo_job_worker().run_once().await.unwrap();

        let revision_jobs = runtime
            .store()
            .list_repo_revision_jobs(search_job_id)
            .await
            .unwrap();
        let key = format!("{search_job_id}-{}", revision_jobs[0].job().id());
        let neighbour = format!("{key}0");
        // Chunks of an earlier attempt that produced more output.
        for stale in [format!("{key}-1"), format!("{key}-2"), neighbour.clone()] {
            uploads.upload(&stale, b"stale\n".to_vec()).await.unwrap();
        }

        runtime.repo_revision_job_worker().run_once().await.unwrap();

        assert_eq!(
            uploads.list(&format!("{search_job_id}-")).await.unwrap(),
            vec![key.clone(), neighbour]
        );
        assert_eq!(object(&uploads, &key).await, "repo,revision\n1,rev1\n");
    })
    .await;
}

#[tokio::test]
async fn deleting_a_running_search_leaves_no_late_uploads() {
    helpers::with_test_db(|test_db| async move {
        let searcher = FakeSearcher {
            search_delay: Some(Duration::from_secs(1)),
            ignore_cancellation: true,
            ..FakeSearcher::default()
        };
        let uploads = MemoryUploadStore::new();
        let runtime = test_db
            .create_runtime_options()
            .init(searcher, uploads.clone())
            .await
            .unwrap();
        let service = runtime.service();

        let search_job = service.create_search_job(1, "1@rev1").await.unwrap();

        let control = async {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            while test_db.states(REPO_REVISION_JOBS_TABLE).await != vec!["processing"] {
                assert!(tokio::time::Instant::now() < deadline, "revision job never started");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            service.delete_search_job(*search_job.job().id()).await.unwrap();

            // The search only returns after the delete, then uploads its result.
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            while !runtime.repo_revision_job_worker().running_ids().await.is_empty() {
                assert!(tokio::time::Instant::now() < deadline, "search never returned");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            runtime.request_shutdown();
        };

        let (run, ()) = tokio::join!(runtime.run(), control);
        run.expect("Runtime failed");

        assert_eq!(test_db.count_rows(SEARCH_JOBS_TABLE).await, 0);
        assert!(uploads.is_empty().await);
    })
    .await;
}
