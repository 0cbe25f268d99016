use std::time::Duration;

use helpers::{with_test_db, TEST_SCHEMA};
use searchjobs_migrations::{migrate, sql::SEARCHJOBS_MIGRATIONS, MigrateError};
use sqlx::postgres::PgListener;
use sqlx::{query, query_scalar};

mod helpers;

#[tokio::test]
async fn migration_install_schema_and_second_migration_does_not_harm() {
    with_test_db(|test_db| async move {
        migrate(&test_db.test_pool, TEST_SCHEMA)
            .await
            .expect("Failed to migrate");

        let migration_ids: Vec<i32> =
            query_scalar("select id from searchjobs.migrations order by id")
                .fetch_all(&test_db.test_pool)
                .await
                .unwrap();
        assert_eq!(migration_ids.len(), SEARCHJOBS_MIGRATIONS.len());
        assert_eq!(migration_ids[0], 1);

        let store = test_db.create_store().await;
        store.create_search_job(1, "1@main").await.unwrap();

        for _ in 0..3 {
            migrate(&test_db.test_pool, TEST_SCHEMA)
                .await
                .expect("Failed to migrate");
        }

        assert_eq!(test_db.count_rows("exhaustive_search_jobs").await, 1);
    })
    .await;
}

#[tokio::test]
async fn migration_refuses_unknown_breaking_revisions() {
    with_test_db(|test_db| async move {
        migrate(&test_db.test_pool, TEST_SCHEMA).await.unwrap();

        query("insert into searchjobs.migrations (id, breaking) values (999999, true)")
            .execute(&test_db.test_pool)
            .await
            .unwrap();

        let err = migrate(&test_db.test_pool, TEST_SCHEMA).await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::IncompatibleRevision {
                latest_breaking_migration: 999999,
                ..
            }
        ));
    })
    .await;
}

#[tokio::test]
async fn inserts_notify_the_stage_channel() {
    with_test_db(|test_db| async move {
        let store = test_db.create_store().await;

        let mut listener = PgListener::connect_with(&test_db.test_pool).await.unwrap();
        listener
            .listen("exhaustive_search_jobs:insert")
            .await
            .unwrap();

        store.create_search_job(1, "1@main").await.unwrap();

        let notification = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .expect("No notification received")
            .unwrap();
        assert_eq!(notification.channel(), "exhaustive_search_jobs:insert");
    })
    .await;
}

#[tokio::test]
async fn updates_touch_updated_at() {
    with_test_db(|test_db| async move {
        let store = test_db.create_store().await;
        let job = store.create_search_job(1, "1@main").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.cancel_search_job(*job.job().id()).await.unwrap();

        let updated = store
            .get_search_job(*job.job().id())
            .await
            .unwrap()
            .unwrap();
        assert!(updated.job().updated_at() > job.job().updated_at());
        assert_eq!(updated.job().created_at(), job.job().created_at());
    })
    .await;
}
