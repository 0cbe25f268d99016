use indoc::indoc;

use super::Migration;

pub const M000001_MIGRATION: Migration = Migration {
    name: "m000001",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create table :SEARCHJOBS_SCHEMA.exhaustive_search_jobs (
                id bigserial primary key,
                state text not null default 'queued',
                failure_message text,
                queued_at timestamptz not null default now(),
                started_at timestamptz,
                finished_at timestamptz,
                process_after timestamptz,
                num_resets integer not null default 0,
                num_failures integer not null default 0,
                last_heartbeat_at timestamptz,
                execution_logs jsonb,
                worker_hostname text not null default '',
                cancel boolean not null default false,
                created_at timestamptz not null default now(),
                updated_at timestamptz not null default now(),
                initiator_id integer not null,
                query text not null,
                constraint exhaustive_search_jobs_state_check check (
                    state in ('queued', 'processing', 'completed', 'errored', 'failed', 'canceled')
                )
            );
        "#},
        indoc! {r#"
            create table :SEARCHJOBS_SCHEMA.exhaustive_search_repo_jobs (
                id bigserial primary key,
                state text not null default 'queued',
                failure_message text,
                queued_at timestamptz not null default now(),
                started_at timestamptz,
                finished_at timestamptz,
                process_after timestamptz,
                num_resets integer not null default 0,
                num_failures integer not null default 0,
                last_heartbeat_at timestamptz,
                execution_logs jsonb,
                worker_hostname text not null default '',
                cancel boolean not null default false,
                created_at timestamptz not null default now(),
                updated_at timestamptz not null default now(),
                search_job_id bigint not null
                    references :SEARCHJOBS_SCHEMA.exhaustive_search_jobs (id) on delete cascade,
                repo_id integer not null,
                ref_spec text not null,
                constraint exhaustive_search_repo_jobs_state_check check (
                    state in ('queued', 'processing', 'completed', 'errored', 'failed', 'canceled')
                )
            );
        "#},
        indoc! {r#"
            create table :SEARCHJOBS_SCHEMA.exhaustive_search_repo_revision_jobs (
                id bigserial primary key,
                state text not null default 'queued',
                failure_message text,
                queued_at timestamptz not null default now(),
                started_at timestamptz,
                finished_at timestamptz,
                process_after timestamptz,
                num_resets integer not null default 0,
                num_failures integer not null default 0,
                last_heartbeat_at timestamptz,
                execution_logs jsonb,
                worker_hostname text not null default '',
                cancel boolean not null default false,
                created_at timestamptz not null default now(),
                updated_at timestamptz not null default now(),
                search_repo_job_id bigint not null
                    references :SEARCHJOBS_SCHEMA.exhaustive_search_repo_jobs (id) on delete cascade,
                revision text not null,
                constraint exhaustive_search_repo_revision_jobs_state_check check (
                    state in ('queued', 'processing', 'completed', 'errored', 'failed', 'canceled')
                )
            );
        "#},
        indoc! {r#"
            create index exhaustive_search_jobs_state_idx
                on :SEARCHJOBS_SCHEMA.exhaustive_search_jobs (state, process_after, queued_at, id);
        "#},
        indoc! {r#"
            create index exhaustive_search_jobs_initiator_id_idx
                on :SEARCHJOBS_SCHEMA.exhaustive_search_jobs (initiator_id);
        "#},
        indoc! {r#"
            create index exhaustive_search_repo_jobs_state_idx
                on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_jobs (state, process_after, queued_at, id);
        "#},
        indoc! {r#"
            create index exhaustive_search_repo_jobs_search_job_id_idx
                on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_jobs (search_job_id);
        "#},
        indoc! {r#"
            create index exhaustive_search_repo_revision_jobs_state_idx
                on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_revision_jobs (state, process_after, queued_at, id);
        "#},
        indoc! {r#"
            create index exhaustive_search_repo_revision_jobs_search_repo_job_id_idx
                on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_revision_jobs (search_repo_job_id);
        "#},
    ],
};
