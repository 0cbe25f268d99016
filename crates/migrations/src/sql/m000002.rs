use indoc::indoc;

use super::Migration;

/// Insert notifications wake idle workers instead of waiting for the next poll.
pub const M000002_MIGRATION: Migration = Migration {
    name: "m000002",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create function :SEARCHJOBS_SCHEMA.tg_exhaustive_search__notify_insert() returns trigger as $$
            begin
                perform pg_notify(tg_table_name || ':insert', '');
                return null;
            end;
            $$ language plpgsql;
        "#},
        indoc! {r#"
            create trigger _900_notify_insert
                after insert on :SEARCHJOBS_SCHEMA.exhaustive_search_jobs
                for each statement
                execute procedure :SEARCHJOBS_SCHEMA.tg_exhaustive_search__notify_insert();
        "#},
        indoc! {r#"
            create trigger _900_notify_insert
                after insert on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_jobs
                for each statement
                execute procedure :SEARCHJOBS_SCHEMA.tg_exhaustive_search__notify_insert();
        "#},
        indoc! {r#"
            create trigger _900_notify_insert
                after insert on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_revision_jobs
                for each statement
                execute procedure :SEARCHJOBS_SCHEMA.tg_exhaustive_search__notify_insert();
        "#},
        indoc! {r#"
            create function :SEARCHJOBS_SCHEMA.tg_exhaustive_search__touch_updated_at() returns trigger as $$
            begin
                new.updated_at = now();
                return new;
            end;
            $$ language plpgsql;
        "#},
        indoc! {r#"
            create trigger _100_touch_updated_at
                before update on :SEARCHJOBS_SCHEMA.exhaustive_search_jobs
                for each row
                execute procedure :SEARCHJOBS_SCHEMA.tg_exhaustive_search__touch_updated_at();
        "#},
        indoc! {r#"
            create trigger _100_touch_updated_at
                before update on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_jobs
                for each row
                execute procedure :SEARCHJOBS_SCHEMA.tg_exhaustive_search__touch_updated_at();
        "#},
        indoc! {r#"
            create trigger _100_touch_updated_at
                before update on :SEARCHJOBS_SCHEMA.exhaustive_search_repo_revision_jobs
                for each row
                execute procedure :SEARCHJOBS_SCHEMA.tg_exhaustive_search__touch_updated_at();
        "#},
    ],
};
