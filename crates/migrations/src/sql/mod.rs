use sqlx::{Postgres, Transaction};

pub mod m000001;
pub mod m000002;

/// Placeholder replaced by the escaped schema name in every statement.
pub const SCHEMA_PLACEHOLDER: &str = ":SEARCHJOBS_SCHEMA";

pub struct Migration {
    name: &'static str,
    is_breaking: bool,
    pub(crate) stmts: &'static [&'static str],
}

impl Migration {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_breaking(&self) -> bool {
        self.is_breaking
    }

    /// Number parsed from the `m000042` style name, 0 when the name is malformed.
    pub fn migration_number(&self) -> u32 {
        self.name
            .trim_start_matches('m')
            .parse()
            .unwrap_or_default()
    }

    pub async fn execute<'e>(
        &self,
        tx: &mut Transaction<'e, Postgres>,
        escaped_schema: &str,
    ) -> Result<(), sqlx::Error> {
        for stmt in self.stmts {
            let stmt = stmt.replace(SCHEMA_PLACEHOLDER, escaped_schema);
            sqlx::query(&stmt).execute(&mut **tx).await?;
        }

        Ok(())
    }
}

pub const SEARCHJOBS_MIGRATIONS: &[Migration] =
    &[m000001::M000001_MIGRATION, m000002::M000002_MIGRATION];
