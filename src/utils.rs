use sqlx::{query_scalar, Executor, Postgres};

use crate::errors::Result;

/// Quotes `identifier` the way PostgreSQL would when formatting it with `%I`.
pub async fn escape_identifier<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    identifier: &str,
) -> Result<String> {
    let escaped_identifier = query_scalar::<_, String>("select format('%I', $1::text)")
        .bind(identifier)
        .fetch_one(executor)
        .await?;

    Ok(escaped_identifier)
}
