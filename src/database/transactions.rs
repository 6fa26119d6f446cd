use chrono::Utc;
use sqlx::types::Json;
use sqlx::QueryBuilder;

use super::Database;
use crate::models::NewTransaction;

impl Database {
    /// Batch-insert transactions with insert-or-ignore semantics.
    ///
    /// The unique `(transaction_id, account_id)` index makes re-fetched
    /// transactions a no-op: existing rows are never updated, only genuinely
    /// new ones inserted. Returns the number of rows actually inserted.
    pub async fn insert_transactions(
        &self,
        rows: &[NewTransaction],
    ) -> Result<u64, sqlx::Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut builder = QueryBuilder::new(
            "INSERT INTO transactions
                 (id, transaction_id, account_id, normalised_provider_transaction_id,
                  provider_transaction_id, timestamp, description, amount, currency,
                  transaction_type, transaction_category, transaction_classification,
                  merchant_name, running_balance, meta, created_at, updated_at) ",
        );

        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(&row.transaction_id)
                .push_bind(&row.account_id)
                .push_bind(&row.normalised_provider_transaction_id)
                .push_bind(&row.provider_transaction_id)
                .push_bind(row.timestamp)
                .push_bind(&row.description)
                .push_bind(row.amount)
                .push_bind(row.currency)
                .push_bind(row.transaction_type)
                .push_bind(&row.transaction_category)
                .push_bind(Json(&row.transaction_classification))
                .push_bind(&row.merchant_name)
                .push_bind(row.running_balance.as_ref().map(Json))
                .push_bind(&row.meta)
                .push_bind(now)
                .push_bind(now);
        });

        builder.push(" ON CONFLICT (transaction_id, account_id) DO NOTHING");

        let result = builder.build().execute(&self.pool()).await?;
        Ok(result.rows_affected())
    }
}
