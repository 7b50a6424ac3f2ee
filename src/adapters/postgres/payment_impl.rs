use chrono::{DateTime, Utc};
use ledger::ExecutionPlan;
use ledger::adapters::postgres::apply_plan_tx;

use super::PostgresAdapter;
use super::helper::{ORDER_COLUMNS, is_unique_violation};
use crate::{Error, adapters::OrderWrite, payment::PaymentOrder};

impl PostgresAdapter {
    pub(super) async fn insert_order_row(&self, order: &PaymentOrder) -> Result<(), Error> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO payment_orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(&order.id)
        .bind(order.account)
        .bind(order.amount as i64)
        .bind(order.status.as_str())
        .bind(&order.payment_id)
        .bind(order.entry_id)
        .bind(order.created_at)
        .bind(order.paid_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "order {} already exists",
                order.id
            ))),
            // foreign key on ledger_accounts
            Err(e)
                if e.as_database_error()
                    .and_then(|db| db.code())
                    .is_some_and(|code| code == "23503") =>
            {
                Err(Error::not_found("account", order.account))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(super) async fn fetch_order_row(&self, id: &str) -> Result<Option<PaymentOrder>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM payment_orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_row_to_order).transpose()
    }

    pub(super) async fn settle_order_tx(
        &self,
        id: &str,
        payment_id: &str,
        plan: &ExecutionPlan,
        now: DateTime<Utc>,
    ) -> Result<OrderWrite, Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM payment_orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("order {id}")))?;
        let current = Self::map_row_to_order(&row)?;
        if current.is_paid() {
            tx.rollback().await?;
            return Ok(OrderWrite::AlreadyPaid(current));
        }

        let entry = match apply_plan_tx(&mut tx, plan).await {
            Ok(mut entries) => entries.pop(),
            Err(err) => {
                tx.rollback().await.ok();
                return Err(err.into());
            }
        }
        .ok_or_else(|| Error::Storage(format!("order {id} settled without an entry")))?;

        let order = current.paid(payment_id, entry.id, now);
        let updated = sqlx::query(
            r#"
            UPDATE payment_orders
            SET status = $2, payment_id = $3, entry_id = $4, paid_at = $5
            WHERE id = $1
            "#,
        )
        .bind(&order.id)
        .bind(order.status.as_str())
        .bind(&order.payment_id)
        .bind(order.entry_id)
        .bind(order.paid_at)
        .execute(&mut *tx)
        .await;

        match updated {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.ok();
                return Err(Error::Conflict(format!(
                    "payment {payment_id} already settled another order"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(OrderWrite::Paid { order, entry })
    }
}
