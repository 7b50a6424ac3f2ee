use sqlx::{Row, postgres::PgRow};

use super::PostgresAdapter;
use crate::{
    ConsultantProfile, Error,
    notify::{Notification, NotificationSettings},
    payment::PaymentOrder,
    review::Review,
    session::{CancelReason, Session},
};

pub(super) const PROFILE_COLUMNS: &str = "id, display_name, chat_rate, call_rate, available, \
     rating, review_count, created_at, updated_at";

pub(super) const SESSION_COLUMNS: &str = "id, client, consultant, kind, status, rate, channel, \
     requested_at, started_at, ended_at, duration_minutes, charged_amount, waived_amount, \
     cancel_reason, updated_at";

pub(super) const REVIEW_COLUMNS: &str =
    "id, client, consultant, session, rating, comment, created_at, updated_at";

pub(super) const ORDER_COLUMNS: &str =
    "id, account, amount, status, payment_id, entry_id, created_at, paid_at";

pub(super) const NOTIFICATION_COLUMNS: &str =
    "id, account, title, message, category, payload, read, created_at";

fn de(err: sqlx::Error) -> Error {
    Error::Storage(format!("row decode: {err}"))
}

fn unsigned(row: &PgRow, column: &str) -> Result<u64, Error> {
    Ok(row.try_get::<i64, _>(column).map_err(de)? as u64)
}

/// Postgres SQLSTATE for unique violations.
pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

impl PostgresAdapter {
    pub(super) fn map_row_to_profile(row: &PgRow) -> Result<ConsultantProfile, Error> {
        Ok(ConsultantProfile {
            id: row.try_get("id").map_err(de)?,
            display_name: row.try_get("display_name").map_err(de)?,
            chat_rate: unsigned(row, "chat_rate")?,
            call_rate: unsigned(row, "call_rate")?,
            available: row.try_get("available").map_err(de)?,
            rating: row.try_get("rating").map_err(de)?,
            review_count: unsigned(row, "review_count")?,
            created_at: row.try_get("created_at").map_err(de)?,
            updated_at: row.try_get("updated_at").map_err(de)?,
        })
    }

    pub(super) fn map_row_to_session(row: &PgRow) -> Result<Session, Error> {
        let cancel_reason: Option<String> = row.try_get("cancel_reason").map_err(de)?;
        Ok(Session {
            id: row.try_get("id").map_err(de)?,
            client: row.try_get("client").map_err(de)?,
            consultant: row.try_get("consultant").map_err(de)?,
            kind: row.try_get::<String, _>("kind").map_err(de)?.parse()?,
            status: row.try_get::<String, _>("status").map_err(de)?.parse()?,
            rate: unsigned(row, "rate")?,
            channel: row.try_get("channel").map_err(de)?,
            requested_at: row.try_get("requested_at").map_err(de)?,
            started_at: row.try_get("started_at").map_err(de)?,
            ended_at: row.try_get("ended_at").map_err(de)?,
            duration_minutes: unsigned(row, "duration_minutes")?,
            charged_amount: unsigned(row, "charged_amount")?,
            waived_amount: unsigned(row, "waived_amount")?,
            cancel_reason: cancel_reason
                .map(|reason| reason.parse::<CancelReason>())
                .transpose()?,
            updated_at: row.try_get("updated_at").map_err(de)?,
        })
    }

    pub(super) fn map_row_to_review(row: &PgRow) -> Result<Review, Error> {
        Ok(Review {
            id: row.try_get("id").map_err(de)?,
            client: row.try_get("client").map_err(de)?,
            consultant: row.try_get("consultant").map_err(de)?,
            session: row.try_get("session").map_err(de)?,
            rating: row.try_get::<i16, _>("rating").map_err(de)? as u8,
            comment: row.try_get("comment").map_err(de)?,
            created_at: row.try_get("created_at").map_err(de)?,
            updated_at: row.try_get("updated_at").map_err(de)?,
        })
    }

    pub(super) fn map_row_to_notification(row: &PgRow) -> Result<Notification, Error> {
        Ok(Notification {
            id: row.try_get("id").map_err(de)?,
            account: row.try_get("account").map_err(de)?,
            title: row.try_get("title").map_err(de)?,
            message: row.try_get("message").map_err(de)?,
            category: row.try_get::<String, _>("category").map_err(de)?.parse()?,
            payload: row.try_get("payload").map_err(de)?,
            read: row.try_get("read").map_err(de)?,
            created_at: row.try_get("created_at").map_err(de)?,
        })
    }

    pub(super) fn map_row_to_settings(row: &PgRow) -> Result<NotificationSettings, Error> {
        Ok(NotificationSettings {
            account: row.try_get("account").map_err(de)?,
            push_enabled: row.try_get("push_enabled").map_err(de)?,
            chat: row.try_get("chat").map_err(de)?,
            call: row.try_get("call").map_err(de)?,
            payment: row.try_get("payment").map_err(de)?,
            promotional: row.try_get("promotional").map_err(de)?,
        })
    }

    pub(super) fn map_row_to_order(row: &PgRow) -> Result<PaymentOrder, Error> {
        Ok(PaymentOrder {
            id: row.try_get("id").map_err(de)?,
            account: row.try_get("account").map_err(de)?,
            amount: unsigned(row, "amount")?,
            status: row.try_get::<String, _>("status").map_err(de)?.parse()?,
            payment_id: row.try_get("payment_id").map_err(de)?,
            entry_id: row.try_get("entry_id").map_err(de)?,
            created_at: row.try_get("created_at").map_err(de)?,
            paid_at: row.try_get("paid_at").map_err(de)?,
        })
    }
}
