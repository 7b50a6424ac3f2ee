//! Stock notification texts for marketplace events.
use serde_json::json;

use super::{Category, NotificationDraft};
use crate::session::{Session, SessionKind};

fn session_category(kind: SessionKind) -> Category {
    match kind {
        SessionKind::Chat => Category::Chat,
        SessionKind::Voice | SessionKind::Video => Category::Call,
    }
}

fn session_payload(session: &Session) -> serde_json::Value {
    json!({
        "session_id": session.id,
        "kind": session.kind,
        "status": session.status,
        "channel": session.channel,
    })
}

/// To the consultant when a client opens a chat or places a call.
pub fn session_requested(session: &Session) -> NotificationDraft {
    let (title, message) = match session.kind {
        SessionKind::Chat => ("New chat", "A client started a chat with you."),
        SessionKind::Voice => ("Incoming call", "A client is calling you."),
        SessionKind::Video => ("Incoming video call", "A client is video calling you."),
    };
    NotificationDraft::new(title, message, session_category(session.kind))
        .with_payload(session_payload(session))
}

pub fn call_accepted(session: &Session) -> NotificationDraft {
    NotificationDraft::new(
        "Call accepted",
        "The consultant picked up your call.",
        Category::Call,
    )
    .with_payload(session_payload(session))
}

pub fn session_cancelled(session: &Session) -> NotificationDraft {
    let message = match session.cancel_reason {
        Some(crate::session::CancelReason::Rejected) => "The consultant declined your call.",
        Some(crate::session::CancelReason::RingTimeout) => "The call was not answered.",
        _ => "The session was cancelled before it started.",
    };
    NotificationDraft::new("Session cancelled", message, session_category(session.kind))
        .with_payload(session_payload(session))
}

pub fn session_completed(session: &Session) -> NotificationDraft {
    let message = format!(
        "Your {} session ended after {} minute(s). Charged: {}.",
        session.kind, session.duration_minutes, session.charged_amount
    );
    let mut payload = session_payload(session);
    payload["duration_minutes"] = json!(session.duration_minutes);
    payload["charged_amount"] = json!(session.charged_amount);
    payload["waived_amount"] = json!(session.waived_amount);
    NotificationDraft::new("Session ended", message, session_category(session.kind))
        .with_payload(payload)
}

pub fn payment_received(amount: u64, order_id: &str, balance_after: u64) -> NotificationDraft {
    NotificationDraft::new(
        "Payment successful",
        format!("{amount} was added to your wallet."),
        Category::Payment,
    )
    .with_payload(json!({
        "amount": amount,
        "order_id": order_id,
        "balance": balance_after,
    }))
}

pub fn review_received(rating: u8, session: uuid::Uuid) -> NotificationDraft {
    NotificationDraft::new(
        "New review",
        format!("A client rated your session {rating}/5."),
        Category::Review,
    )
    .with_payload(json!({ "session_id": session, "rating": rating }))
}
