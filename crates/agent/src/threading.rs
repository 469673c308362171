use courier_storage::Session;

/// Correlation id for mail that `session` sends to `to`.
///
/// Replying to whoever opened the session threads onto the session itself;
/// replying to the sender of the latest inbound mail threads onto that mail;
/// anything else is a new request made on behalf of the session.
pub fn correlation_for(session: &Session, to: &str) -> String {
    if to == session.original_sender {
        return session.session_id.clone();
    }
    match (&session.last_sender, &session.last_inbound_id) {
        (Some(sender), Some(inbound)) if sender == to => inbound.clone(),
        _ => session.session_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Message;

    #[test]
    fn test_reply_to_originator_uses_session_id() {
        let m1 = Message::new("User", "Planner", "", "plan it").with_id("M1");
        let mut session = Session::new("Planner", &m1);
        session.record_inbound(&m1);
        assert_eq!(correlation_for(&session, "User"), "M1");
    }

    #[test]
    fn test_new_request_uses_session_id() {
        let m1 = Message::new("User", "Planner", "", "plan it").with_id("M1");
        let mut session = Session::new("Planner", &m1);
        session.record_inbound(&m1);
        assert_eq!(correlation_for(&session, "Coder"), "M1");
    }

    #[test]
    fn test_reply_to_last_sender_uses_inbound_id() {
        let m1 = Message::new("User", "Planner", "", "plan it").with_id("M1");
        let mut session = Session::new("Planner", &m1);
        session.record_inbound(&m1);
        let m3 = Message::new("Coder", "Planner", "", "question?").with_id("M3");
        session.record_inbound(&m3);
        assert_eq!(correlation_for(&session, "Coder"), "M3");
    }
}
