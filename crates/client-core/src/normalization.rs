use crate::{
    error::ClientError,
    types::{ClientEvent, DeleteAck, SendAck},
};

/// Internal helper describing a send outcome before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and the backend assigned a message id.
    Accepted { message_id: String },
    /// Send failed with client error details.
    Rejected { error: ClientError },
}

/// Convert a send outcome to a stable `ClientEvent::SendAck`.
pub fn normalize_send_outcome(
    client_txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> ClientEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Accepted { message_id } => ClientEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Rejected { error } => ClientEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert a delete outcome to a stable `ClientEvent::DeleteAck`.
pub fn normalize_delete_outcome(
    message_id: impl Into<String>,
    outcome: Result<(), ClientError>,
) -> ClientEvent {
    ClientEvent::DeleteAck(DeleteAck {
        message_id: message_id.into(),
        error_code: outcome.err().map(|error| error.code),
    })
}

/// Convert an error into a `FatalError` client event.
pub fn normalize_fatal_error(error: ClientError, recoverable: bool) -> ClientEvent {
    ClientEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_accepted_send_to_ack() {
        let event = normalize_send_outcome(
            "txn-1",
            SendOutcome::Accepted {
                message_id: "m-0001".into(),
            },
        );

        match event {
            ClientEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.message_id.as_deref(), Some("m-0001"));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_rejected_send_to_ack_with_stable_code() {
        let event = normalize_send_outcome(
            "txn-2",
            SendOutcome::Rejected {
                error: ClientError::validation("empty_message", "nothing to send"),
            },
        );

        match event {
            ClientEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-2");
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("empty_message"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_delete_outcomes_to_acks() {
        match normalize_delete_outcome("m-0001", Ok(())) {
            ClientEvent::DeleteAck(ack) => {
                assert_eq!(ack.message_id, "m-0001");
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        match normalize_delete_outcome(
            "m-0002",
            Err(ClientError::validation(
                "not_message_sender",
                "only the sender may delete",
            )),
        ) {
            ClientEvent::DeleteAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("not_message_sender"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
