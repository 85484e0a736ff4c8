use crate::{
    error::ClientError,
    types::{ClientCommand, ClientEvent, SessionLifecycleState},
};

/// Session lifecycle state machine driven by client commands.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionLifecycleState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionLifecycleState::SignedOut,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionLifecycleState {
        self.state
    }

    pub fn apply(&mut self, command: &ClientCommand) -> Result<Vec<ClientEvent>, ClientError> {
        use ClientCommand::*;

        match command {
            SignIn => self.transition_from_state(
                SessionLifecycleState::SignedOut,
                SessionLifecycleState::Authenticating,
                "sign_in",
            ),
            SignOut => self.transition_from_any_of(
                &[
                    SessionLifecycleState::Authenticating,
                    SessionLifecycleState::SignedIn,
                    SessionLifecycleState::Conversing,
                ],
                SessionLifecycleState::SignedOut,
                "sign_out",
            ),
            OpenConversation { .. } => self.transition_from_any_of(
                &[
                    SessionLifecycleState::SignedIn,
                    SessionLifecycleState::Conversing,
                ],
                SessionLifecycleState::Conversing,
                "open_conversation",
            ),
            CloseConversation => self.transition_from_state(
                SessionLifecycleState::Conversing,
                SessionLifecycleState::SignedIn,
                "close_conversation",
            ),
            SearchUsers { .. } => {
                if self.is_signed_in_context() {
                    Ok(Vec::new())
                } else {
                    Err(ClientError::invalid_state(self.state, "search_users"))
                }
            }
            SendMessage { .. } | DeleteMessage { .. } | InputActivity { .. } | InputBlurred => {
                if self.state == SessionLifecycleState::Conversing {
                    Ok(Vec::new())
                } else {
                    Err(ClientError::invalid_state(self.state, "conversation command"))
                }
            }
            // Visibility flips can arrive in any state; the runtime ignores
            // them when no session is live.
            VisibilityChanged { .. } => Ok(Vec::new()),
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<ClientEvent, ClientError> {
        if self.state != SessionLifecycleState::Authenticating {
            return Err(ClientError::invalid_state(self.state, "on_auth_result"));
        }

        let next = if success {
            SessionLifecycleState::SignedIn
        } else {
            SessionLifecycleState::SignedOut
        };

        self.state = next;
        Ok(ClientEvent::StateChanged { state: next })
    }

    pub fn on_fatal(&mut self) -> ClientEvent {
        self.state = SessionLifecycleState::Fatal;
        ClientEvent::StateChanged {
            state: SessionLifecycleState::Fatal,
        }
    }

    fn is_signed_in_context(&self) -> bool {
        matches!(
            self.state,
            SessionLifecycleState::SignedIn | SessionLifecycleState::Conversing
        )
    }

    fn transition_from_state(
        &mut self,
        expected: SessionLifecycleState,
        next: SessionLifecycleState,
        action: &str,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        if self.state != expected {
            return Err(ClientError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ClientEvent::StateChanged { state: next }])
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SessionLifecycleState],
        next: SessionLifecycleState,
        action: &str,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        if !expected.contains(&self.state) {
            return Err(ClientError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ClientEvent::StateChanged { state: next }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = SessionStateMachine::default();

        sm.apply(&ClientCommand::SignIn).expect("sign in must work");
        assert_eq!(sm.state(), SessionLifecycleState::Authenticating);

        sm.on_auth_result(true).expect("auth should resolve");
        assert_eq!(sm.state(), SessionLifecycleState::SignedIn);

        sm.apply(&ClientCommand::OpenConversation {
            peer_id: "u-bob".into(),
        })
        .expect("open conversation should work");
        assert_eq!(sm.state(), SessionLifecycleState::Conversing);

        sm.apply(&ClientCommand::CloseConversation)
            .expect("close conversation should work");
        assert_eq!(sm.state(), SessionLifecycleState::SignedIn);

        sm.apply(&ClientCommand::SignOut)
            .expect("sign out should work");
        assert_eq!(sm.state(), SessionLifecycleState::SignedOut);
    }

    #[test]
    fn failed_auth_returns_to_signed_out() {
        let mut sm = SessionStateMachine::default();
        sm.apply(&ClientCommand::SignIn).expect("sign in must work");

        sm.on_auth_result(false).expect("auth result should apply");
        assert_eq!(sm.state(), SessionLifecycleState::SignedOut);
    }

    #[test]
    fn switching_conversations_stays_in_conversing() {
        let mut sm = SessionStateMachine::default();
        sm.apply(&ClientCommand::SignIn).expect("sign in must work");
        sm.on_auth_result(true).expect("auth should resolve");
        sm.apply(&ClientCommand::OpenConversation {
            peer_id: "u-bob".into(),
        })
        .expect("first open should work");

        sm.apply(&ClientCommand::OpenConversation {
            peer_id: "u-carol".into(),
        })
        .expect("switching peers should be legal");
        assert_eq!(sm.state(), SessionLifecycleState::Conversing);
    }

    #[test]
    fn rejects_send_without_active_conversation() {
        let mut sm = SessionStateMachine::default();
        sm.apply(&ClientCommand::SignIn).expect("sign in must work");
        sm.on_auth_result(true).expect("auth should resolve");

        let err = sm
            .apply(&ClientCommand::SendMessage {
                client_txn_id: "tx-1".into(),
                text: "hello".into(),
            })
            .expect_err("send should fail without a conversation");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn rejects_search_when_signed_out() {
        let mut sm = SessionStateMachine::default();
        let err = sm
            .apply(&ClientCommand::SearchUsers {
                query: "ali".into(),
            })
            .expect_err("search should fail when signed out");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn visibility_flips_are_legal_in_any_state() {
        let mut sm = SessionStateMachine::default();
        assert!(
            sm.apply(&ClientCommand::VisibilityChanged { hidden: true })
                .expect("visibility must be accepted")
                .is_empty()
        );
        assert_eq!(sm.state(), SessionLifecycleState::SignedOut);
    }
}
