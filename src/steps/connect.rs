use std::borrow::Cow;
use std::sync::Arc;

use anyhow::Result;

use crate::communicator::{Communicator, ConnectionConfig};
use crate::context::BuildContext;
use crate::error::QcbakeError;
use crate::state::{StateBag, StateKey, StateValue};
use crate::step::{Step, StepAction, finish, halt_if_cancelled};

/// Computes the remote access parameters from the bag at connect time.
pub type ConnectionResolver = fn(&StateBag) -> Result<ConnectionConfig, QcbakeError>;

/// Waits for the instance to accept a login and opens the session.
///
/// Reads whatever the resolver needs (addresses and credentials). Writes
/// `session`.
pub struct ConnectRemote {
    communicator: Arc<dyn Communicator>,
    resolve: ConnectionResolver,
}

impl ConnectRemote {
    pub fn new(communicator: Arc<dyn Communicator>, resolve: ConnectionResolver) -> Self {
        Self {
            communicator,
            resolve,
        }
    }

    fn connect(&self, ctx: &BuildContext, state: &StateBag) -> Result<()> {
        let config = (self.resolve)(state)?;
        state.ui().say(&format!(
            "Connecting to {}@{}:{}",
            config.username, config.host, config.port
        ));
        let session = self.communicator.connect(ctx, &config)?;
        state.put(StateKey::Session, StateValue::Session(session));
        Ok(())
    }
}

impl Step for ConnectRemote {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("connect_remote")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.connect(ctx, state))
    }

    fn cleanup(&self, state: &StateBag) -> Result<()> {
        match state.take(StateKey::Session) {
            Some(StateValue::Session(session)) => session.disconnect(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Loopback {
        disconnects: Mutex<usize>,
    }

    struct LoopbackSession(Arc<Loopback>);

    impl crate::communicator::Session for LoopbackSession {
        fn host(&self) -> &str {
            "10.0.0.2"
        }

        fn execute(&self, _command: &str) -> Result<ExecutionResult> {
            Ok(ExecutionResult { status: None })
        }

        fn disconnect(&self) -> Result<()> {
            *self.0.disconnects.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct LoopbackCommunicator(Arc<Loopback>);

    impl Communicator for LoopbackCommunicator {
        fn connect(
            &self,
            _ctx: &BuildContext,
            _config: &ConnectionConfig,
        ) -> Result<Arc<dyn crate::communicator::Session>> {
            Ok(Arc::new(LoopbackSession(self.0.clone())))
        }
    }

    fn fixed(_state: &StateBag) -> Result<ConnectionConfig, QcbakeError> {
        Ok(ConnectionConfig {
            host: "10.0.0.2".to_string(),
            port: 22,
            username: "root".to_string(),
            auth: Vec::new(),
            timeout: Duration::from_secs(1),
        })
    }

    fn unresolvable(_state: &StateBag) -> Result<ConnectionConfig, QcbakeError> {
        Err(QcbakeError::AddressResolution("no usable address".to_string()))
    }

    #[test]
    fn session_is_stored_and_disconnected_once() {
        let loopback = Arc::new(Loopback::default());
        let step = ConnectRemote::new(Arc::new(LoopbackCommunicator(loopback.clone())), fixed);
        let state = StateBag::new();

        assert_eq!(step.run(&BuildContext::new(), &state), StepAction::Continue);
        assert_eq!(state.session().unwrap().host(), "10.0.0.2");
        step.cleanup(&state).unwrap();
        step.cleanup(&state).unwrap();
        assert_eq!(*loopback.disconnects.lock().unwrap(), 1);
    }

    #[test]
    fn resolution_failure_halts_with_typed_error() {
        let step = ConnectRemote::new(
            Arc::new(LoopbackCommunicator(Arc::new(Loopback::default()))),
            unresolvable,
        );
        let state = StateBag::new();

        assert_eq!(step.run(&BuildContext::new(), &state), StepAction::Halt);
        assert!(matches!(
            *state.error().unwrap().unwrap(),
            QcbakeError::AddressResolution(_)
        ));
        step.cleanup(&state).unwrap();
    }
}
