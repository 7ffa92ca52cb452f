//! Connection startup and authentication state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::{AuthenticationMessage, BackendKeyData, BackendMessage};
use crate::protocol::frontend::{md5_password, write_password, write_ssl_request, write_startup};
use crate::protocol::types::TransactionStatus;

use super::StateMachine;
use super::action::Action;

/// Lifecycle phase of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet
    Disconnected,
    /// Transport open, startup not finished
    Connecting,
    /// Encryption upgrade in progress
    TlsNegotiating,
    /// Waiting for the authentication exchange to finish
    Authenticating,
    /// Idle and able to run a query
    Ready,
    /// A query was sent and its ReadyForQuery has not arrived
    QueryInFlight,
    /// Terminated; no further use possible
    Closed,
}

/// Internal state of the startup exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingSslResponse,
    SslHandshake,
    WaitingAuth,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Connection startup state machine.
///
/// Drives the optional SSL request, the StartupMessage, the password
/// exchange and the parameter/key messages up to the first ReadyForQuery.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: State,
    options: Opts,
    ssl_response: Option<u8>,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
}

impl ConnectionStateMachine {
    /// Create a new connection state machine.
    pub fn new(options: Opts) -> Self {
        Self {
            state: State::Initial,
            options,
            ssl_response: None,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Phase of the exchange as seen by the connection handle.
    pub fn phase(&self) -> ConnectionState {
        match self.state {
            State::Initial => ConnectionState::Connecting,
            State::WaitingSslResponse | State::SslHandshake => ConnectionState::TlsNegotiating,
            State::WaitingAuth | State::WaitingAuthResult | State::WaitingReady => {
                ConnectionState::Authenticating
            }
            State::Ready => ConnectionState::Ready,
            State::Failed => ConnectionState::Closed,
        }
    }

    /// Hand over the raw byte answering the SSL request.
    pub fn set_ssl_response(&mut self, response: u8) {
        self.ssl_response = Some(response);
    }

    /// Get the backend key data (for cancellation).
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get server parameters.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Take the server parameters reported during startup.
    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    fn transition(&mut self, next: State) {
        tracing::debug!(from = ?self.state, to = ?next, "startup");
        self.state = next;
    }

    fn write_startup_message(&self, buf: &mut Vec<u8>) {
        let opts = &self.options;
        let mut params: Vec<(&str, &str)> = vec![
            ("user", &opts.user),
            ("database", &opts.database),
            ("client_encoding", &opts.client_encoding),
        ];

        if let Some(app) = &opts.application_name {
            params.push(("application_name", app));
        }

        for (name, value) in &opts.params {
            params.push((name, value));
        }

        buf.clear();
        write_startup(buf, &params);
    }

    fn password(&self) -> Result<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn advance(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self.state {
            State::Initial => {
                buffer_set.write_buffer.clear();
                if self.options.ssl_root_cert.is_some() {
                    write_ssl_request(&mut buffer_set.write_buffer);
                    self.transition(State::WaitingSslResponse);
                    return Ok(Action::WriteAndReadByte);
                }
                self.write_startup_message(&mut buffer_set.write_buffer);
                self.transition(State::WaitingAuth);
                Ok(Action::Write)
            }
            State::WaitingSslResponse => {
                let response = self
                    .ssl_response
                    .take()
                    .ok_or_else(|| Error::Protocol("SSL response byte was not provided".into()))?;
                match response {
                    b'S' => {
                        self.transition(State::SslHandshake);
                        Ok(Action::TlsHandshake)
                    }
                    b'N' => Err(Error::Tls(
                        "server does not support encrypted connections".into(),
                    )),
                    other => Err(Error::Tls(format!(
                        "unexpected response {:#04x} to SSL request",
                        other
                    ))),
                }
            }
            State::SslHandshake => {
                self.write_startup_message(&mut buffer_set.write_buffer);
                self.transition(State::WaitingAuth);
                Ok(Action::Write)
            }
            State::WaitingAuth | State::WaitingAuthResult | State::WaitingReady => loop {
                let Some(msg) = buffer_set.next_message()? else {
                    return Ok(Action::ReadMessage);
                };
                if let Some(action) = self.handle_message(msg, buffer_set)? {
                    return Ok(action);
                }
            },
            State::Ready => Ok(Action::Finished),
            State::Failed => Err(Error::InvalidUsage(
                "connection startup already failed".into(),
            )),
        }
    }

    /// Returns the next action, or `None` to keep consuming messages.
    fn handle_message(
        &mut self,
        msg: BackendMessage,
        buffer_set: &mut BufferSet,
    ) -> Result<Option<Action>> {
        match msg {
            BackendMessage::ErrorResponse(err) => {
                let is_auth_failure = err.code().is_some_and(|code| code.starts_with("28"));
                if is_auth_failure {
                    return Err(Error::Auth(err.fields.to_string()));
                }
                Err(err.into_error())
            }
            BackendMessage::NoticeResponse(notice) => {
                tracing::warn!("{}", notice.fields);
                Ok(None)
            }
            BackendMessage::ParameterStatus(param) => {
                match self.server_params.iter_mut().find(|(n, _)| *n == param.name) {
                    Some(entry) => entry.1 = param.value,
                    None => self.server_params.push((param.name, param.value)),
                }
                Ok(None)
            }
            BackendMessage::Authentication(auth) => self.handle_auth(auth, buffer_set),
            BackendMessage::BackendKeyData(key) if self.state == State::WaitingReady => {
                self.backend_key = Some(key);
                Ok(None)
            }
            BackendMessage::ReadyForQuery(ready) if self.state == State::WaitingReady => {
                self.transaction_status = ready.status;
                self.transition(State::Ready);
                Ok(Some(Action::Finished))
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message during startup in state {:?}: {:?}",
                self.state, other
            ))),
        }
    }

    fn handle_auth(
        &mut self,
        auth: AuthenticationMessage,
        buffer_set: &mut BufferSet,
    ) -> Result<Option<Action>> {
        match (self.state, auth) {
            (State::WaitingAuth | State::WaitingAuthResult, AuthenticationMessage::Ok) => {
                self.transition(State::WaitingReady);
                Ok(None)
            }
            (State::WaitingAuth, AuthenticationMessage::CleartextPassword) => {
                buffer_set.write_buffer.clear();
                write_password(&mut buffer_set.write_buffer, self.password()?);
                self.transition(State::WaitingAuthResult);
                Ok(Some(Action::Write))
            }
            (State::WaitingAuth, AuthenticationMessage::Md5Password { salt }) => {
                let hashed = md5_password(&self.options.user, self.password()?, &salt);
                buffer_set.write_buffer.clear();
                write_password(&mut buffer_set.write_buffer, &hashed);
                self.transition(State::WaitingAuthResult);
                Ok(Some(Action::Write))
            }
            (State::WaitingAuth, AuthenticationMessage::Other(code)) => Err(Error::Auth(format!(
                "unsupported authentication method (code {})",
                code
            ))),
            (state, auth) => Err(Error::Auth(format!(
                "unexpected authentication request {:?} in state {:?}",
                auth, state
            ))),
        }
    }
}

impl StateMachine for ConnectionStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let result = self.advance(buffer_set);
        if result.is_err() {
            self.transition(State::Failed);
        }
        result
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn auth(code: i32, extra: &[u8]) -> Vec<u8> {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(extra);
        frame(b'R', &payload)
    }

    fn ready_sequence() -> Vec<u8> {
        let mut out = frame(b'S', b"server_version\x0016.2\0");
        let mut key = 42u32.to_be_bytes().to_vec();
        key.extend_from_slice(&7u32.to_be_bytes());
        out.extend(frame(b'K', &key));
        out.extend(frame(b'Z', b"I"));
        out
    }

    fn opts() -> Opts {
        Opts {
            user: "u".into(),
            password: Some("p".into()),
            ..Opts::default()
        }
    }

    #[test]
    fn test_trust_auth() {
        let mut sm = ConnectionStateMachine::new(opts());
        let mut buffers = BufferSet::new();

        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Write);
        assert_eq!(&buffers.write_buffer[4..8], &[0, 3, 0, 0]);
        buffers.write_buffer.clear();

        assert_eq!(sm.step(&mut buffers).unwrap(), Action::ReadMessage);
        assert_eq!(sm.phase(), ConnectionState::Authenticating);

        buffers.reader.extend(&auth(0, &[]));
        buffers.reader.extend(&ready_sequence());
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
        assert_eq!(sm.phase(), ConnectionState::Ready);
        assert_eq!(sm.backend_key().map(|k| k.process_id()), Some(42));
        assert_eq!(
            sm.server_params(),
            &[("server_version".to_string(), "16.2".to_string())]
        );
    }

    #[test]
    fn test_md5_auth() {
        let mut sm = ConnectionStateMachine::new(opts());
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.write_buffer.clear();

        buffers.reader.extend(&auth(5, &[1, 2, 3, 4]));
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Write);
        let expected = md5_password("u", "p", &[1, 2, 3, 4]);
        assert_eq!(buffers.write_buffer[0], b'p');
        assert_eq!(&buffers.write_buffer[5..], format!("{expected}\0").as_bytes());
        buffers.write_buffer.clear();

        assert_eq!(sm.step(&mut buffers).unwrap(), Action::ReadMessage);
        buffers.reader.extend(&auth(0, &[]));
        buffers.reader.extend(&ready_sequence());
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
    }

    #[test]
    fn test_cleartext_auth_sends_raw_password() {
        let mut sm = ConnectionStateMachine::new(opts());
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();

        buffers.reader.extend(&auth(3, &[]));
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Write);
        assert_eq!(&buffers.write_buffer[5..], b"p\0");
    }

    #[test]
    fn test_missing_password() {
        let mut sm = ConnectionStateMachine::new(Opts {
            password: None,
            ..opts()
        });
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();

        buffers.reader.extend(&auth(3, &[]));
        assert!(matches!(sm.step(&mut buffers), Err(Error::Auth(_))));
        assert_eq!(sm.phase(), ConnectionState::Closed);
    }

    #[test]
    fn test_sasl_is_unsupported() {
        let mut sm = ConnectionStateMachine::new(opts());
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();

        buffers.reader.extend(&auth(10, b"SCRAM-SHA-256\0\0"));
        let err = sm.step(&mut buffers).unwrap_err();
        assert!(matches!(err, Error::Auth(msg) if msg.contains("unsupported")));
    }

    #[test]
    fn test_invalid_password_is_auth_error() {
        let mut sm = ConnectionStateMachine::new(opts());
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.reader.extend(&auth(3, &[]));
        sm.step(&mut buffers).unwrap();

        buffers.reader.extend(&frame(
            b'E',
            b"SFATAL\0C28P01\0Mpassword authentication failed for user \"u\"\0\0",
        ));
        let err = sm.step(&mut buffers).unwrap_err();
        assert!(matches!(err, Error::Auth(msg) if msg.contains("password authentication failed")));
    }

    #[test]
    fn test_other_startup_error_is_server_error() {
        let mut sm = ConnectionStateMachine::new(opts());
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();

        buffers.reader.extend(&frame(
            b'E',
            b"SFATAL\0C3D000\0Mdatabase \"nope\" does not exist\0\0",
        ));
        let err = sm.step(&mut buffers).unwrap_err();
        assert_eq!(err.sqlstate(), Some("3D000"));
    }

    #[test]
    fn test_ssl_negotiation() {
        let with_ssl = || Opts {
            ssl_root_cert: Some("/tmp/root.crt".into()),
            ..opts()
        };

        let mut sm = ConnectionStateMachine::new(with_ssl());
        let mut buffers = BufferSet::new();
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::WriteAndReadByte);
        assert_eq!(buffers.write_buffer.len(), 8);
        assert_eq!(sm.phase(), ConnectionState::TlsNegotiating);
        sm.set_ssl_response(b'S');
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::TlsHandshake);
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Write);
        assert_eq!(&buffers.write_buffer[4..8], &[0, 3, 0, 0]);

        let mut sm = ConnectionStateMachine::new(with_ssl());
        sm.step(&mut buffers).unwrap();
        sm.set_ssl_response(b'N');
        let err = sm.step(&mut buffers).unwrap_err();
        assert!(matches!(err, Error::Tls(msg) if msg == "server does not support encrypted connections"));

        let mut sm = ConnectionStateMachine::new(with_ssl());
        sm.step(&mut buffers).unwrap();
        sm.set_ssl_response(b'E');
        assert!(matches!(sm.step(&mut buffers), Err(Error::Tls(_))));
    }

    #[test]
    fn test_unexpected_message() {
        let mut sm = ConnectionStateMachine::new(opts());
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();

        buffers.reader.extend(&frame(b'C', b"SELECT 1\0"));
        assert!(matches!(sm.step(&mut buffers), Err(Error::Protocol(_))));
    }
}
