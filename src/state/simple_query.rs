//! Simple query protocol state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::protocol::backend::BackendMessage;
use crate::protocol::frontend::write_query;
use crate::protocol::types::TransactionStatus;
use crate::result::{QueryResult, ResultAccumulator};
use crate::types::TypeRegistry;

use super::StateMachine;
use super::action::Action;

/// Simple query state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingResponse,
    Finished,
}

/// Simple query protocol state machine.
///
/// Sends one `Query` frame and reads until ReadyForQuery. Every
/// CommandComplete closes one [`QueryResult`], so a query string with several
/// statements yields several results. After an ErrorResponse the remaining
/// messages are drained and the error is returned once ReadyForQuery arrives,
/// leaving the connection usable.
#[derive(Debug)]
pub struct SimpleQueryStateMachine<'a> {
    state: State,
    sql: &'a str,
    registry: &'a TypeRegistry,
    current: Option<ResultAccumulator>,
    results: Vec<QueryResult>,
    error: Option<Error>,
    parameter_changes: Vec<(String, String)>,
    transaction_status: TransactionStatus,
}

impl<'a> SimpleQueryStateMachine<'a> {
    /// Create a new simple query state machine.
    pub fn new(sql: &'a str, registry: &'a TypeRegistry) -> Self {
        Self {
            state: State::Initial,
            sql,
            registry,
            current: None,
            results: Vec::new(),
            error: None,
            parameter_changes: Vec::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Returns true once the server's ReadyForQuery has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Completed results, one per statement, in order.
    pub fn into_results(self) -> Vec<QueryResult> {
        self.results
    }

    /// ParameterStatus updates received during the query.
    pub fn take_parameter_changes(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.parameter_changes)
    }

    /// Remember the first error of the cycle; later ones only get logged.
    fn record_error(&mut self, err: Error) {
        self.current = None;
        match &self.error {
            None => self.error = Some(err),
            Some(_) => tracing::debug!("additional error while draining: {}", err),
        }
    }

    fn handle_message(&mut self, msg: BackendMessage) -> Result<Option<Action>> {
        match msg {
            BackendMessage::RowDescription(desc) => {
                if self.error.is_none() {
                    let mut acc = ResultAccumulator::new();
                    acc.row_description(desc.fields);
                    self.current = Some(acc);
                }
            }
            BackendMessage::DataRow(row) => {
                if self.error.is_none() {
                    let acc = self.current.as_mut().ok_or_else(|| {
                        Error::Protocol("DataRow without RowDescription".into())
                    })?;
                    if let Err(e) = acc.data_row(row, self.registry) {
                        if e.is_connection_broken() {
                            return Err(e);
                        }
                        self.record_error(e);
                    }
                }
            }
            BackendMessage::CommandComplete(complete) => {
                if self.error.is_none() {
                    let acc = self.current.take().unwrap_or_default();
                    self.results.push(acc.command_complete(&complete.tag));
                }
            }
            BackendMessage::EmptyQueryResponse => {
                tracing::debug!("empty query");
            }
            BackendMessage::ErrorResponse(err) => {
                let err = err.into_error();
                if err.is_connection_broken() {
                    return Err(err);
                }
                self.record_error(err);
            }
            BackendMessage::NoticeResponse(notice) => {
                tracing::warn!("{}", notice.fields);
            }
            BackendMessage::ParameterStatus(param) => {
                tracing::debug!(name = %param.name, value = %param.value, "parameter changed");
                self.parameter_changes.push((param.name, param.value));
            }
            BackendMessage::ReadyForQuery(ready) => {
                self.transaction_status = ready.status;
                self.state = State::Finished;
                if let Some(err) = self.error.take() {
                    return Err(err);
                }
                return Ok(Some(Action::Finished));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected message in query response: {:?}",
                    other
                )));
            }
        }
        Ok(None)
    }
}

impl StateMachine for SimpleQueryStateMachine<'_> {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self.state {
            State::Initial => {
                buffer_set.write_buffer.clear();
                write_query(&mut buffer_set.write_buffer, self.sql);
                self.state = State::WaitingResponse;
                Ok(Action::Write)
            }
            State::WaitingResponse => loop {
                let Some(msg) = buffer_set.next_message()? else {
                    return Ok(Action::ReadMessage);
                };
                if let Some(action) = self.handle_message(msg)? {
                    return Ok(action);
                }
            },
            State::Finished => Ok(Action::Finished),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;
    use crate::types::Value;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
        let mut payload = (columns.len() as u16).to_be_bytes().to_vec();
        for (name, type_oid) in columns {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0u32.to_be_bytes());
            payload.extend_from_slice(&0i16.to_be_bytes());
            payload.extend_from_slice(&type_oid.to_be_bytes());
            payload.extend_from_slice(&(-1i16).to_be_bytes());
            payload.extend_from_slice(&(-1i32).to_be_bytes());
            payload.extend_from_slice(&0u16.to_be_bytes());
        }
        frame(b'T', &payload)
    }

    fn data_row(values: &[Option<&str>]) -> Vec<u8> {
        let mut payload = (values.len() as u16).to_be_bytes().to_vec();
        for value in values {
            match value {
                Some(v) => {
                    payload.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    payload.extend_from_slice(v.as_bytes());
                }
                None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        frame(b'D', &payload)
    }

    fn complete(tag: &str) -> Vec<u8> {
        frame(b'C', format!("{tag}\0").as_bytes())
    }

    fn start<'a>(sql: &'a str, registry: &'a TypeRegistry, buffers: &mut BufferSet) -> SimpleQueryStateMachine<'a> {
        let mut sm = SimpleQueryStateMachine::new(sql, registry);
        assert_eq!(sm.step(buffers).unwrap(), Action::Write);
        assert_eq!(buffers.write_buffer[0], b'Q');
        buffers.write_buffer.clear();
        sm
    }

    #[test]
    fn test_select_rows() {
        let registry = TypeRegistry::standard();
        let mut buffers = BufferSet::new();
        let mut sm = start("SELECT id, name FROM t", &registry, &mut buffers);

        assert_eq!(sm.step(&mut buffers).unwrap(), Action::ReadMessage);

        buffers.reader.extend(&row_description(&[("id", oid::INT4), ("name", oid::TEXT)]));
        buffers.reader.extend(&data_row(&[Some("1"), Some("a")]));
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::ReadMessage);

        buffers.reader.extend(&data_row(&[Some("2"), None]));
        buffers.reader.extend(&complete("SELECT 2"));
        buffers.reader.extend(&frame(b'Z', b"I"));
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
        assert!(sm.is_finished());

        let results = sm.into_results();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.command(), Some("SELECT"));
        assert_eq!(result.row_count(), Some(2));
        assert_eq!(result.rows()[0].get("id"), Some(&Value::Int(1)));
        assert_eq!(result.rows()[1].get("name"), Some(&Value::Null));
    }

    #[test]
    fn test_error_drains_to_ready() {
        let registry = TypeRegistry::standard();
        let mut buffers = BufferSet::new();
        let mut sm = start("SELECT * FROM missing", &registry, &mut buffers);

        buffers.reader.extend(&frame(
            b'E',
            b"SERROR\0VERROR\0C42P01\0Mrelation \"missing\" does not exist\0\0",
        ));
        // Error is held until ReadyForQuery
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::ReadMessage);
        assert!(!sm.is_finished());

        buffers.reader.extend(&frame(b'Z', b"I"));
        let err = sm.step(&mut buffers).unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(!err.is_connection_broken());
        assert!(sm.is_finished());
        assert!(buffers.reader.is_empty());
    }

    #[test]
    fn test_multi_statement() {
        let registry = TypeRegistry::standard();
        let mut buffers = BufferSet::new();
        let mut sm = start("INSERT ...; SELECT 1 AS n", &registry, &mut buffers);

        buffers.reader.extend(&complete("INSERT 0 1"));
        buffers.reader.extend(&row_description(&[("n", oid::INT4)]));
        buffers.reader.extend(&data_row(&[Some("1")]));
        buffers.reader.extend(&complete("SELECT 1"));
        buffers.reader.extend(&frame(b'Z', b"T"));
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
        assert_eq!(sm.transaction_status(), TransactionStatus::InTransaction);

        let results = sm.into_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].command(), Some("INSERT"));
        assert_eq!(results[0].oid(), Some(0));
        assert_eq!(results[0].row_count(), Some(1));
        assert_eq!(results[1].rows()[0].get("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_notice_and_parameter_status_are_informational() {
        let registry = TypeRegistry::standard();
        let mut buffers = BufferSet::new();
        let mut sm = start("SET TimeZone = 'UTC'", &registry, &mut buffers);

        buffers.reader.extend(&frame(b'N', b"SWARNING\0Mheads up\0\0"));
        buffers.reader.extend(&frame(b'S', b"TimeZone\0UTC\0"));
        buffers.reader.extend(&complete("SET"));
        buffers.reader.extend(&frame(b'Z', b"I"));
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
        assert_eq!(
            sm.take_parameter_changes(),
            vec![("TimeZone".to_string(), "UTC".to_string())]
        );
    }

    #[test]
    fn test_empty_query() {
        let registry = TypeRegistry::standard();
        let mut buffers = BufferSet::new();
        let mut sm = start("", &registry, &mut buffers);

        buffers.reader.extend(&frame(b'I', b""));
        buffers.reader.extend(&frame(b'Z', b"I"));
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
        assert!(sm.into_results().is_empty());
    }

    #[test]
    fn test_decode_error_still_drains() {
        let registry = TypeRegistry::standard();
        let mut buffers = BufferSet::new();
        let mut sm = start("SELECT 'x'::int", &registry, &mut buffers);

        buffers.reader.extend(&row_description(&[("n", oid::INT4)]));
        buffers.reader.extend(&data_row(&[Some("not a number")]));
        buffers.reader.extend(&complete("SELECT 1"));
        buffers.reader.extend(&frame(b'Z', b"I"));
        let err = sm.step(&mut buffers).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(sm.is_finished());
    }

    #[test]
    fn test_fatal_error_returns_immediately() {
        let registry = TypeRegistry::standard();
        let mut buffers = BufferSet::new();
        let mut sm = start("SELECT 1", &registry, &mut buffers);

        buffers.reader.extend(&frame(
            b'E',
            b"SFATAL\0VFATAL\0C57P01\0Mterminating connection due to administrator command\0\0",
        ));
        let err = sm.step(&mut buffers).unwrap_err();
        assert!(err.is_connection_broken());
        assert!(!sm.is_finished());
    }
}
