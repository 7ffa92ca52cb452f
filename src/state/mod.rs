//! Sans-I/O state machines for PostgreSQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! They produce `Action` values that tell the caller what to do next.

pub mod action;
pub mod connection;
pub mod simple_query;

pub use action::Action;
pub use connection::ConnectionStateMachine;
pub use simple_query::SimpleQueryStateMachine;

use crate::buffer_set::BufferSet;
use crate::error::Result;
use crate::protocol::types::TransactionStatus;

/// A protocol exchange driven by the caller's I/O loop.
pub trait StateMachine {
    /// Advance as far as the buffered input allows.
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action>;

    /// Transaction status from the last ReadyForQuery.
    fn transaction_status(&self) -> TransactionStatus;
}
