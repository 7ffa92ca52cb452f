//! Query message of the simple query protocol.

use crate::protocol::codec::MessageBuilder;

/// Write a Query message.
///
/// `query` may hold several statements separated by semicolons; the server
/// answers each in turn before a single ReadyForQuery.
pub fn write_query(buf: &mut Vec<u8>, query: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::QUERY);
    msg.write_cstr(query);
    msg.finish();
}
