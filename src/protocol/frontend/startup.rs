//! Untagged startup-family messages and Terminate.

use crate::protocol::codec::MessageBuilder;

/// Protocol 3.0: major version in the high half, minor in the low half.
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Magic version number of an SSLRequest (`1234 << 16 | 5679`).
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Write an SSLRequest.
///
/// The server answers with one unframed byte: `S` to proceed with a TLS
/// handshake or `N` to refuse.
pub fn write_ssl_request(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(SSL_REQUEST_CODE);
    msg.finish();
}

/// Write a StartupMessage carrying `params` as name/value pairs.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(PROTOCOL_VERSION);
    for (name, value) in params {
        msg.write_cstr(name);
        msg.write_cstr(value);
    }
    msg.write_u8(0);
    msg.finish();
}

/// Write a Terminate message.
pub fn write_terminate(buf: &mut Vec<u8>) {
    MessageBuilder::new(buf, super::msg_type::TERMINATE).finish();
}
