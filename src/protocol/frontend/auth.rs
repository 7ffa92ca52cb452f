//! Authentication messages.

use md5::{Digest, Md5};

use crate::protocol::codec::MessageBuilder;

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Compute MD5 password hash.
///
/// PostgreSQL MD5 password format: "md5" + md5(md5(password + username) + salt),
/// where the inner digest is hex-encoded before hashing again.
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    // First hash: md5(password + username)
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let first_hash_hex = format!("{:x}", hasher.finalize());

    // Second hash: md5(first_hash_hex + salt)
    let mut hasher = Md5::new();
    hasher.update(first_hash_hex.as_bytes());
    hasher.update(salt);

    format!("md5{:x}", hasher.finalize())
}
