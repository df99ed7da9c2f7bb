//! SASL PLAIN (RFC 4616) payload encoding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Encode credentials for the PLAIN mechanism: `authzid NUL authcid NUL
/// password`, base64. The authzid is left empty, as IRC servers expect.
pub fn encode_plain(login: &str, password: &str) -> String {
    let payload = format!("\0{login}\0{password}");
    BASE64.encode(payload.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_plain_layout() {
        let encoded = encode_plain("alice", "hunter2");
        let decoded = BASE64.decode(&encoded).unwrap();
        assert_eq!(decoded, b"\0alice\0hunter2");
    }
}
