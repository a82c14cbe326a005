//! Base64url (no padding) helpers shared by every DTO and store

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::crypto::errors::CryptoResult;

/// Encode bytes as base64url without padding
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a base64url (no padding) string
pub fn decode(data: &str) -> CryptoResult<Vec<u8>> {
    Ok(URL_SAFE_NO_PAD.decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::errors::CryptoError;

    #[test]
    fn test_url_safe_alphabet() {
        let encoded = encode(&[0xfb, 0xff]);
        assert_eq!(encoded, "-_8");
        assert_eq!(decode(&encoded).unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn test_padding_rejected() {
        assert!(matches!(
            decode("-_8="),
            Err(CryptoError::MalformedSerialization(_))
        ));
    }
}
