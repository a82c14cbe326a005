//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::prekeys::PreKeyConfig;
use crate::crypto::ratchet::{RatchetConfig, MAX_SKIPPED_MESSAGES_CEILING};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub prekeys: PreKeyConfig,
    pub ratchet: RatchetConfig,
}

impl CryptoConfig {
    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> CryptoResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CryptoResult<()> {
        if self.prekeys.replenish_batch_size == 0 {
            return Err(CryptoError::InvalidState(
                "prekeys.replenish_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.prekeys.pre_key_max_age_days <= 0 {
            return Err(CryptoError::InvalidState(
                "prekeys.pre_key_max_age_days must be greater than zero".to_string(),
            ));
        }
        if self.ratchet.max_skipped_messages == 0 {
            return Err(CryptoError::InvalidState(
                "ratchet.max_skipped_messages must be greater than zero".to_string(),
            ));
        }
        if self.ratchet.max_skipped_messages > MAX_SKIPPED_MESSAGES_CEILING {
            return Err(CryptoError::InvalidState(format!(
                "ratchet.max_skipped_messages must be at most {}",
                MAX_SKIPPED_MESSAGES_CEILING
            )));
        }
        Ok(())
    }
}
