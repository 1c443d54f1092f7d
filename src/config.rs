//! Protocol engine settings.

use openssl::hash::MessageDigest;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::{crypto::sha1, EacError};

/// How `PSO:VERIFY CERTIFICATE` transports certificates longer than a short APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PsoMode {
    /// One command with extended length Lc.
    #[default]
    ExtendedLength,
    /// ISO 7816-4 command chaining in 223-byte blocks.
    Chained,
}

/// Digest used by Active Authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AaDigest {
    #[default]
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl AaDigest {
    #[must_use]
    pub const fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Hashes `data`.
    ///
    /// # Errors
    ///
    /// * `EacError` if SHA-1 detects a collision attack.
    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, EacError> {
        Ok(match self {
            Self::Sha1 => sha1(data)?.to_vec(),
            Self::Sha224 => Sha224::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        })
    }

    #[must_use]
    pub fn message_digest(self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha224 => MessageDigest::sha224(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// Settings for [`crate::PassportService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Resend the BAC mutual authentication without Le when the card rejects
    /// `Le = 40` with `6700` or `6Cxx`.
    pub mutual_auth_le_fallback: bool,
    pub pso_mode: PsoMode,
    pub aa_digest: AaDigest,
    /// Select the eMRTD application when the session is opened.
    pub select_applet_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mutual_auth_le_fallback: true,
            pso_mode: PsoMode::default(),
            aa_digest: AaDigest::default(),
            select_applet_on_open: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn with_mutual_auth_le_fallback(mut self, enabled: bool) -> Self {
        self.mutual_auth_le_fallback = enabled;
        self
    }

    #[must_use]
    pub const fn with_pso_mode(mut self, pso_mode: PsoMode) -> Self {
        self.pso_mode = pso_mode;
        self
    }

    #[must_use]
    pub const fn with_aa_digest(mut self, aa_digest: AaDigest) -> Self {
        self.aa_digest = aa_digest;
        self
    }

    #[must_use]
    pub const fn with_select_applet_on_open(mut self, enabled: bool) -> Self {
        self.select_applet_on_open = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.mutual_auth_le_fallback);
        assert!(config.select_applet_on_open);
        assert_eq!(config.pso_mode, PsoMode::ExtendedLength);
        assert_eq!(config.aa_digest, AaDigest::Sha1);

        let config = config
            .with_pso_mode(PsoMode::Chained)
            .with_mutual_auth_le_fallback(false);
        assert_eq!(config.pso_mode, PsoMode::Chained);
        assert!(!config.mutual_auth_le_fallback);
    }

    #[test]
    fn test_aa_digest() -> Result<(), EacError> {
        assert_eq!(
            AaDigest::Sha1.digest(b"abc")?,
            hex!("A9993E364706816ABA3E25717850C26C9CD0D89D")
        );
        for digest in [
            AaDigest::Sha1,
            AaDigest::Sha224,
            AaDigest::Sha256,
            AaDigest::Sha384,
            AaDigest::Sha512,
        ] {
            assert_eq!(digest.digest(b"abc")?.len(), digest.output_len());
            assert_eq!(digest.message_digest().size(), digest.output_len());
        }
        Ok(())
    }
}
