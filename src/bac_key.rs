//! BAC access key built from the printed MRZ fields.

use core::fmt;

use crate::{
    crypto::{compute_key_seed, mrz_information, KEY_SEED_LEN},
    EacError,
};

/// Document number, date of birth and date of expiry (both `YYMMDD`).
///
/// The document number is trimmed and padded with `<` to nine characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BacKeySpec {
    document_number: String,
    date_of_birth: String,
    date_of_expiry: String,
}

impl BacKeySpec {
    /// # Errors
    ///
    /// * `EacError` if a field is malformed for check digit computation.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_eac::EacError;
    /// # fn main() -> Result<(), EacError> {
    /// use emrtd_eac::BacKeySpec;
    /// let key = BacKeySpec::new(" L898902C ", "690806", "940623")?;
    /// assert_eq!(key.document_number(), "L898902C<");
    /// #     Ok(())
    /// # }
    /// ```
    pub fn new(
        document_number: &str,
        date_of_birth: &str,
        date_of_expiry: &str,
    ) -> Result<Self, EacError> {
        let document_number = format!("{:<<9}", document_number.trim());
        // Validates every field before the key is accepted.
        mrz_information(&document_number, date_of_birth, date_of_expiry)?;
        Ok(Self {
            document_number,
            date_of_birth: date_of_birth.to_owned(),
            date_of_expiry: date_of_expiry.to_owned(),
        })
    }

    #[must_use]
    pub fn document_number(&self) -> &str {
        &self.document_number
    }

    #[must_use]
    pub fn date_of_birth(&self) -> &str {
        &self.date_of_birth
    }

    #[must_use]
    pub fn date_of_expiry(&self) -> &str {
        &self.date_of_expiry
    }

    /// # Errors
    ///
    /// * `EacError` if hashing fails.
    pub fn key_seed(&self) -> Result<[u8; KEY_SEED_LEN], EacError> {
        compute_key_seed(
            &self.document_number,
            &self.date_of_birth,
            &self.date_of_expiry,
        )
    }
}

impl fmt::Display for BacKeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}",
            self.document_number, self.date_of_birth, self.date_of_expiry
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_bac_key_spec() -> Result<(), EacError> {
        let key = BacKeySpec::new("L898902C", "690806", "940623")?;
        assert_eq!(key.document_number(), "L898902C<");
        assert_eq!(key.to_string(), "L898902C<, 690806, 940623");
        assert_eq!(key.key_seed()?, hex!("239AB9CB282DAF66231DC5A4DF6BFBAE"));
        Ok(())
    }

    #[test]
    fn test_bac_key_spec_rejects_bad_fields() {
        assert!(BacKeySpec::new("L898902C", "69-806", "940623").is_err());
        assert!(BacKeySpec::new("l898902c", "690806", "940623").is_err());
        assert!(BacKeySpec::new("L898902C", "690806", "9406230").is_err());
    }
}
