//! Card transport abstraction.

use pcsc::Attribute::AtrString;
use tracing::error;

use crate::EacError;

/// Byte-level channel to an eMRTD chip.
///
/// Implementations only move bytes; status words are interpreted by the
/// layers above.
pub trait EmrtdCard {
    /// Prepares the channel. The default does nothing.
    ///
    /// # Errors
    ///
    /// * `EacError` if the card can not be reached.
    fn open(&mut self) -> Result<(), EacError> {
        Ok(())
    }

    /// Releases the channel. The default does nothing.
    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        true
    }

    /// The card's Answer To Reset, when the transport exposes it.
    fn atr(&self) -> Option<Vec<u8>> {
        None
    }

    /// Sends raw command bytes and returns the raw response, status word included.
    ///
    /// # Errors
    ///
    /// * `EacError` in case of an I/O failure.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, EacError>;
}

impl EmrtdCard for pcsc::Card {
    fn atr(&self) -> Option<Vec<u8>> {
        self.get_attribute_owned(AtrString).ok()
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, EacError> {
        let mut response_buffer = vec![0; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        match pcsc::Card::transmit(self, command, &mut response_buffer) {
            Ok(response) => Ok(response.to_vec()),
            Err(err) => {
                error!("PC/SC transmit failed: {err}");
                Err(EacError::PcscError(err))
            }
        }
    }
}
