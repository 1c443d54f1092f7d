//! Notifications emitted by [`crate::PassportService`] after authentication steps.

use crate::SecureMessagingWrapper;

/// Basic Access Control completed; carries the new secure channel.
#[derive(Debug, Clone)]
pub struct BacEvent {
    pub rnd_icc: [u8; 8],
    pub rnd_ifd: [u8; 8],
    pub k_icc: [u8; 16],
    pub k_ifd: [u8; 16],
    pub wrapper: SecureMessagingWrapper,
}

/// Chip Authentication completed; the session switched to `wrapper`.
#[derive(Debug, Clone)]
pub struct CaEvent {
    pub key_id: Option<u64>,
    pub key_hash: Vec<u8>,
    pub terminal_public_key: Vec<u8>,
    pub wrapper: SecureMessagingWrapper,
}

/// Terminal Authentication outcome.
#[derive(Debug, Clone)]
pub struct TaEvent {
    pub ca_reference: String,
    /// Holder references of the certificates sent to the card, in order.
    pub certificate_holders: Vec<String>,
    pub card_challenge: Vec<u8>,
    pub success: bool,
}

/// Combined outcome of `do_eac`.
#[derive(Debug, Clone)]
pub struct EacEvent {
    pub document_number: String,
    pub ca: Option<CaEvent>,
    pub ta: Option<TaEvent>,
    pub success: bool,
}

/// Active Authentication outcome.
#[derive(Debug, Clone)]
pub struct AaEvent {
    pub challenge: [u8; 8],
    /// Recovered ISO 9796-2 message part, empty for ECDSA.
    pub recovered_message: Vec<u8>,
    pub success: bool,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AuthEvent {
    Bac(BacEvent),
    Ca(CaEvent),
    Ta(TaEvent),
    Eac(EacEvent),
    Aa(AaEvent),
}

/// Callback receiving [`AuthEvent`]s. It runs after the session lock is released.
pub type EventSink = Box<dyn FnMut(&AuthEvent) + Send>;
