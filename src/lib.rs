//! Access control for eMRTDs.
//!
//! An engine that authenticates against an eMRTD (Electronic Machine Readable
//! Travel Document) and keeps the resulting secure channel.
//!
//! The `emrtd_eac` crate implements Basic Access Control (BAC), Extended Access
//! Control (Chip Authentication followed by Terminal Authentication) and Active
//! Authentication (AA) as described in ICAO Doc 9303 and BSI TR-03110, on top of
//! 3DES secure messaging. Asymmetric cryptography is done with
//! [`openssl`](https://docs.rs/openssl/latest/openssl/).
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! PACE, AES secure messaging and Passive Authentication are **not** supported.
//!
//! # Quick Start
//!
//! ```no_run
//! use emrtd_eac::{bytes2hex, BacKeySpec, EacError, PassportService};
//! use tracing::{error, info};
//!
//! fn main() -> Result<(), EacError> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     // Establish a PC/SC context.
//!     let ctx = pcsc::Context::establish(pcsc::Scope::User).map_err(EacError::PcscError)?;
//!
//!     // Use the first reader.
//!     let mut readers_buf = [0; 2048];
//!     let mut readers = ctx
//!         .list_readers(&mut readers_buf)
//!         .map_err(EacError::PcscError)?;
//!     let Some(reader) = readers.next() else {
//!         error!("No readers are connected.");
//!         return Ok(());
//!     };
//!     info!("Using reader: {reader:?}");
//!
//!     // Connect to the card.
//!     let card = ctx
//!         .connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
//!         .map_err(EacError::PcscError)?;
//!
//!     let service: PassportService<pcsc::Card> = PassportService::new(card);
//!     service.open()?;
//!     service.do_bac(&BacKeySpec::new("DOCUMENT NUMBER", "YYMMDD", "YYMMDD")?)?;
//!
//!     // Read EF.COM
//!     let ef_com = service.read_file(0x011E)?;
//!     info!("Data from the EF.COM: {}", bytes2hex(&ef_com));
//!
//!     service.close();
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod apdu;
pub mod asymmetric;
mod bac_key;
mod card;
mod config;
pub mod crypto;
pub mod cvc;
mod engine;
mod error;
mod event;
mod secure_messaging;
pub mod service;
pub mod util;

#[cfg(test)]
mod test_support;

pub use apdu::{CommandApdu, ResponseApdu};
pub use bac_key::BacKeySpec;
pub use card::EmrtdCard;
pub use config::{AaDigest, EngineConfig, PsoMode};
pub use crypto::{calculate_check_digit, mrz_information};
pub use cvc::{CvCertificate, Role, TaSignatureAlgorithm};
pub use engine::{
    check_terminal_chain, ChipAuthenticationResult, PassportService, SessionState,
    TerminalAuthenticationResult, TerminalChain,
};
pub use error::{Command, EacError, ErrorKind, Protocol};
pub use event::{AaEvent, AuthEvent, BacEvent, CaEvent, EacEvent, EventSink, TaEvent};
pub use secure_messaging::SecureMessagingWrapper;
pub use service::ApduService;
pub use util::{bytes2hex, int2asn1len};
