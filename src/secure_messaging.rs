//! 3DES secure messaging as used after BAC and Chip Authentication.
//!
//! For more details and examples, see ICAO Doc 9303-11 Section 9.8 and Appendix D.4
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use core::fmt;

use constant_time_eq::constant_time_eq;
use tracing::{error, trace};

use crate::{
    apdu::{CommandApdu, ResponseApdu, CLA_SECURE_MESSAGING, INS_READ_BINARY2, SW_NO_ERROR},
    crypto::{compute_mac, decrypt_3des, derive_key, encrypt_3des, pad, unpad, KeyType},
    util::{bytes2hex, get_asn1_child, int2asn1len},
    EacError,
};

const TAG_CRYPTOGRAM_PADDED: u8 = 0x87;
const TAG_CRYPTOGRAM: u8 = 0x85;
const TAG_EXPECTED_LENGTH: u8 = 0x97;
const TAG_STATUS_WORD: u8 = 0x99;
const TAG_CHECKSUM: u8 = 0x8E;
const PADDING_INDICATOR: u8 = 0x01;

/// Wraps command APDUs and unwraps response APDUs for a secure channel.
///
/// Every wrap and every unwrap advances the send sequence counter by one,
/// whether or not the operation succeeds afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct SecureMessagingWrapper {
    ks_enc: [u8; 24],
    ks_mac: [u8; 24],
    ssc: u64,
}

impl fmt::Debug for SecureMessagingWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMessagingWrapper")
            .field("ssc", &format_args!("{:016X}", self.ssc))
            .finish_non_exhaustive()
    }
}

impl SecureMessagingWrapper {
    #[must_use]
    pub const fn new(ks_enc: [u8; 24], ks_mac: [u8; 24], ssc: u64) -> Self {
        Self {
            ks_enc,
            ks_mac,
            ssc,
        }
    }

    /// Derives both session keys from a key seed: the BAC seed or the Chip
    /// Authentication shared secret.
    ///
    /// # Errors
    ///
    /// * `EacError` if the seed is empty.
    pub fn from_key_seed(key_seed: &[u8], ssc: u64) -> Result<Self, EacError> {
        Ok(Self::new(
            derive_key(key_seed, KeyType::Encryption)?,
            derive_key(key_seed, KeyType::Mac)?,
            ssc,
        ))
    }

    #[must_use]
    pub const fn enc_key(&self) -> &[u8; 24] {
        &self.ks_enc
    }

    #[must_use]
    pub const fn mac_key(&self) -> &[u8; 24] {
        &self.ks_mac
    }

    #[must_use]
    pub const fn send_sequence_counter(&self) -> u64 {
        self.ssc
    }

    /// Advances the counter, wrapping around at the 8-byte boundary.
    fn increment_ssc(&mut self) -> [u8; 8] {
        self.ssc = self.ssc.wrapping_add(1);
        self.ssc.to_be_bytes()
    }

    /// Protects `command`.
    ///
    /// The result carries the masked class byte, a DO'87 (or DO'85 for
    /// `READ BINARY` with odd INS) cryptogram, a DO'97 when Ne is non-zero and
    /// the DO'8E checksum, and always requests 256 response bytes.
    ///
    /// # Errors
    ///
    /// * `EacError` if a cipher operation fails.
    pub fn wrap(&mut self, command: &CommandApdu) -> Result<CommandApdu, EacError> {
        let ssc = self.increment_ssc();

        let masked_header = [
            command.cla() | CLA_SECURE_MESSAGING,
            command.ins(),
            command.p1(),
            command.p2(),
        ];

        let mut do85_87 = Vec::new();
        if !command.data().is_empty() {
            let ciphertext = encrypt_3des(&self.ks_enc, &pad(command.data()))?;
            if command.ins() == INS_READ_BINARY2 {
                do85_87.push(TAG_CRYPTOGRAM);
                do85_87.extend(int2asn1len(ciphertext.len()));
            } else {
                do85_87.push(TAG_CRYPTOGRAM_PADDED);
                do85_87.extend(int2asn1len(ciphertext.len() + 1));
                do85_87.push(PADDING_INDICATOR);
            }
            do85_87.extend(ciphertext);
        }

        let mut do97 = Vec::new();
        if command.ne() > 0 {
            // Truncation keeps the low bytes, so 256 and 65536 encode as zero.
            let ne = command.ne();
            do97.push(TAG_EXPECTED_LENGTH);
            if ne <= 0x100 {
                do97.extend([0x01, ne as u8]);
            } else {
                do97.push(0x02);
                do97.extend((ne as u16).to_be_bytes());
            }
        }

        let mac_input = pad(&[&ssc[..], &pad(&masked_header), &do85_87, &do97].concat());
        let mac = compute_mac(&self.ks_mac, &mac_input)?;

        let mut data = Vec::with_capacity(do85_87.len() + do97.len() + 10);
        data.extend(do85_87);
        data.extend(do97);
        data.extend([TAG_CHECKSUM, 0x08]);
        data.extend(mac);

        let wrapped = CommandApdu::new(
            masked_header[0],
            masked_header[1],
            masked_header[2],
            masked_header[3],
        )
        .with_data(data)
        .with_ne(256);
        trace!(
            "Wrapped APDU with SSC {}: {}",
            bytes2hex(&ssc),
            bytes2hex(&wrapped.to_bytes()?)
        );
        Ok(wrapped)
    }

    /// Verifies and decrypts a protected response.
    ///
    /// A response consisting of a bare error status word is returned
    /// unchanged, the card having aborted secure messaging. A bare `9000`
    /// is rejected.
    ///
    /// # Returns
    ///
    /// The plain response: decrypted data and the status word from DO'99,
    /// or the outer status word when DO'99 is absent.
    ///
    /// # Errors
    ///
    /// * `EacError::VerifyMacError` if the checksum does not match.
    /// * `EacError::MalformedSecureResponse` if the data objects are malformed.
    pub fn unwrap(&mut self, response: &[u8]) -> Result<ResponseApdu, EacError> {
        let ssc = self.increment_ssc();
        let response = ResponseApdu::from_bytes(response)?;
        let data = response.data();

        if data.is_empty() {
            if response.sw() == SW_NO_ERROR {
                error!("Card answered without secure messaging objects");
                return Err(EacError::MalformedSecureResponse(
                    "unprotected success status",
                ));
            }
            trace!(
                "Card aborted secure messaging with status {:04X}",
                response.sw()
            );
            return Ok(response);
        }

        let mut cryptogram: Option<&[u8]> = None;
        let mut status: Option<u16> = None;
        let mut checksum: Option<(&[u8], usize)> = None;

        let mut rest = data;
        while !rest.is_empty() {
            let offset = data.len() - rest.len();
            let tag = rest[0];
            let (value, next) = get_asn1_child(rest, 1).map_err(|_| {
                error!("Truncated data object in protected response: {}", bytes2hex(data));
                EacError::MalformedSecureResponse("truncated data object")
            })?;
            match tag {
                TAG_CRYPTOGRAM_PADDED => match value.split_first() {
                    Some((&PADDING_INDICATOR, ciphertext)) => cryptogram = Some(ciphertext),
                    _ => {
                        error!("DO'87 lacks the padding indicator: {}", bytes2hex(value));
                        return Err(EacError::MalformedSecureResponse(
                            "DO'87 lacks the padding indicator",
                        ));
                    }
                },
                TAG_CRYPTOGRAM => cryptogram = Some(value),
                TAG_STATUS_WORD => {
                    let &[sw1, sw2] = value else {
                        error!("DO'99 must hold two bytes, found {}", bytes2hex(value));
                        return Err(EacError::MalformedSecureResponse(
                            "DO'99 must hold two bytes",
                        ));
                    };
                    status = Some(u16::from_be_bytes([sw1, sw2]));
                }
                TAG_CHECKSUM => {
                    if value.len() != 8 {
                        error!("DO'8E must hold eight bytes, found {}", bytes2hex(value));
                        return Err(EacError::MalformedSecureResponse(
                            "DO'8E must hold eight bytes",
                        ));
                    }
                    checksum = Some((value, offset));
                    break;
                }
                _ => {
                    error!("Tag {tag:02X} not supported in protected response");
                    return Err(EacError::MalformedSecureResponse(
                        "unsupported data object",
                    ));
                }
            }
            rest = next;
        }

        let Some((checksum, checksum_offset)) = checksum else {
            error!("Protected response has no DO'8E: {}", bytes2hex(data));
            return Err(EacError::MalformedSecureResponse("missing DO'8E"));
        };

        let mac_input = pad(&[&ssc[..], &data[..checksum_offset]].concat());
        let mac = compute_mac(&self.ks_mac, &mac_input)?;
        if !constant_time_eq(&mac, checksum) {
            error!("MAC verification failed");
            return Err(EacError::VerifyMacError());
        }

        let plain = match cryptogram {
            Some(ciphertext) => {
                let padded = decrypt_3des(&self.ks_enc, ciphertext).map_err(|err| {
                    error!("Can not decrypt protected response: {err}");
                    EacError::MalformedSecureResponse("cryptogram is not block aligned")
                })?;
                unpad(&padded)?.to_vec()
            }
            None => Vec::new(),
        };

        let sw = status.unwrap_or_else(|| response.sw());
        trace!("Unwrapped response ({sw:04X}): {}", bytes2hex(&plain));
        Ok(ResponseApdu::new(plain, sw))
    }
}
