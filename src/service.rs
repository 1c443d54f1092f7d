//! ISO 7816-4, ICAO 9303 and BSI TR-03110 command encodings.
//!
//! [`ApduService`] builds each command, protects it with the secure messaging
//! wrapper when one is given, and maps the returned status word onto an
//! [`EacError`] naming the failing step.

use constant_time_eq::constant_time_eq;
use tracing::{error, trace, warn};

use crate::{
    apdu::{
        CommandApdu, ResponseApdu, CLA_COMMAND_CHAINING, CLA_ISO7816, INS_EXTERNAL_AUTHENTICATE,
        INS_GENERAL_AUTHENTICATE, INS_GET_CHALLENGE, INS_INTERNAL_AUTHENTICATE, INS_MSE, INS_PSO,
        INS_READ_BINARY, INS_READ_BINARY2, INS_SELECT, SW_COMMAND_NOT_ALLOWED,
        SW_CONDITIONS_NOT_SATISFIED, SW_END_OF_FILE, SW_FILE_NOT_FOUND, SW_NO_ERROR,
        SW_SECURITY_STATUS_NOT_SATISFIED, SW_WRONG_LENGTH,
    },
    card::EmrtdCard,
    config::PsoMode,
    crypto::{compute_mac, decrypt_3des, encrypt_3des, pad},
    error::Command,
    secure_messaging::SecureMessagingWrapper,
    util::{bytes2hex, unwrap_do, wrap_do},
    EacError,
};

/// ICAO "International AID" of the eMRTD application.
pub const EMRTD_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Largest block sent per command when `PSO:VERIFY CERTIFICATE` is chained.
pub const PSO_BLOCK_SIZE: usize = 223;

const TAG_OFFSET: u8 = 0x54;
const TAG_DISCRETIONARY_DATA: u8 = 0x53;
const TAG_DYNAMIC_AUTHENTICATION_DATA: u8 = 0x7C;
const TAG_CRYPTOGRAPHIC_MECHANISM: u8 = 0x80;
const TAG_PUBLIC_KEY_REFERENCE: u8 = 0x83;
const TAG_PRIVATE_KEY_REFERENCE: u8 = 0x84;

const MUTUAL_AUTH_RESPONSE_LEN: usize = 40;

/// Largest offset a short `READ BINARY` (`B0`) can address in P1-P2.
const MAX_SHORT_OFFSET: usize = 0x7FFF;

/// Stateless command layer over a borrowed card.
///
/// Every method takes the secure messaging wrapper to use, `None` sending the
/// command in plain.
pub struct ApduService<'c, C: EmrtdCard> {
    card: &'c mut C,
}

impl<'c, C: EmrtdCard> ApduService<'c, C> {
    pub fn new(card: &'c mut C) -> Self {
        Self { card }
    }

    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>, EacError> {
        trace!("Sending APDU: {}", bytes2hex(command));
        let response = self.card.transmit(command)?;
        trace!("APDU response: {}", bytes2hex(&response));
        Ok(response)
    }

    /// Sends `command`, wrapping it and unwrapping the response when a
    /// wrapper is given. The status word is not interpreted.
    ///
    /// # Errors
    ///
    /// * `EacError` if the transport fails or the protected response does not verify.
    pub fn transmit(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        command: &CommandApdu,
    ) -> Result<ResponseApdu, EacError> {
        match wrapper {
            Some(wrapper) => {
                let wrapped = wrapper.wrap(command)?;
                let response = self.exchange(&wrapped.to_bytes()?)?;
                let response = wrapper.unwrap(&response)?;
                trace!(
                    "Unwrapped response ({:04X}): {}",
                    response.sw(),
                    bytes2hex(response.data())
                );
                Ok(response)
            }
            None => ResponseApdu::from_bytes(&self.exchange(&command.to_bytes()?)?),
        }
    }

    /// Sends `command` and requires `9000`.
    fn send_checked(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        step: Command,
        command: &CommandApdu,
    ) -> Result<Vec<u8>, EacError> {
        let response = self.transmit(wrapper, command)?;
        check_status(step, &response)?;
        Ok(response.into_data())
    }

    /// `SELECT` by DF name (`00 A4 04 0C`).
    ///
    /// # Errors
    ///
    /// * `EacError::FileNotFound` or `EacError::AccessDenied` as reported by the card.
    pub fn select_applet(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        aid: &[u8],
    ) -> Result<(), EacError> {
        let command = CommandApdu::new(CLA_ISO7816, INS_SELECT, 0x04, 0x0C).with_data(aid);
        let response = self.transmit(wrapper, &command)?;
        check_file_status(Command::SelectApplet, &response)
    }

    /// `SELECT` an elementary file by identifier (`00 A4 02 0C`).
    ///
    /// # Errors
    ///
    /// * `EacError::FileNotFound` or `EacError::AccessDenied` as reported by the card.
    pub fn select_file(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        fid: u16,
    ) -> Result<(), EacError> {
        let command =
            CommandApdu::new(CLA_ISO7816, INS_SELECT, 0x02, 0x0C).with_data(fid.to_be_bytes());
        let response = self.transmit(wrapper, &command)?;
        check_file_status(Command::SelectFile, &response)
    }

    /// Reads up to `le` bytes of the selected file at `offset`.
    ///
    /// Short reads use `B0` with the offset in P1-P2. Extended reads use
    /// `B1` with a DO'54 offset and request room for the DO'53 header, which
    /// is stripped from the returned data. The card answering `6282` makes
    /// the read repeat with one byte less.
    ///
    /// # Returns
    ///
    /// The data read, empty when `le` is zero.
    ///
    /// # Errors
    ///
    /// * `EacError::AccessDenied` on `6982`, `6985` or `6986`.
    /// * `EacError::InvalidArgument` if a short read offset exceeds `7FFF`.
    pub fn read_binary(
        &mut self,
        mut wrapper: Option<&mut SecureMessagingWrapper>,
        offset: usize,
        le: usize,
        extended: bool,
    ) -> Result<Vec<u8>, EacError> {
        if le == 0 {
            return Ok(Vec::new());
        }
        let mut ne = if extended {
            let ne = if le < 128 {
                le + 2
            } else if le < 256 {
                le + 3
            } else {
                le
            };
            ne.min(256)
        } else {
            le
        };

        let command = if extended {
            let offset = u16::try_from(offset).map_err(EacError::IntCastError)?;
            CommandApdu::new(CLA_ISO7816, INS_READ_BINARY2, 0x00, 0x00)
                .with_data(wrap_do(&[TAG_OFFSET], &offset.to_be_bytes()))
        } else {
            if offset > MAX_SHORT_OFFSET {
                error!("Offset {offset:X} needs an extended READ BINARY");
                return Err(EacError::InvalidArgument(
                    "offset too large for a short READ BINARY",
                ));
            }
            let [p1, p2] = u16::try_from(offset)
                .map_err(EacError::IntCastError)?
                .to_be_bytes();
            CommandApdu::new(CLA_ISO7816, INS_READ_BINARY, p1, p2)
        };

        let response = loop {
            if ne == 0 {
                return Ok(Vec::new());
            }
            let response = self.transmit(wrapper.as_deref_mut(), &command.clone().with_ne(ne))?;
            if response.sw() == SW_END_OF_FILE {
                warn!("End of file reached before {ne} bytes at offset {offset}, retrying shorter");
                ne -= 1;
                continue;
            }
            check_file_status(Command::ReadBinary, &response)?;
            break response;
        };

        if extended {
            return Ok(unwrap_do(&[TAG_DISCRETIONARY_DATA], response.data())?.to_vec());
        }
        Ok(response.into_data())
    }

    /// `GET CHALLENGE` for 8 bytes.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status or a short challenge.
    pub fn get_challenge(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
    ) -> Result<[u8; 8], EacError> {
        let command = CommandApdu::new(CLA_ISO7816, INS_GET_CHALLENGE, 0x00, 0x00).with_ne(8);
        let challenge = self.send_checked(wrapper, Command::GetChallenge, &command)?;
        challenge.as_slice().try_into().map_err(|_| {
            error!(
                "Card challenge should be 8 bytes, found {}: {}",
                challenge.len(),
                bytes2hex(&challenge)
            );
            EacError::RecvApduError(Command::GetChallenge, SW_NO_ERROR)
        })
    }

    /// `INTERNAL AUTHENTICATE` with an 8-byte challenge, expecting up to 256 bytes.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status.
    pub fn internal_authenticate(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        challenge: &[u8; 8],
    ) -> Result<Vec<u8>, EacError> {
        let command = CommandApdu::new(CLA_ISO7816, INS_INTERNAL_AUTHENTICATE, 0x00, 0x00)
            .with_data(*challenge)
            .with_ne(256);
        self.send_checked(wrapper, Command::InternalAuthenticate, &command)
    }

    /// The BAC `EXTERNAL AUTHENTICATE`, always sent in plain.
    ///
    /// The command carries `E.IFD || M.IFD` where `E.IFD` encrypts
    /// `rnd_ifd || rnd_icc || k_ifd`. With `le_fallback`, a card rejecting
    /// `Le = 40` with `6700` or `6Cxx` is asked once more without Le.
    ///
    /// # Returns
    ///
    /// The decrypted 32-byte response `RND.IC || RND.IFD || K.IC`.
    ///
    /// # Errors
    ///
    /// * `EacError::MutualAuthFailed` on an error status or a response of the wrong length.
    /// * `EacError::VerifyMacError` if the response MAC does not match.
    pub fn mutual_authenticate(
        &mut self,
        rnd_ifd: &[u8; 8],
        rnd_icc: &[u8; 8],
        k_ifd: &[u8; 16],
        k_enc: &[u8; 24],
        k_mac: &[u8; 24],
        le_fallback: bool,
    ) -> Result<[u8; 32], EacError> {
        let e_ifd = encrypt_3des(k_enc, &[&rnd_ifd[..], rnd_icc, k_ifd].concat())?;
        let m_ifd = compute_mac(k_mac, &pad(&e_ifd))?;
        let command = CommandApdu::new(CLA_ISO7816, INS_EXTERNAL_AUTHENTICATE, 0x00, 0x00)
            .with_data([&e_ifd[..], &m_ifd].concat());

        let mut response =
            self.transmit(None, &command.clone().with_ne(MUTUAL_AUTH_RESPONSE_LEN))?;
        let sw = response.sw();
        if le_fallback && (sw == SW_WRONG_LENGTH || sw & 0xFF00 == 0x6C00) {
            warn!("Card rejected Le = 40 with {sw:04X}, resending mutual authentication without Le");
            response = self.transmit(None, &command)?;
        }

        let sw = response.sw();
        if sw != SW_NO_ERROR {
            error!("Received invalid SW during mutual authentication: {sw:04X}");
            return Err(EacError::MutualAuthFailed(sw));
        }
        if response.data().len() != MUTUAL_AUTH_RESPONSE_LEN {
            error!(
                "Mutual authentication response should be {MUTUAL_AUTH_RESPONSE_LEN} bytes, found {}",
                response.data().len()
            );
            return Err(EacError::MutualAuthFailed(sw));
        }

        let (e_icc, m_icc) = response.data().split_at(32);
        let mac = compute_mac(k_mac, &pad(e_icc))?;
        if !constant_time_eq(&mac, m_icc) {
            error!("MAC verification failed");
            return Err(EacError::VerifyMacError());
        }

        let plaintext = decrypt_3des(k_enc, e_icc)?;
        plaintext.as_slice().try_into().map_err(|_| {
            error!("Decrypted cryptogram has the wrong length: {}", plaintext.len());
            EacError::MutualAuthFailed(sw)
        })
    }

    /// The Terminal Authentication `EXTERNAL AUTHENTICATE` carrying the signature.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status.
    pub fn external_authenticate(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        signature: &[u8],
    ) -> Result<(), EacError> {
        let command = CommandApdu::new(CLA_ISO7816, INS_EXTERNAL_AUTHENTICATE, 0x00, 0x00)
            .with_data(signature);
        self.send_checked(wrapper, Command::ExternalAuthenticate, &command)?;
        Ok(())
    }

    /// `MSE:SET DST` (`00 22 81 B6`) selecting the key that verifies the next certificate.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status.
    pub fn mse_set_dst(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        authority_reference: &[u8],
    ) -> Result<(), EacError> {
        let command = CommandApdu::new(CLA_ISO7816, INS_MSE, 0x81, 0xB6)
            .with_data(wrap_do(&[TAG_PUBLIC_KEY_REFERENCE], authority_reference));
        self.send_checked(wrapper, Command::MseSetDst, &command)?;
        Ok(())
    }

    /// `MSE:SET AT` for external authentication (`00 22 81 A4`).
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status.
    pub fn mse_set_at_ext_auth(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        holder_reference: &[u8],
    ) -> Result<(), EacError> {
        let command = CommandApdu::new(CLA_ISO7816, INS_MSE, 0x81, 0xA4)
            .with_data(wrap_do(&[TAG_PUBLIC_KEY_REFERENCE], holder_reference));
        self.send_checked(wrapper, Command::MseSetAt, &command)?;
        Ok(())
    }

    /// `MSE:SET AT` for mutual authentication (`00 22 C1 A4`).
    ///
    /// `oid` is the encoded protocol object identifier content, `key_reference`
    /// the password or key reference and `private_key_reference` the optional
    /// domain parameter or key id.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status.
    pub fn mse_set_at_mutual_auth(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        oid: &[u8],
        key_reference: u8,
        private_key_reference: Option<&[u8]>,
    ) -> Result<(), EacError> {
        let mut data = wrap_do(&[TAG_CRYPTOGRAPHIC_MECHANISM], oid);
        data.extend(wrap_do(&[TAG_PUBLIC_KEY_REFERENCE], &[key_reference]));
        if let Some(reference) = private_key_reference {
            data.extend(wrap_do(&[TAG_PRIVATE_KEY_REFERENCE], reference));
        }
        let command = CommandApdu::new(CLA_ISO7816, INS_MSE, 0xC1, 0xA4).with_data(data);
        self.send_checked(wrapper, Command::MseSetAt, &command)?;
        Ok(())
    }

    /// `MSE:SET KAT` (`00 22 41 A6`) for Chip Authentication.
    ///
    /// `key_data` and `id_data` are complete DO'91 and DO'84 objects.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status.
    pub fn mse_kat(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        key_data: &[u8],
        id_data: Option<&[u8]>,
    ) -> Result<(), EacError> {
        let mut data = key_data.to_vec();
        if let Some(id_data) = id_data {
            data.extend_from_slice(id_data);
        }
        let command = CommandApdu::new(CLA_ISO7816, INS_MSE, 0x41, 0xA6).with_data(data);
        self.send_checked(wrapper, Command::MseSetKat, &command)?;
        Ok(())
    }

    /// `GENERAL AUTHENTICATE` with `data` wrapped in DO'7C.
    ///
    /// All but the last command of a sequence set the chaining bit.
    ///
    /// # Returns
    ///
    /// The content of the DO'7C in the response.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status.
    /// * `EacError` if the response is not a DO'7C.
    pub fn general_authenticate(
        &mut self,
        wrapper: Option<&mut SecureMessagingWrapper>,
        data: &[u8],
        is_last: bool,
    ) -> Result<Vec<u8>, EacError> {
        let cla = if is_last {
            CLA_ISO7816
        } else {
            CLA_COMMAND_CHAINING
        };
        let command = CommandApdu::new(cla, INS_GENERAL_AUTHENTICATE, 0x00, 0x00)
            .with_data(wrap_do(&[TAG_DYNAMIC_AUTHENTICATION_DATA], data))
            .with_ne(256);
        let response = self.send_checked(wrapper, Command::GeneralAuthenticate, &command)?;
        Ok(unwrap_do(&[TAG_DYNAMIC_AUTHENTICATION_DATA], &response)?.to_vec())
    }

    /// `PSO:VERIFY CERTIFICATE` (`00 2A 00 BE`) with `body || signature`.
    ///
    /// `body` is the DO'7F4E and `signature` the DO'5F37, both complete.
    ///
    /// # Errors
    ///
    /// * `EacError::RecvApduError` on a non-`9000` status for any block.
    pub fn pso_verify_certificate(
        &mut self,
        mut wrapper: Option<&mut SecureMessagingWrapper>,
        body: &[u8],
        signature: &[u8],
        mode: PsoMode,
    ) -> Result<(), EacError> {
        let certificate = [body, signature].concat();
        match mode {
            PsoMode::ExtendedLength => {
                let command =
                    CommandApdu::new(CLA_ISO7816, INS_PSO, 0x00, 0xBE).with_data(certificate);
                self.send_checked(wrapper, Command::PsoVerifyCertificate, &command)?;
            }
            PsoMode::Chained => {
                let blocks = certificate.chunks(PSO_BLOCK_SIZE).count();
                for (i, block) in certificate.chunks(PSO_BLOCK_SIZE).enumerate() {
                    let cla = if i + 1 == blocks {
                        CLA_ISO7816
                    } else {
                        CLA_COMMAND_CHAINING
                    };
                    let command = CommandApdu::new(cla, INS_PSO, 0x00, 0xBE).with_data(block);
                    self.send_checked(
                        wrapper.as_deref_mut(),
                        Command::PsoVerifyCertificate,
                        &command,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Requires `9000`, reporting anything else against `step`.
///
/// # Errors
///
/// * `EacError::RecvApduError` carrying the status word.
pub fn check_status(step: Command, response: &ResponseApdu) -> Result<(), EacError> {
    match response.sw() {
        SW_NO_ERROR => Ok(()),
        sw => {
            error!("Received invalid SW during {step}: {sw:04X}");
            Err(EacError::RecvApduError(step, sw))
        }
    }
}

/// Like [`check_status`], with the file access status words singled out.
///
/// # Errors
///
/// * `EacError::FileNotFound` on `6A82`.
/// * `EacError::AccessDenied` on `6982`, `6985` or `6986`.
/// * `EacError::RecvApduError` on any other non-`9000` status.
pub fn check_file_status(step: Command, response: &ResponseApdu) -> Result<(), EacError> {
    match response.sw() {
        SW_FILE_NOT_FOUND => {
            error!("File not found during {step}");
            Err(EacError::FileNotFound(SW_FILE_NOT_FOUND))
        }
        sw @ (SW_SECURITY_STATUS_NOT_SATISFIED
        | SW_CONDITIONS_NOT_SATISFIED
        | SW_COMMAND_NOT_ALLOWED) => {
            error!("Access denied during {step}: {sw:04X}");
            Err(EacError::AccessDenied(sw))
        }
        _ => check_status(step, response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCard;
    use hex_literal::hex;

    #[test]
    fn test_mutual_authenticate_icao_vector() -> Result<(), EacError> {
        let mut card = ScriptedCard::new();
        card.expect(
            &hex!("0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2
                   5F1448EEA8AD90A7 28"),
            &hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F
                   2F2D235D074D7449 9000"),
        );
        let mut service = ApduService::new(&mut card);
        let response = service.mutual_authenticate(
            &hex!("781723860C06C226"),
            &hex!("4608F91988702212"),
            &hex!("0B795240CB7049B01C19B33E32804F0B"),
            &hex!("AB94FDECF2674FDFB9B391F85D7F76F2 AB94FDECF2674FDF"),
            &hex!("7962D9ECE03D1ACD4C76089DCE131543 7962D9ECE03D1ACD"),
            true,
        )?;
        assert_eq!(
            response,
            hex!("4608F91988702212781723860C06C2260B4F80323EB3191CB04970CB4052790B")
        );
        assert!(card.is_done());
        Ok(())
    }

    #[test]
    fn test_mutual_authenticate_le_fallback() -> Result<(), EacError> {
        let command = hex!("0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2
                            5F1448EEA8AD90A7");
        let args = (
            hex!("781723860C06C226"),
            hex!("4608F91988702212"),
            hex!("0B795240CB7049B01C19B33E32804F0B"),
            hex!("AB94FDECF2674FDFB9B391F85D7F76F2 AB94FDECF2674FDF"),
            hex!("7962D9ECE03D1ACD4C76089DCE131543 7962D9ECE03D1ACD"),
        );

        let mut card = ScriptedCard::new();
        card.expect(&[&command[..], &[0x28]].concat(), &hex!("6700"));
        card.expect(
            &command,
            &hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F
                   2F2D235D074D7449 9000"),
        );
        let mut service = ApduService::new(&mut card);
        service.mutual_authenticate(&args.0, &args.1, &args.2, &args.3, &args.4, true)?;
        assert!(card.is_done());

        // Without the fallback the first rejection is final.
        let mut card = ScriptedCard::new();
        card.expect(&[&command[..], &[0x28]].concat(), &hex!("6C28"));
        let mut service = ApduService::new(&mut card);
        let result =
            service.mutual_authenticate(&args.0, &args.1, &args.2, &args.3, &args.4, false);
        assert!(matches!(result, Err(EacError::MutualAuthFailed(0x6C28))));
        Ok(())
    }

    #[test]
    fn test_mutual_authenticate_rejects_bad_mac() {
        let mut card = ScriptedCard::new();
        card.expect(
            &hex!("0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2
                   5F1448EEA8AD90A7 28"),
            &hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F
                   2F2D235D074D7448 9000"),
        );
        let mut service = ApduService::new(&mut card);
        let result = service.mutual_authenticate(
            &hex!("781723860C06C226"),
            &hex!("4608F91988702212"),
            &hex!("0B795240CB7049B01C19B33E32804F0B"),
            &hex!("AB94FDECF2674FDFB9B391F85D7F76F2 AB94FDECF2674FDF"),
            &hex!("7962D9ECE03D1ACD4C76089DCE131543 7962D9ECE03D1ACD"),
            true,
        );
        assert!(matches!(result, Err(EacError::VerifyMacError())));
    }

    #[test]
    fn test_secure_select_and_read_icao_vector() -> Result<(), EacError> {
        let mut wrapper = SecureMessagingWrapper::from_key_seed(
            &hex!("0036D272F5C350ACAC50C3F572D23600"),
            0x8870_2212_0C06_C226,
        )?;
        let mut card = ScriptedCard::new();
        card.expect(
            &hex!("0CA4020C15 8709016375432908C044F6 8E08BF8B92D635FF24F8 00"),
            &hex!("990290008E08FA855A5D4C50A8ED 9000"),
        );
        card.expect(
            &hex!("0CB000000D 9701048E08ED6705417E96BA55 00"),
            &hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED 9000"),
        );
        let mut service = ApduService::new(&mut card);
        service.select_file(Some(&mut wrapper), 0x011E)?;
        let data = service.read_binary(Some(&mut wrapper), 0, 4, false)?;
        assert_eq!(data, hex!("60145F01"));
        assert_eq!(wrapper.send_sequence_counter(), 0x8870_2212_0C06_C22A);
        assert!(card.is_done());
        Ok(())
    }

    #[test]
    fn test_select_file_status_words() {
        for (sw, expected) in [
            (hex!("6A82"), EacError::FileNotFound(0x6A82)),
            (hex!("6982"), EacError::AccessDenied(0x6982)),
            (hex!("6986"), EacError::AccessDenied(0x6986)),
            (
                hex!("6A86"),
                EacError::RecvApduError(Command::SelectFile, 0x6A86),
            ),
        ] {
            let mut card = ScriptedCard::new();
            card.expect(&hex!("00A4020C02 0101"), &sw);
            let mut service = ApduService::new(&mut card);
            let err = service.select_file(None, 0x0101).unwrap_err();
            assert_eq!(err.to_string(), expected.to_string());
        }
    }

    #[test]
    fn test_read_binary_retries_on_end_of_file() -> Result<(), EacError> {
        let mut card = ScriptedCard::new();
        card.expect(&hex!("00B0001004"), &hex!("6282"));
        card.expect(&hex!("00B0001003"), &hex!("6282"));
        card.expect(&hex!("00B0001002"), &hex!("ABCD 9000"));
        let mut service = ApduService::new(&mut card);
        assert_eq!(service.read_binary(None, 0x10, 4, false)?, hex!("ABCD"));
        assert!(service.read_binary(None, 0x10, 0, false)?.is_empty());
        assert!(card.is_done());
        Ok(())
    }

    #[test]
    fn test_read_binary_extended() -> Result<(), EacError> {
        let mut card = ScriptedCard::new();
        // Le grows by the DO'53 header: 4 + 2.
        card.expect(&hex!("00B1000004 54028000 06"), &hex!("5304 01020304 9000"));
        let mut service = ApduService::new(&mut card);
        assert_eq!(
            service.read_binary(None, 0x8000, 4, true)?,
            hex!("01020304")
        );
        assert!(card.is_done());
        Ok(())
    }

    #[test]
    fn test_read_binary_rejects_large_short_offset() {
        let mut card = ScriptedCard::new();
        let mut service = ApduService::new(&mut card);
        assert!(matches!(
            service.read_binary(None, 0x8000, 4, false),
            Err(EacError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_read_binary_access_denied() {
        let mut card = ScriptedCard::new();
        card.expect(&hex!("00B0000004"), &hex!("6982"));
        let mut service = ApduService::new(&mut card);
        assert!(matches!(
            service.read_binary(None, 0, 4, false),
            Err(EacError::AccessDenied(0x6982))
        ));
    }

    #[test]
    fn test_eac_command_layouts() -> Result<(), EacError> {
        let mut card = ScriptedCard::new();
        card.expect(&hex!("002281B60D 830B 4445435643413030303031"), &hex!("9000"));
        card.expect(&hex!("002281A40B 8309 444549533030303031"), &hex!("9000"));
        card.expect(&hex!("002241A607 9103010203 840101"), &hex!("9000"));
        card.expect(
            &hex!("0022C1A40F 800A04007F00070202040101 830101"),
            &hex!("9000"),
        );
        card.expect(
            &hex!("1086000002 7C00 00"),
            &hex!("7C0A 80080102030405060708 9000"),
        );
        card.expect(&hex!("0082000004 DEADBEEF"), &hex!("6300"));
        let mut service = ApduService::new(&mut card);
        service.mse_set_dst(None, b"DECVCA00001")?;
        service.mse_set_at_ext_auth(None, b"DEIS00001")?;
        service.mse_kat(None, &hex!("9103010203"), Some(&hex!("840101")))?;
        service.mse_set_at_mutual_auth(None, &hex!("04007F00070202040101"), 0x01, None)?;
        assert_eq!(
            service.general_authenticate(None, &[], false)?,
            hex!("80080102030405060708")
        );
        let err = service
            .external_authenticate(None, &hex!("DEADBEEF"))
            .unwrap_err();
        assert_eq!(err.status_word(), Some(0x6300));
        assert!(matches!(
            err,
            EacError::RecvApduError(Command::ExternalAuthenticate, _)
        ));
        assert!(card.is_done());
        Ok(())
    }

    #[test]
    fn test_pso_verify_certificate_modes() -> Result<(), EacError> {
        let body = vec![0x7F; 200];
        let signature = vec![0x5F; 50];
        let certificate = [&body[..], &signature[..]].concat();

        let mut card = ScriptedCard::new();
        card.expect(
            &[&hex!("002A00BE FA")[..], &certificate].concat(),
            &hex!("9000"),
        );
        card.expect(
            &[&hex!("102A00BE DF")[..], &certificate[..PSO_BLOCK_SIZE]].concat(),
            &hex!("9000"),
        );
        card.expect(
            &[&hex!("002A00BE 1B")[..], &certificate[PSO_BLOCK_SIZE..]].concat(),
            &hex!("9000"),
        );
        let mut service = ApduService::new(&mut card);
        service.pso_verify_certificate(None, &body, &signature, PsoMode::ExtendedLength)?;
        service.pso_verify_certificate(None, &body, &signature, PsoMode::Chained)?;
        assert!(card.is_done());

        let mut card = ScriptedCard::new();
        card.expect(
            &[&hex!("102A00BE DF")[..], &certificate[..PSO_BLOCK_SIZE]].concat(),
            &hex!("6A80"),
        );
        let mut service = ApduService::new(&mut card);
        let result = service.pso_verify_certificate(None, &body, &signature, PsoMode::Chained);
        assert!(matches!(
            result,
            Err(EacError::RecvApduError(Command::PsoVerifyCertificate, 0x6A80))
        ));
        Ok(())
    }
}
