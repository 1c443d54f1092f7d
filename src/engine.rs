//! The authentication protocol engine.
//!
//! [`PassportService`] owns the card, the active secure messaging wrapper and
//! the session state. Every operation runs under one lock, so concurrent
//! callers are serialized instead of interleaving APDUs and corrupting the
//! send sequence counter.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use constant_time_eq::constant_time_eq;
use openssl::pkey::{Id, PKeyRef, Private, Public};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{error, info, trace, warn};

use crate::{
    apdu::{CommandApdu, ResponseApdu, SW_NO_ERROR},
    asymmetric::{
        compute_key_hash, compute_shared_secret, encode_public_key, generate_ephemeral_key_pair,
        rsa_public_decrypt_raw, sign_terminal_data, verify_ecdsa_raw,
    },
    bac_key::BacKeySpec,
    card::EmrtdCard,
    config::{AaDigest, EngineConfig},
    crypto::{
        calculate_check_digit, compute_send_sequence_counter, derive_key, recover_message,
        xor_slices, KeyType,
    },
    cvc::{CvCertificate, Role},
    error::{Command, Protocol},
    event::{AaEvent, AuthEvent, BacEvent, CaEvent, EacEvent, EventSink, TaEvent},
    secure_messaging::SecureMessagingWrapper,
    service::{ApduService, EMRTD_AID},
    util::{bytes2hex, len2int, tag_len, unsigned_be_bytes, wrap_do},
    EacError,
};

const TAG_EPHEMERAL_PUBLIC_KEY: u8 = 0x91;
const TAG_KEY_ID: u8 = 0x84;

/// Largest chunk requested per `READ BINARY` by [`PassportService::read_file`].
const MAX_READ_BLOCK: usize = 0xDF;
const MAX_SHORT_READ_OFFSET: usize = 0x7FFF;

/// Where a session stands.
///
/// `AaAuthenticated` is a side branch: it is only entered from `Started` or
/// `BacAuthenticated` and does not affect Chip or Terminal Authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Stopped,
    Started,
    BacAuthenticated,
    AaAuthenticated,
    CaAuthenticated,
    /// Chip and Terminal Authentication both completed (EAC).
    TaAuthenticated,
}

/// Outcome of Chip Authentication.
#[derive(Debug, Clone)]
pub struct ChipAuthenticationResult {
    pub key_id: Option<u64>,
    /// Hash of the ephemeral public key, signed during Terminal Authentication.
    pub key_hash: Vec<u8>,
    pub ephemeral_key: openssl::pkey::PKey<Private>,
}

/// Outcome of Terminal Authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalAuthenticationResult {
    /// The CVCA reference the chain was checked against.
    pub ca_reference: String,
    /// Holder references of the certificates sent to the card.
    pub certificate_holders: Vec<String>,
    /// `rPICC`, empty when no terminal key was given.
    pub card_challenge: Vec<u8>,
}

/// A terminal certificate chain that passed [`check_terminal_chain`].
#[derive(Debug)]
pub struct TerminalChain<'a> {
    pub ca_reference: String,
    /// The certificates to send, the leading CVCA certificate removed.
    pub certificates: &'a [CvCertificate],
    /// The IS certificate closing the chain.
    pub terminal: &'a CvCertificate,
}

/// Checks the shape of a Terminal Authentication chain without talking to the card.
///
/// A leading CVCA certificate must carry `ca_reference` as its holder (or
/// supplies it when `ca_reference` is `None`) and is dropped. The first
/// remaining certificate must be issued by `ca_reference` and the last one
/// must have the IS role.
///
/// # Errors
///
/// * `EacError::InvalidArgument` if `certificates` is empty.
/// * `EacError::InvalidChainStructure` if a role or reference does not match.
pub fn check_terminal_chain<'a>(
    ca_reference: Option<&str>,
    certificates: &'a [CvCertificate],
) -> Result<TerminalChain<'a>, EacError> {
    let Some(first) = certificates.first() else {
        error!("Terminal Authentication needs at least one certificate");
        return Err(EacError::InvalidArgument(
            "terminal certificate chain is empty",
        ));
    };

    let mut ca_reference = ca_reference.map(str::to_owned);
    let mut chain = certificates;
    if first.role() == Role::Cvca {
        let holder = first.holder_reference();
        if let Some(ref expected) = ca_reference {
            if expected != holder {
                error!(
                    "First certificate holds wrong authority, found {holder}, expected {expected}"
                );
                return Err(EacError::InvalidChainStructure(format!(
                    "CVCA certificate {holder} does not match {expected}"
                )));
            }
        }
        ca_reference.get_or_insert_with(|| holder.to_owned());
        chain = &certificates[1..];
    }

    let (Some(first), Some(terminal)) = (chain.first(), chain.last()) else {
        error!("Terminal certificate chain holds only the CVCA certificate");
        return Err(EacError::InvalidChainStructure(
            "chain holds only the CVCA certificate".to_owned(),
        ));
    };

    let authority = first.authority_reference();
    if let Some(ref expected) = ca_reference {
        if expected != authority {
            error!(
                "First certificate not signed by expected CA, found {authority}, expected {expected}"
            );
            return Err(EacError::InvalidChainStructure(format!(
                "first certificate is issued by {authority}, expected {expected}"
            )));
        }
    }
    let ca_reference = ca_reference.unwrap_or_else(|| authority.to_owned());

    if terminal.role() != Role::Is {
        error!(
            "Last certificate in chain ({}) does not have role IS, but has role {}",
            terminal.holder_reference(),
            terminal.role()
        );
        return Err(EacError::InvalidChainStructure(format!(
            "last certificate {} has role {}, expected IS",
            terminal.holder_reference(),
            terminal.role()
        )));
    }

    for certificate in chain {
        trace!(
            "{certificate}, profile {}, valid {} to {}: {}",
            certificate.profile_identifier(),
            digits(certificate.effective_date()),
            digits(certificate.expiration_date()),
            bytes2hex(certificate.encoded())
        );
    }

    Ok(TerminalChain {
        ca_reference,
        certificates: chain,
        terminal,
    })
}

fn digits(bcd: &[u8]) -> String {
    bcd.iter().map(|digit| char::from(b'0' + digit % 10)).collect()
}

/// Turns card refusals into protocol errors naming the failed step.
fn deny(protocol: Protocol) -> impl Fn(EacError) -> EacError {
    move |err| match err {
        EacError::RecvApduError(command, sw) => {
            EacError::AuthenticationDenied(protocol, command, sw)
        }
        EacError::MutualAuthFailed(sw) => {
            EacError::AuthenticationDenied(protocol, Command::MutualAuthenticate, sw)
        }
        err => err,
    }
}

struct Session<C, R> {
    card: C,
    rng: R,
    state: SessionState,
    wrapper: Option<SecureMessagingWrapper>,
    ca_key_hash: Vec<u8>,
    aa_authenticated: bool,
}

impl<C: EmrtdCard, R: RngCore + CryptoRng> Session<C, R> {
    fn require_open(&self) -> Result<(), EacError> {
        if self.state == SessionState::Stopped {
            error!("Session is not open");
            return Err(EacError::InvalidState("session is not open"));
        }
        Ok(())
    }

    fn open(&mut self, config: &EngineConfig) -> Result<(), EacError> {
        if self.state != SessionState::Stopped {
            return Ok(());
        }
        self.card.open()?;
        if let Some(atr) = self.card.atr() {
            trace!("ATR: {}", bytes2hex(&atr));
        }
        if config.select_applet_on_open {
            if let Err(err) = ApduService::new(&mut self.card).select_applet(None, &EMRTD_AID) {
                self.card.close();
                return Err(err);
            }
            info!("Selected eMRTD application {}", bytes2hex(&EMRTD_AID));
        }
        self.state = SessionState::Started;
        Ok(())
    }

    fn close(&mut self) {
        self.wrapper = None;
        self.ca_key_hash.clear();
        self.aa_authenticated = false;
        self.card.close();
        self.state = SessionState::Stopped;
    }

    fn read_file(&mut self, fid: u16) -> Result<Vec<u8>, EacError> {
        self.require_open()?;
        let mut service = ApduService::new(&mut self.card);
        let mut wrapper = self.wrapper.as_mut();

        service.select_file(wrapper.as_deref_mut(), fid)?;
        trace!("Reading first 4 bytes from EF {fid:04X}...");
        let mut data = service.read_binary(wrapper.as_deref_mut(), 0, 4, false)?;
        let (value_start, value_len) = len2int(&data, tag_len(&data)?)?;
        let data_len = value_start + value_len;
        data.truncate(data_len);

        trace!("Reading {data_len} bytes from EF {fid:04X}...");
        while data.len() < data_len {
            let offset = data.len();
            let le = (data_len - offset).min(MAX_READ_BLOCK);
            let chunk = service.read_binary(
                wrapper.as_deref_mut(),
                offset,
                le,
                offset > MAX_SHORT_READ_OFFSET,
            )?;
            if chunk.is_empty() {
                error!("Requested {le} bytes at offset {offset} but received 0 bytes");
                return Err(EacError::InvalidResponseError());
            }
            data.extend_from_slice(&chunk);
        }

        if data.len() != data_len {
            error!(
                "Error while reading EF {fid:04X}, expected {data_len} bytes, found {}",
                data.len()
            );
            return Err(EacError::InvalidResponseError());
        }
        Ok(data)
    }

    fn bac(
        &mut self,
        config: &EngineConfig,
        k_enc: &[u8; 24],
        k_mac: &[u8; 24],
        events: &mut Vec<AuthEvent>,
    ) -> Result<(), EacError> {
        self.require_open()?;
        let mut service = ApduService::new(&mut self.card);

        let rnd_icc = service.get_challenge(None).map_err(deny(Protocol::Bac))?;
        let mut rnd_ifd = [0; 8];
        self.rng.fill_bytes(&mut rnd_ifd);
        let mut k_ifd = [0; 16];
        self.rng.fill_bytes(&mut k_ifd);

        let response = service
            .mutual_authenticate(
                &rnd_ifd,
                &rnd_icc,
                &k_ifd,
                k_enc,
                k_mac,
                config.mutual_auth_le_fallback,
            )
            .map_err(|err| match err {
                EacError::VerifyMacError() => EacError::AuthenticationDenied(
                    Protocol::Bac,
                    Command::MutualAuthenticate,
                    SW_NO_ERROR,
                ),
                err => deny(Protocol::Bac)(err),
            })?;

        if !constant_time_eq(&response[..8], &rnd_icc)
            || !constant_time_eq(&response[8..16], &rnd_ifd)
        {
            error!("Card did not return the expected challenges");
            return Err(EacError::AuthenticationDenied(
                Protocol::Bac,
                Command::MutualAuthenticate,
                SW_NO_ERROR,
            ));
        }

        let mut k_icc = [0; 16];
        k_icc.copy_from_slice(&response[16..]);
        let key_seed = xor_slices(&k_ifd, &k_icc)?;
        let ssc = compute_send_sequence_counter(&rnd_icc, &rnd_ifd)?;
        let wrapper = SecureMessagingWrapper::from_key_seed(&key_seed, ssc)?;

        self.wrapper = Some(wrapper.clone());
        self.state = SessionState::BacAuthenticated;
        info!("Basic Access Control completed, SSC {ssc:016X}");
        events.push(AuthEvent::Bac(BacEvent {
            rnd_icc,
            rnd_ifd,
            k_icc,
            k_ifd,
            wrapper,
        }));
        Ok(())
    }

    fn ca(
        &mut self,
        key_id: Option<u64>,
        card_public_key: &PKeyRef<Public>,
        events: &mut Vec<AuthEvent>,
    ) -> Result<ChipAuthenticationResult, EacError> {
        self.require_open()?;
        let ephemeral_key = generate_ephemeral_key_pair(card_public_key)?;
        let secret = compute_shared_secret(&ephemeral_key, card_public_key)?;
        let public_key = encode_public_key(&ephemeral_key)?;
        let key_hash = compute_key_hash(&ephemeral_key)?;
        trace!("Chip Authentication key hash: {}", bytes2hex(&key_hash));

        let key_data = wrap_do(&[TAG_EPHEMERAL_PUBLIC_KEY], &public_key);
        let id_data = key_id.map(|id| wrap_do(&[TAG_KEY_ID], &unsigned_be_bytes(id)));
        // The key agreement itself is still protected by the previous keys.
        ApduService::new(&mut self.card)
            .mse_kat(self.wrapper.as_mut(), &key_data, id_data.as_deref())
            .map_err(deny(Protocol::Ca))?;

        let wrapper = SecureMessagingWrapper::from_key_seed(&secret, 0)?;
        self.wrapper = Some(wrapper.clone());
        self.ca_key_hash.clone_from(&key_hash);
        self.state = SessionState::CaAuthenticated;
        info!("Chip Authentication completed, secure messaging restarted");
        events.push(AuthEvent::Ca(CaEvent {
            key_id,
            key_hash: key_hash.clone(),
            terminal_public_key: public_key,
            wrapper,
        }));
        Ok(ChipAuthenticationResult {
            key_id,
            key_hash,
            ephemeral_key,
        })
    }

    fn ta(
        &mut self,
        config: &EngineConfig,
        ca_reference: Option<&str>,
        certificates: &[CvCertificate],
        terminal_key: Option<&PKeyRef<Private>>,
        document_number: &str,
        events: &mut Vec<AuthEvent>,
    ) -> Result<TerminalAuthenticationResult, EacError> {
        let chain = check_terminal_chain(ca_reference, certificates)?;
        self.require_open()?;
        if self.ca_key_hash.is_empty() {
            warn!(
                "Terminal Authentication without prior Chip Authentication, signing an empty key hash"
            );
        }

        let certificate_holders: Vec<String> = chain
            .certificates
            .iter()
            .map(|certificate| certificate.holder_reference().to_owned())
            .collect();
        let mut service = ApduService::new(&mut self.card);
        let mut wrapper = self.wrapper.as_mut();

        for certificate in chain.certificates {
            trace!("Sending certificate {certificate}");
            service
                .mse_set_dst(
                    wrapper.as_deref_mut(),
                    certificate.authority_reference().as_bytes(),
                )
                .map_err(deny(Protocol::Ta))?;
            service
                .pso_verify_certificate(
                    wrapper.as_deref_mut(),
                    certificate.body_data(),
                    &certificate.signature_data(),
                    config.pso_mode,
                )
                .map_err(|err| match err {
                    EacError::RecvApduError(_, sw) => {
                        EacError::CertificateRejected(certificate.holder_reference().to_owned(), sw)
                    }
                    err => err,
                })?;
        }

        let Some(terminal_key) = terminal_key else {
            info!("No terminal key, Terminal Authentication stops after certificate verification");
            events.push(AuthEvent::Ta(TaEvent {
                ca_reference: chain.ca_reference.clone(),
                certificate_holders: certificate_holders.clone(),
                card_challenge: Vec::new(),
                success: false,
            }));
            return Ok(TerminalAuthenticationResult {
                ca_reference: chain.ca_reference,
                certificate_holders,
                card_challenge: Vec::new(),
            });
        };

        service
            .mse_set_at_ext_auth(
                wrapper.as_deref_mut(),
                chain.terminal.holder_reference().as_bytes(),
            )
            .map_err(deny(Protocol::Ta))?;
        let card_challenge = service
            .get_challenge(wrapper.as_deref_mut())
            .map_err(deny(Protocol::Ta))?;

        let id_picc = format!(
            "{document_number}{}",
            calculate_check_digit(document_number)?
        );
        let data_to_sign = [id_picc.as_bytes(), &card_challenge, &self.ca_key_hash].concat();
        let signature = sign_terminal_data(
            terminal_key,
            chain.terminal.signature_algorithm(),
            &data_to_sign,
        )?;
        service
            .external_authenticate(wrapper.as_deref_mut(), &signature)
            .map_err(|err| match err {
                EacError::RecvApduError(_, sw) => EacError::SignatureRejected(sw),
                err => err,
            })?;

        self.state = SessionState::TaAuthenticated;
        info!("Terminal Authentication completed");
        events.push(AuthEvent::Ta(TaEvent {
            ca_reference: chain.ca_reference.clone(),
            certificate_holders: certificate_holders.clone(),
            card_challenge: card_challenge.to_vec(),
            success: true,
        }));
        Ok(TerminalAuthenticationResult {
            ca_reference: chain.ca_reference,
            certificate_holders,
            card_challenge: card_challenge.to_vec(),
        })
    }

    fn aa(
        &mut self,
        config: &EngineConfig,
        card_public_key: &PKeyRef<Public>,
        events: &mut Vec<AuthEvent>,
    ) -> Result<bool, EacError> {
        self.require_open()?;
        let mut challenge = [0; 8];
        self.rng.fill_bytes(&mut challenge);
        let response = ApduService::new(&mut self.card)
            .internal_authenticate(self.wrapper.as_mut(), &challenge)
            .map_err(deny(Protocol::Aa))?;

        let (success, recovered_message) = match card_public_key.id() {
            Id::RSA => {
                verify_rsa_response(config.aa_digest, card_public_key, &challenge, &response)?
            }
            Id::EC => (
                verify_ecdsa_raw(card_public_key, config.aa_digest, &challenge, &response)?,
                Vec::new(),
            ),
            id => {
                error!("Unsupported Active Authentication key type: {}", id.as_raw());
                return Err(EacError::UnsupportedAlgorithm(format!(
                    "Active Authentication key type {}",
                    id.as_raw()
                )));
            }
        };

        if success {
            self.aa_authenticated = true;
            if matches!(
                self.state,
                SessionState::Started | SessionState::BacAuthenticated
            ) {
                self.state = SessionState::AaAuthenticated;
            }
            info!("Active Authentication succeeded");
        } else {
            warn!("Active Authentication failed, the signature does not cover the challenge");
        }
        events.push(AuthEvent::Aa(AaEvent {
            challenge,
            recovered_message,
            success,
        }));
        Ok(success)
    }
}

/// Verifies an ISO 9796-2 RSA signature over `m1 || challenge`.
fn verify_rsa_response(
    digest: AaDigest,
    card_public_key: &PKeyRef<Public>,
    challenge: &[u8],
    response: &[u8],
) -> Result<(bool, Vec<u8>), EacError> {
    let plaintext = rsa_public_decrypt_raw(card_public_key, response)?;
    let digest_len = digest.output_len();
    let m1 = recover_message(digest_len, &plaintext)?;
    // Recovery guarantees room for the digest and the trailer.
    let embedded = &plaintext[plaintext.len() - 1 - digest_len..plaintext.len() - 1];
    let expected = digest.digest(&[&m1[..], challenge].concat())?;
    Ok((constant_time_eq(&expected, embedded), m1))
}

/// The protocol engine for one eMRTD session.
///
/// `R` supplies the BAC nonces and the Active Authentication challenge.
pub struct PassportService<C: EmrtdCard, R: RngCore + CryptoRng + Default = OsRng> {
    session: Mutex<Session<C, R>>,
    config: EngineConfig,
    event_sink: Mutex<Option<EventSink>>,
    sink_replaced: AtomicBool,
}

impl<C: EmrtdCard, R: RngCore + CryptoRng + Default> PassportService<C, R> {
    /// Constructs a stopped session over `card` with the default configuration.
    #[must_use]
    pub fn new(card: C) -> Self {
        Self::with_config(card, EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(card: C, config: EngineConfig) -> Self {
        Self {
            session: Mutex::new(Session {
                card,
                rng: R::default(),
                state: SessionState::Stopped,
                wrapper: None,
                ca_key_hash: Vec::new(),
                aa_authenticated: false,
            }),
            config,
            event_sink: Mutex::new(None),
            sink_replaced: AtomicBool::new(false),
        }
    }

    /// Registers `sink` to receive an [`AuthEvent`] after each protocol run.
    #[must_use]
    pub fn with_event_sink(self, sink: EventSink) -> Self {
        self.set_event_sink(Some(sink));
        self
    }

    /// Replaces the event sink. A sink may call this on itself, for example
    /// to unregister after its first event.
    pub fn set_event_sink(&self, sink: Option<EventSink>) {
        let mut slot = self
            .event_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = sink;
        self.sink_replaced.store(true, Ordering::Release);
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session<C, R>>, EacError> {
        self.session.lock().map_err(|_| {
            error!("Session lock poisoned by a panicking caller");
            EacError::InvalidState("session lock is poisoned")
        })
    }

    fn peek(&self) -> MutexGuard<'_, Session<C, R>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `operation` under the session lock, then hands the events it
    /// produced to the sink once the lock is released.
    fn run<T>(
        &self,
        operation: impl FnOnce(&mut Session<C, R>, &mut Vec<AuthEvent>) -> Result<T, EacError>,
    ) -> Result<T, EacError> {
        let mut events = Vec::new();
        let result = {
            let mut session = self.lock()?;
            operation(&mut *session, &mut events)
        };
        if events.is_empty() {
            return result;
        }

        // The sink leaves its slot while it runs, so it may call back into
        // the service, including `set_event_sink`.
        let taken = {
            let mut slot = self
                .event_sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.sink_replaced.store(false, Ordering::Release);
            slot.take()
        };
        if let Some(mut sink) = taken {
            for event in &events {
                sink(event);
            }
            let mut slot = self
                .event_sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() && !self.sink_replaced.swap(false, Ordering::AcqRel) {
                *slot = Some(sink);
            }
        }
        result
    }

    /// Opens the card and, unless disabled in the configuration, selects the
    /// eMRTD application. Opening an open session does nothing.
    ///
    /// # Errors
    ///
    /// * `EacError` if the card can not be opened or the application is not found.
    pub fn open(&self) -> Result<(), EacError> {
        self.run(|session, _| session.open(&self.config))
    }

    /// Drops the secure channel and closes the card.
    pub fn close(&self) {
        self.peek().close();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        let session = self.peek();
        session.state != SessionState::Stopped && session.card.is_open()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.peek().state
    }

    #[must_use]
    pub fn atr(&self) -> Option<Vec<u8>> {
        self.peek().card.atr()
    }

    /// The SSC of the active wrapper, `None` before BAC or CA.
    #[must_use]
    pub fn send_sequence_counter(&self) -> Option<u64> {
        self.peek()
            .wrapper
            .as_ref()
            .map(SecureMessagingWrapper::send_sequence_counter)
    }

    /// A snapshot of the active wrapper.
    #[must_use]
    pub fn secure_messaging_wrapper(&self) -> Option<SecureMessagingWrapper> {
        self.peek().wrapper.clone()
    }

    /// Whether Active Authentication has succeeded in this session.
    #[must_use]
    pub fn is_aa_authenticated(&self) -> bool {
        self.peek().aa_authenticated
    }

    /// Sends `command` over the active channel without interpreting the status word.
    ///
    /// # Errors
    ///
    /// * `EacError` if the session is not open or the exchange fails.
    pub fn transmit(&self, command: &CommandApdu) -> Result<ResponseApdu, EacError> {
        self.run(|session, _| {
            session.require_open()?;
            ApduService::new(&mut session.card).transmit(session.wrapper.as_mut(), command)
        })
    }

    /// # Errors
    ///
    /// * `EacError` if the session is not open or the card does not know the application.
    pub fn send_select_applet(&self) -> Result<(), EacError> {
        self.run(|session, _| {
            session.require_open()?;
            ApduService::new(&mut session.card).select_applet(session.wrapper.as_mut(), &EMRTD_AID)
        })
    }

    /// # Errors
    ///
    /// * `EacError::FileNotFound` or `EacError::AccessDenied` as reported by the card.
    pub fn send_select_file(&self, fid: u16) -> Result<(), EacError> {
        self.run(|session, _| {
            session.require_open()?;
            ApduService::new(&mut session.card).select_file(session.wrapper.as_mut(), fid)
        })
    }

    /// Reads from the selected file, see [`ApduService::read_binary`].
    ///
    /// # Errors
    ///
    /// * `EacError` if the session is not open or the card refuses the read.
    pub fn send_read_binary(
        &self,
        offset: usize,
        le: usize,
        extended: bool,
    ) -> Result<Vec<u8>, EacError> {
        self.run(|session, _| {
            session.require_open()?;
            ApduService::new(&mut session.card).read_binary(
                session.wrapper.as_mut(),
                offset,
                le,
                extended,
            )
        })
    }

    /// # Errors
    ///
    /// * `EacError` if the session is not open or the card refuses.
    pub fn send_get_challenge(&self) -> Result<[u8; 8], EacError> {
        self.run(|session, _| {
            session.require_open()?;
            ApduService::new(&mut session.card).get_challenge(session.wrapper.as_mut())
        })
    }

    /// Selects the file `fid` and reads it completely.
    ///
    /// The first four bytes are read to decode the length of the outer TLV,
    /// the rest follows in chunks.
    ///
    /// # Returns
    ///
    /// The file content, tag and length included.
    ///
    /// # Errors
    ///
    /// * `EacError` if selection or any read fails, or the file is shorter than announced.
    pub fn read_file(&self, fid: u16) -> Result<Vec<u8>, EacError> {
        self.run(|session, _| session.read_file(fid))
    }

    /// Performs Basic Access Control with keys derived from `key`.
    ///
    /// For more details and examples, see ICAO Doc 9303-11 Section 4.3 and Appendix D.3
    /// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
    ///
    /// A call is a single attempt; retrying other key candidates is up to the caller.
    ///
    /// # Errors
    ///
    /// * `EacError::AuthenticationDenied` if the card rejects the attempt.
    /// * `EacError::InvalidState` if the session is not open.
    pub fn do_bac(&self, key: &BacKeySpec) -> Result<(), EacError> {
        let key_seed = key.key_seed()?;
        let k_enc = derive_key(&key_seed, KeyType::Encryption)?;
        let k_mac = derive_key(&key_seed, KeyType::Mac)?;
        self.do_bac_with_keys(&k_enc, &k_mac)
    }

    /// Performs Basic Access Control with already derived static keys.
    ///
    /// # Errors
    ///
    /// * `EacError::AuthenticationDenied` if the card rejects the attempt.
    pub fn do_bac_with_keys(&self, k_enc: &[u8; 24], k_mac: &[u8; 24]) -> Result<(), EacError> {
        self.run(|session, events| session.bac(&self.config, k_enc, k_mac, events))
    }

    /// Performs Chip Authentication against `card_public_key` (from DG14).
    ///
    /// The `MSE:SET KAT` carrying the ephemeral public key is sent under the
    /// current wrapper; afterwards secure messaging restarts with keys derived
    /// from the shared secret and an SSC of zero.
    ///
    /// # Arguments
    ///
    /// * `key_id` - The card key identifier, when DG14 lists more than one key.
    /// * `card_public_key` - The card's EC or DH Chip Authentication key.
    ///
    /// # Errors
    ///
    /// * `EacError::AuthenticationDenied` if the card rejects the key agreement.
    /// * `EacError::UnsupportedAlgorithm` if the key is neither EC nor DH.
    pub fn do_ca(
        &self,
        key_id: Option<u64>,
        card_public_key: &PKeyRef<Public>,
    ) -> Result<ChipAuthenticationResult, EacError> {
        self.run(|session, events| session.ca(key_id, card_public_key, events))
    }

    /// Performs Terminal Authentication.
    ///
    /// The chain is checked with [`check_terminal_chain`] before anything is
    /// sent. Each certificate is then verified by the card, and the challenge
    /// `rPICC` is signed together with the document number, its check digit
    /// and the key hash of the preceding Chip Authentication. Without
    /// `terminal_key` the protocol stops after certificate verification.
    ///
    /// # Arguments
    ///
    /// * `ca_reference` - The CVCA reference from EF.CVCA, or `None` to take it from the chain.
    /// * `certificates` - CVCA (optional), DV and IS certificates, issuer first.
    /// * `terminal_key` - The IS private key.
    /// * `document_number` - The document number as printed in the MRZ.
    ///
    /// # Errors
    ///
    /// * `EacError::InvalidChainStructure` if the chain is malformed.
    /// * `EacError::CertificateRejected` or `EacError::SignatureRejected` if the card refuses.
    pub fn do_ta(
        &self,
        ca_reference: Option<&str>,
        certificates: &[CvCertificate],
        terminal_key: Option<&PKeyRef<Private>>,
        document_number: &str,
    ) -> Result<TerminalAuthenticationResult, EacError> {
        self.run(|session, events| {
            session.ta(
                &self.config,
                ca_reference,
                certificates,
                terminal_key,
                document_number,
                events,
            )
        })
    }

    /// Runs Chip Authentication and Terminal Authentication back to back
    /// without releasing the session, then reports one [`EacEvent`].
    ///
    /// A failed Terminal Authentication leaves the Chip Authentication
    /// wrapper installed.
    ///
    /// # Errors
    ///
    /// * `EacError` from whichever step failed.
    pub fn do_eac(
        &self,
        key_id: Option<u64>,
        card_public_key: &PKeyRef<Public>,
        ca_reference: Option<&str>,
        certificates: &[CvCertificate],
        terminal_key: &PKeyRef<Private>,
        document_number: &str,
    ) -> Result<(ChipAuthenticationResult, TerminalAuthenticationResult), EacError> {
        self.run(|session, events| {
            let result = session.ca(key_id, card_public_key, events).and_then(|ca| {
                session
                    .ta(
                        &self.config,
                        ca_reference,
                        certificates,
                        Some(terminal_key),
                        document_number,
                        events,
                    )
                    .map(|ta| (ca, ta))
            });

            let ca = events.iter().find_map(|event| match event {
                AuthEvent::Ca(ca) => Some(ca.clone()),
                _ => None,
            });
            let ta = events.iter().find_map(|event| match event {
                AuthEvent::Ta(ta) => Some(ta.clone()),
                _ => None,
            });
            events.push(AuthEvent::Eac(EacEvent {
                document_number: document_number.to_owned(),
                ca,
                ta,
                success: result.is_ok(),
            }));
            result
        })
    }

    /// Performs Active Authentication with the key from DG15.
    ///
    /// RSA keys are checked as ISO 9796-2 signatures with message recovery,
    /// EC keys as plain `r || s` ECDSA signatures; both use the configured
    /// digest. The secure channel is left as it is.
    ///
    /// # Returns
    ///
    /// Whether the card's signature covers the challenge.
    ///
    /// # Errors
    ///
    /// * `EacError::RecoveryFailed` if the RSA plaintext is not ISO 9796-2 formatted.
    /// * `EacError::AuthenticationDenied` if the card refuses the challenge.
    pub fn do_aa(&self, card_public_key: &PKeyRef<Public>) -> Result<bool, EacError> {
        self.run(|session, events| session.aa(&self.config, card_public_key, events))
    }
}
