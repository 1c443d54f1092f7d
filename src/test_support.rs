//! Card doubles shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use constant_time_eq::constant_time_eq;
use hex_literal::hex;
use openssl::{
    bn::BigNumContext,
    ec::{EcKey, EcPoint},
    pkey::{PKey, Private, Public},
};
use rand::{CryptoRng, RngCore};

use crate::{
    card::EmrtdCard,
    crypto::{compute_mac, decrypt_3des, derive_key, encrypt_3des, pad, unpad, KeyType},
    util::{bytes2hex, get_asn1_child, wrap_do},
    EacError,
};

/// BAC session key seed of ICAO Doc 9303-11 Appendix D.3.
pub(crate) const ICAO_SESSION_SEED: [u8; 16] = hex!("0036D272F5C350ACAC50C3F572D23600");
/// Send sequence counter after the ICAO worked example BAC.
pub(crate) const ICAO_SSC: u64 = 0x8870_2212_0C06_C226;

type Handler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct Script {
    steps: VecDeque<Handler>,
    sent: Vec<Vec<u8>>,
    open: bool,
}

/// A card answering a fixed sequence of exchanges.
///
/// Clones share the script, so a test can keep a handle after moving the
/// card into a service.
#[derive(Clone, Default)]
pub(crate) struct ScriptedCard {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Expects exactly `command` next and answers `response`.
    pub(crate) fn expect(&self, command: &[u8], response: &[u8]) {
        let command = command.to_vec();
        let response = response.to_vec();
        self.respond_with(move |sent| {
            assert_eq!(bytes2hex(sent), bytes2hex(&command), "unexpected APDU");
            response.clone()
        });
    }

    /// Lets `handler` compute the answer to the next command.
    pub(crate) fn respond_with(&self, handler: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        self.script.lock().unwrap().steps.push_back(Box::new(handler));
    }

    /// Expects a protected command with `header` and, when given, plain
    /// `data`, and answers with a protected response.
    pub(crate) fn expect_secure(
        &self,
        channel: &Arc<Mutex<CardChannel>>,
        header: [u8; 4],
        data: Option<Vec<u8>>,
        response: Vec<u8>,
        sw: u16,
    ) {
        let channel = Arc::clone(channel);
        self.respond_with(move |command| {
            let mut channel = channel.lock().unwrap();
            let (received_header, received_data) = channel.receive(command);
            assert_eq!(bytes2hex(&received_header), bytes2hex(&header));
            if let Some(ref data) = data {
                assert_eq!(bytes2hex(&received_data), bytes2hex(data));
            }
            channel.respond(&response, sw)
        });
    }

    pub(crate) fn is_done(&self) -> bool {
        self.script.lock().unwrap().steps.is_empty()
    }

    /// Every command transmitted so far.
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().sent.clone()
    }
}

impl EmrtdCard for ScriptedCard {
    fn open(&mut self) -> Result<(), EacError> {
        self.script.lock().unwrap().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.script.lock().unwrap().open = false;
    }

    fn is_open(&self) -> bool {
        self.script.lock().unwrap().open
    }

    fn atr(&self) -> Option<Vec<u8>> {
        Some(hex!("0001020304050607").to_vec())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, EacError> {
        let mut script = self.script.lock().unwrap();
        script.sent.push(command.to_vec());
        match script.steps.pop_front() {
            Some(mut handler) => Ok(handler(command)),
            None => Err(EacError::TransportError(format!(
                "no response scripted for {}",
                bytes2hex(command)
            ))),
        }
    }
}

/// The card side of a 3DES secure messaging channel.
pub(crate) struct CardChannel {
    ks_enc: [u8; 24],
    ks_mac: [u8; 24],
    ssc: u64,
}

impl CardChannel {
    pub(crate) fn from_key_seed(key_seed: &[u8], ssc: u64) -> Self {
        Self {
            ks_enc: derive_key(key_seed, KeyType::Encryption).unwrap(),
            ks_mac: derive_key(key_seed, KeyType::Mac).unwrap(),
            ssc,
        }
    }

    pub(crate) fn shared(key_seed: &[u8], ssc: u64) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::from_key_seed(key_seed, ssc)))
    }

    /// Verifies a protected command and returns its header and plain data.
    pub(crate) fn receive(&mut self, command: &[u8]) -> ([u8; 4], Vec<u8>) {
        self.ssc += 1;
        let header = [command[0], command[1], command[2], command[3]];
        let (data_start, lc) = if command[4] == 0 && command.len() > 7 {
            (7, usize::from(u16::from_be_bytes([command[5], command[6]])))
        } else {
            (5, usize::from(command[4]))
        };
        let body = &command[data_start..data_start + lc];

        let mut plain = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            let offset = body.len() - rest.len();
            let tag = rest[0];
            let (value, next) = get_asn1_child(rest, 1).unwrap();
            match tag {
                0x87 => {
                    assert_eq!(value[0], 0x01);
                    let padded = decrypt_3des(&self.ks_enc, &value[1..]).unwrap();
                    plain = unpad(&padded).unwrap().to_vec();
                }
                0x85 => {
                    let padded = decrypt_3des(&self.ks_enc, value).unwrap();
                    plain = unpad(&padded).unwrap().to_vec();
                }
                0x97 => {}
                0x8E => {
                    let mac_input = pad(
                        &[
                            &self.ssc.to_be_bytes()[..],
                            &pad(&header),
                            &body[..offset],
                        ]
                        .concat(),
                    );
                    let mac = compute_mac(&self.ks_mac, &mac_input).unwrap();
                    assert!(constant_time_eq(&mac, value), "command MAC mismatch");
                    return (header, plain);
                }
                _ => panic!("unexpected data object {tag:02X}"),
            }
            rest = next;
        }
        panic!("protected command without DO'8E");
    }

    /// Builds a protected response carrying `data` and `sw`.
    pub(crate) fn respond(&mut self, data: &[u8], sw: u16) -> Vec<u8> {
        self.ssc += 1;
        let mut body = Vec::new();
        if !data.is_empty() {
            let ciphertext = encrypt_3des(&self.ks_enc, &pad(data)).unwrap();
            body.extend(wrap_do(&[0x87], &[&[0x01][..], &ciphertext].concat()));
        }
        body.extend(wrap_do(&[0x99], &sw.to_be_bytes()));
        let mac = compute_mac(
            &self.ks_mac,
            &pad(&[&self.ssc.to_be_bytes()[..], &body].concat()),
        )
        .unwrap();
        body.extend(wrap_do(&[0x8E], &mac));
        body.extend(sw.to_be_bytes());
        body
    }
}

/// Rebuilds an EC public key from an uncompressed point on the curve of `like`.
pub(crate) fn ec_public_key_from_point(like: &PKey<Private>, point: &[u8]) -> PKey<Public> {
    let like = like.ec_key().unwrap();
    let mut ctx = BigNumContext::new().unwrap();
    let point = EcPoint::from_bytes(like.group(), point, &mut ctx).unwrap();
    PKey::from_ec_key(EcKey::from_public_key(like.group(), &point).unwrap()).unwrap()
}

/// The public half of `key`.
pub(crate) fn public_key(key: &PKey<Private>) -> PKey<Public> {
    PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap()
}

/// The data field of a plain short command.
pub(crate) fn plain_command_data(command: &[u8]) -> &[u8] {
    if command.len() <= 5 {
        return &[];
    }
    &command[5..5 + usize::from(command[4])]
}

/// Deterministic generator yielding RND.IFD then K.IFD of the ICAO example.
#[derive(Clone, Debug)]
pub(crate) struct MockRng {
    data: Vec<u8>,
    index: usize,
}

impl Default for MockRng {
    fn default() -> Self {
        Self {
            data: hex!("781723860C06C226 0B795240CB7049B01C19B33E32804F0B").to_vec(),
            index: 0,
        }
    }
}

impl CryptoRng for MockRng {}

impl RngCore for MockRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0; 4];
        self.fill_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0; 8];
        self.fill_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.data[self.index];
            self.index = (self.index + 1) % self.data.len();
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
