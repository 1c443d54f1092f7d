//! Public-key operations behind Chip, Terminal and Active Authentication.

use openssl::{
    bn::{BigNum, BigNumContext},
    derive::Deriver,
    dh::Dh,
    ec::{EcKey, PointConversionForm},
    ecdsa::EcdsaSig,
    pkey::{HasParams, HasPrivate, HasPublic, Id, PKey, PKeyRef, Private, Public},
    rsa::Padding,
    sign::{RsaPssSaltlen, Signer},
};
use tracing::{error, warn};

use crate::{
    config::AaDigest, crypto::sha1, cvc::TaSignatureAlgorithm, util::align_to_size, EacError,
};

fn unsupported_key(id: Id) -> EacError {
    error!("Unsupported key type: {}", id.as_raw());
    EacError::UnsupportedAlgorithm(format!("key type {}", id.as_raw()))
}

fn to_usize(value: impl TryInto<usize, Error = core::num::TryFromIntError>) -> Result<usize, EacError> {
    value.try_into().map_err(EacError::IntCastError)
}

fn to_i32(value: usize) -> Result<i32, EacError> {
    i32::try_from(value).map_err(EacError::IntCastError)
}

fn ec_field_len<T: HasParams>(key: &EcKey<T>) -> Result<usize, EacError> {
    Ok(to_usize(key.group().degree())?.div_ceil(8))
}

/// Generates an ephemeral key pair on the domain parameters of `card_public_key`.
///
/// # Errors
///
/// * `EacError` if the key is neither EC nor DH or key generation fails.
pub fn generate_ephemeral_key_pair(
    card_public_key: &PKeyRef<Public>,
) -> Result<PKey<Private>, EacError> {
    match card_public_key.id() {
        Id::EC => {
            let card_key = card_public_key.ec_key()?;
            let ephemeral = EcKey::generate(card_key.group())?;
            Ok(PKey::from_ec_key(ephemeral)?)
        }
        Id::DH => {
            let card_key = card_public_key.dh()?;
            let prime_q = card_key.prime_q().map(|q| q.to_owned()).transpose()?;
            let params = Dh::from_pqg(
                card_key.prime_p().to_owned()?,
                prime_q,
                card_key.generator().to_owned()?,
            )?;
            Ok(PKey::from_dh(params.generate_key()?)?)
        }
        id => Err(unsupported_key(id)),
    }
}

/// Encodes a public key the way it is sent in `MSE:SET KAT`: an uncompressed
/// point for EC keys, the public value aligned to the prime length for DH keys.
///
/// # Errors
///
/// * `EacError` if the key type is unsupported or encoding fails.
pub fn encode_public_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Vec<u8>, EacError> {
    match key.id() {
        Id::EC => {
            let ec = key.ec_key()?;
            let mut ctx = BigNumContext::new()?;
            Ok(ec
                .public_key()
                .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?)
        }
        Id::DH => {
            let dh = key.dh()?;
            Ok(dh.public_key().to_vec_padded(dh.prime_p().num_bytes())?)
        }
        id => Err(unsupported_key(id)),
    }
}

/// Key hash bound into the Terminal Authentication signature: the X
/// coordinate for EC keys, the SHA-1 of the public value for DH keys.
///
/// # Errors
///
/// * `EacError` if the key type is unsupported or encoding fails.
pub fn compute_key_hash<T: HasPublic>(key: &PKeyRef<T>) -> Result<Vec<u8>, EacError> {
    let encoded = encode_public_key(key)?;
    match key.id() {
        Id::EC => {
            let field_len = ec_field_len(&key.ec_key()?)?;
            encoded
                .get(1..=field_len)
                .map(<[u8]>::to_vec)
                .ok_or(EacError::InvalidArgument("EC point is too short"))
        }
        _ => Ok(sha1(&encoded)?.to_vec()),
    }
}

/// Runs the key agreement between the ephemeral private key and the card key.
///
/// DH secrets are left-padded to the prime length.
///
/// # Errors
///
/// * `EacError` if the keys do not share domain parameters.
pub fn compute_shared_secret(
    private_key: &PKeyRef<Private>,
    card_public_key: &PKeyRef<Public>,
) -> Result<Vec<u8>, EacError> {
    let mut deriver = Deriver::new(private_key)?;
    deriver.set_peer(card_public_key)?;
    let secret = deriver.derive_to_vec()?;
    if card_public_key.id() == Id::DH {
        let prime_len = to_usize(card_public_key.dh()?.prime_p().num_bytes())?;
        return Ok(align_to_size(&secret, prime_len));
    }
    Ok(secret)
}

/// Converts a DER `ECDSA-Sig-Value` into `r || s`, each padded to `field_len`.
///
/// # Errors
///
/// * `EacError` if the signature is not valid DER.
pub fn ecdsa_der_to_raw(der: &[u8], field_len: usize) -> Result<Vec<u8>, EacError> {
    let signature = EcdsaSig::from_der(der)?;
    let field_len = to_i32(field_len)?;
    Ok([
        signature.r().to_vec_padded(field_len)?,
        signature.s().to_vec_padded(field_len)?,
    ]
    .concat())
}

/// Signs the Terminal Authentication challenge data.
///
/// ECDSA signatures are returned in plain `r || s` form.
///
/// # Errors
///
/// * `EacError` if the key does not match the algorithm or signing fails.
pub fn sign_terminal_data<T: HasPrivate>(
    key: &PKeyRef<T>,
    algorithm: TaSignatureAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>, EacError> {
    let expected = if algorithm.is_ecdsa() { Id::EC } else { Id::RSA };
    if key.id() != expected {
        error!("Terminal key does not match signature algorithm {algorithm:?}");
        return Err(EacError::InvalidArgument(
            "terminal key does not match the IS certificate algorithm",
        ));
    }

    let mut signer = Signer::new(algorithm.message_digest(), key)?;
    if algorithm.is_pss() {
        signer.set_rsa_padding(Padding::PKCS1_PSS)?;
        signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
    }
    signer.update(data)?;
    let signature = signer.sign_to_vec()?;

    if algorithm.is_ecdsa() {
        let field_len = ec_field_len(&key.ec_key()?)?;
        return ecdsa_der_to_raw(&signature, field_len);
    }
    Ok(signature)
}

/// Applies the raw RSA public operation to an Active Authentication response.
///
/// # Errors
///
/// * `EacError` if the key is not RSA or the response is out of range.
pub fn rsa_public_decrypt_raw(
    key: &PKeyRef<Public>,
    response: &[u8],
) -> Result<Vec<u8>, EacError> {
    let rsa = key.rsa()?;
    let mut plaintext = vec![0; to_usize(rsa.size())?];
    let len = rsa.public_decrypt(response, &mut plaintext, Padding::NONE)?;
    plaintext.truncate(len);
    Ok(plaintext)
}

/// Verifies a plain `r || s` ECDSA Active Authentication signature over `challenge`.
///
/// # Errors
///
/// * `EacError` if the key is not EC or verification can not run.
pub fn verify_ecdsa_raw(
    key: &PKeyRef<Public>,
    digest: AaDigest,
    challenge: &[u8],
    signature: &[u8],
) -> Result<bool, EacError> {
    let ec = key.ec_key()?;
    if signature.is_empty() || signature.len() % 2 != 0 {
        warn!(
            "ECDSA signature has an odd or zero length: {}",
            signature.len()
        );
        return Ok(false);
    }
    let (r, s) = signature.split_at(signature.len() / 2);
    let signature =
        EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
    Ok(signature.verify(&digest.digest(challenge)?, &ec)?)
}
