//! Card-verifiable certificates (BSI TR-03110 / ICAO 9303-11 EAC) used
//! by Terminal Authentication.

use core::fmt;

use openssl::hash::MessageDigest;
use tracing::error;

use crate::{
    util::{bytes2hex, get_asn1_child, tag_len, validate_asn1_tag, wrap_do},
    EacError,
};

const TAG_CV_CERTIFICATE: [u8; 2] = [0x7F, 0x21];
const TAG_CERTIFICATE_BODY: [u8; 2] = [0x7F, 0x4E];
const TAG_SIGNATURE: [u8; 2] = [0x5F, 0x37];
const TAG_PROFILE_IDENTIFIER: [u8; 2] = [0x5F, 0x29];
const TAG_AUTHORITY_REFERENCE: [u8; 1] = [0x42];
const TAG_PUBLIC_KEY: [u8; 2] = [0x7F, 0x49];
const TAG_HOLDER_REFERENCE: [u8; 2] = [0x5F, 0x20];
const TAG_AUTHORIZATION_TEMPLATE: [u8; 2] = [0x7F, 0x4C];
const TAG_EFFECTIVE_DATE: [u8; 2] = [0x5F, 0x25];
const TAG_EXPIRATION_DATE: [u8; 2] = [0x5F, 0x24];
const TAG_OID: u8 = 0x06;
const TAG_DISCRETIONARY_DATA: u8 = 0x53;

/// `id-TA`, 0.4.0.127.0.7.2.2.2
const ID_TA: [u8; 8] = [0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02];

/// Role encoded in the top two bits of the certificate holder authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Cvca,
    DvDomestic,
    DvForeign,
    Is,
}

impl Role {
    #[must_use]
    pub const fn from_authorization(bits: u8) -> Self {
        match bits & 0xC0 {
            0xC0 => Self::Cvca,
            0x80 => Self::DvDomestic,
            0x40 => Self::DvForeign,
            _ => Self::Is,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Cvca => "CVCA",
            Self::DvDomestic => "DV (domestic)",
            Self::DvForeign => "DV (foreign)",
            Self::Is => "IS",
        })
    }
}

/// Terminal Authentication signature algorithms, identified by their `id-TA` OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaSignatureAlgorithm {
    RsaV15Sha1,
    RsaV15Sha256,
    RsaV15Sha512,
    RsaPssSha1,
    RsaPssSha256,
    RsaPssSha512,
    EcdsaSha1,
    EcdsaSha224,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

impl TaSignatureAlgorithm {
    /// Resolves the content octets of an `id-TA-*` OID.
    ///
    /// # Errors
    ///
    /// * `EacError::UnsupportedAlgorithm` for any other OID.
    pub fn from_oid(oid: &[u8]) -> Result<Self, EacError> {
        let algorithm = match oid.strip_prefix(&ID_TA[..]) {
            Some([0x01, 0x01]) => Some(Self::RsaV15Sha1),
            Some([0x01, 0x02]) => Some(Self::RsaV15Sha256),
            Some([0x01, 0x03]) => Some(Self::RsaPssSha1),
            Some([0x01, 0x04]) => Some(Self::RsaPssSha256),
            Some([0x01, 0x05]) => Some(Self::RsaV15Sha512),
            Some([0x01, 0x06]) => Some(Self::RsaPssSha512),
            Some([0x02, 0x01]) => Some(Self::EcdsaSha1),
            Some([0x02, 0x02]) => Some(Self::EcdsaSha224),
            Some([0x02, 0x03]) => Some(Self::EcdsaSha256),
            Some([0x02, 0x04]) => Some(Self::EcdsaSha384),
            Some([0x02, 0x05]) => Some(Self::EcdsaSha512),
            _ => None,
        };
        algorithm.ok_or_else(|| {
            error!("Unsupported Terminal Authentication OID: {}", bytes2hex(oid));
            EacError::UnsupportedAlgorithm(bytes2hex(oid))
        })
    }

    /// Content octets of the algorithm's OID.
    #[must_use]
    pub fn oid(self) -> Vec<u8> {
        let suffix: [u8; 2] = match self {
            Self::RsaV15Sha1 => [0x01, 0x01],
            Self::RsaV15Sha256 => [0x01, 0x02],
            Self::RsaPssSha1 => [0x01, 0x03],
            Self::RsaPssSha256 => [0x01, 0x04],
            Self::RsaV15Sha512 => [0x01, 0x05],
            Self::RsaPssSha512 => [0x01, 0x06],
            Self::EcdsaSha1 => [0x02, 0x01],
            Self::EcdsaSha224 => [0x02, 0x02],
            Self::EcdsaSha256 => [0x02, 0x03],
            Self::EcdsaSha384 => [0x02, 0x04],
            Self::EcdsaSha512 => [0x02, 0x05],
        };
        [&ID_TA[..], &suffix[..]].concat()
    }

    #[must_use]
    pub fn message_digest(self) -> MessageDigest {
        match self {
            Self::RsaV15Sha1 | Self::RsaPssSha1 | Self::EcdsaSha1 => MessageDigest::sha1(),
            Self::EcdsaSha224 => MessageDigest::sha224(),
            Self::RsaV15Sha256 | Self::RsaPssSha256 | Self::EcdsaSha256 => {
                MessageDigest::sha256()
            }
            Self::EcdsaSha384 => MessageDigest::sha384(),
            Self::RsaV15Sha512 | Self::RsaPssSha512 | Self::EcdsaSha512 => {
                MessageDigest::sha512()
            }
        }
    }

    #[must_use]
    pub const fn is_ecdsa(self) -> bool {
        matches!(
            self,
            Self::EcdsaSha1
                | Self::EcdsaSha224
                | Self::EcdsaSha256
                | Self::EcdsaSha384
                | Self::EcdsaSha512
        )
    }

    #[must_use]
    pub const fn is_pss(self) -> bool {
        matches!(
            self,
            Self::RsaPssSha1 | Self::RsaPssSha256 | Self::RsaPssSha512
        )
    }
}

/// A parsed card-verifiable certificate.
///
/// Only the fields Terminal Authentication needs are interpreted; the encoded
/// body and signature are kept verbatim for `PSO:VERIFY CERTIFICATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvCertificate {
    encoded: Vec<u8>,
    body: Vec<u8>,
    signature: Vec<u8>,
    profile_identifier: u8,
    authority_reference: String,
    holder_reference: String,
    role: Role,
    signature_algorithm: TaSignatureAlgorithm,
    effective_date: Vec<u8>,
    expiration_date: Vec<u8>,
}

impl CvCertificate {
    /// Parses a DER encoded `7F21` certificate.
    ///
    /// # Errors
    ///
    /// * `EacError` if a mandatory element is missing or malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EacError> {
        validate_asn1_tag(data, &TAG_CV_CERTIFICATE)?;
        let (content, trailing) = get_asn1_child(data, TAG_CV_CERTIFICATE.len())?;
        let encoded = data[..data.len() - trailing.len()].to_vec();

        validate_asn1_tag(content, &TAG_CERTIFICATE_BODY)?;
        let (body_value, after_body) = get_asn1_child(content, TAG_CERTIFICATE_BODY.len())?;
        let body = content[..content.len() - after_body.len()].to_vec();

        validate_asn1_tag(after_body, &TAG_SIGNATURE)?;
        let (signature, _) = get_asn1_child(after_body, TAG_SIGNATURE.len())?;

        let mut profile_identifier = None;
        let mut authority_reference = None;
        let mut holder_reference = None;
        let mut chat = None;
        let mut public_key_oid = None;
        let mut effective_date = Vec::new();
        let mut expiration_date = Vec::new();

        let mut rest = body_value;
        while !rest.is_empty() {
            let tl = tag_len(rest)?;
            let tag = &rest[..tl];
            let (value, next) = get_asn1_child(rest, tl)?;
            match tag {
                t if t == TAG_PROFILE_IDENTIFIER => profile_identifier = value.first().copied(),
                t if t == TAG_AUTHORITY_REFERENCE => authority_reference = Some(value),
                t if t == TAG_PUBLIC_KEY => public_key_oid = Some(first_oid(value)?),
                t if t == TAG_HOLDER_REFERENCE => holder_reference = Some(value),
                t if t == TAG_AUTHORIZATION_TEMPLATE => chat = Some(value),
                t if t == TAG_EFFECTIVE_DATE => effective_date = value.to_vec(),
                t if t == TAG_EXPIRATION_DATE => expiration_date = value.to_vec(),
                // Certificate extensions and unknown elements are not interpreted.
                _ => {}
            }
            rest = next;
        }

        let profile_identifier = profile_identifier.ok_or_else(|| missing("profile identifier"))?;
        let authority_reference =
            reference(authority_reference.ok_or_else(|| missing("authority reference"))?)?;
        let holder_reference =
            reference(holder_reference.ok_or_else(|| missing("holder reference"))?)?;
        let signature_algorithm = TaSignatureAlgorithm::from_oid(
            public_key_oid.ok_or_else(|| missing("public key"))?,
        )?;
        let role = role_from_chat(chat.ok_or_else(|| missing("authorization template"))?)?;

        Ok(Self {
            encoded,
            body,
            signature: signature.to_vec(),
            profile_identifier,
            authority_reference,
            holder_reference,
            role,
            signature_algorithm,
            effective_date,
            expiration_date,
        })
    }

    /// The complete certificate encoding.
    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// The `7F4E` body, tag and length included.
    #[must_use]
    pub fn body_data(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The `5F37` signature object, tag and length included.
    #[must_use]
    pub fn signature_data(&self) -> Vec<u8> {
        wrap_do(&TAG_SIGNATURE, &self.signature)
    }

    #[must_use]
    pub const fn profile_identifier(&self) -> u8 {
        self.profile_identifier
    }

    #[must_use]
    pub fn authority_reference(&self) -> &str {
        &self.authority_reference
    }

    #[must_use]
    pub fn holder_reference(&self) -> &str {
        &self.holder_reference
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn signature_algorithm(&self) -> TaSignatureAlgorithm {
        self.signature_algorithm
    }

    /// Unpacked BCD digits `YYMMDD`, empty when absent.
    #[must_use]
    pub fn effective_date(&self) -> &[u8] {
        &self.effective_date
    }

    #[must_use]
    pub fn expiration_date(&self) -> &[u8] {
        &self.expiration_date
    }
}

impl fmt::Display for CvCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} issued by {}",
            self.role, self.holder_reference, self.authority_reference
        )
    }
}

fn missing(element: &'static str) -> EacError {
    error!("CV certificate lacks its {element}");
    EacError::InvalidCertificate(element)
}

fn reference(value: &[u8]) -> Result<String, EacError> {
    String::from_utf8(value.to_vec()).map_err(|_| {
        error!("Certificate reference is not printable: {}", bytes2hex(value));
        EacError::InvalidCertificate("reference is not printable")
    })
}

fn first_oid(value: &[u8]) -> Result<&[u8], EacError> {
    validate_asn1_tag(value, &[TAG_OID])?;
    Ok(get_asn1_child(value, 1)?.0)
}

fn role_from_chat(chat: &[u8]) -> Result<Role, EacError> {
    let (_, rest) = get_asn1_child(chat, 1)?;
    validate_asn1_tag(rest, &[TAG_DISCRETIONARY_DATA])?;
    let (authorization, _) = get_asn1_child(rest, 1)?;
    authorization
        .first()
        .map(|&bits| Role::from_authorization(bits))
        .ok_or_else(|| missing("role"))
}
