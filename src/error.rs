//! Error type shared by every layer of the crate.

use core::fmt;
use std::num::TryFromIntError;

/// APDU commands issued by this crate, used to name the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SelectApplet,
    SelectFile,
    ReadBinary,
    GetChallenge,
    InternalAuthenticate,
    ExternalAuthenticate,
    MutualAuthenticate,
    MseSetDst,
    MseSetAt,
    MseSetKat,
    PsoVerifyCertificate,
    GeneralAuthenticate,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::SelectApplet => "SELECT (applet)",
            Self::SelectFile => "SELECT (file)",
            Self::ReadBinary => "READ BINARY",
            Self::GetChallenge => "GET CHALLENGE",
            Self::InternalAuthenticate => "INTERNAL AUTHENTICATE",
            Self::ExternalAuthenticate => "EXTERNAL AUTHENTICATE",
            Self::MutualAuthenticate => "EXTERNAL AUTHENTICATE (mutual)",
            Self::MseSetDst => "MSE:SET DST",
            Self::MseSetAt => "MSE:SET AT",
            Self::MseSetKat => "MSE:SET KAT",
            Self::PsoVerifyCertificate => "PSO:VERIFY CERTIFICATE",
            Self::GeneralAuthenticate => "GENERAL AUTHENTICATE",
        };
        f.write_str(name)
    }
}

/// Authentication protocols run by [`crate::PassportService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Bac,
    Ca,
    Ta,
    Aa,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::Bac => "Basic Access Control",
            Self::Ca => "Chip Authentication",
            Self::Ta => "Terminal Authentication",
            Self::Aa => "Active Authentication",
        })
    }
}

/// Coarse classification of an [`EacError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Card or link I/O failed.
    Transport,
    /// MAC mismatch or malformed secure messaging data. The SSC has already
    /// been advanced when this is reported.
    SecureChannel,
    /// The card rejected an authentication step.
    AuthenticationDenied,
    /// A precondition was violated before anything was sent to the card.
    InvalidInput,
    /// The Terminal Authentication certificate chain has the wrong shape.
    InvalidChainStructure,
    /// A file access command returned an error status word.
    CardStatus,
    /// A local cryptographic primitive failed.
    Crypto,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum EacError {
    PcscError(pcsc::Error),
    TransportError(String),
    InvalidResponseError(),
    VerifyMacError(),
    MalformedPadding(),
    MalformedSecureResponse(&'static str),
    FileNotFound(u16),
    AccessDenied(u16),
    RecvApduError(Command, u16),
    MutualAuthFailed(u16),
    AuthenticationDenied(Protocol, Command, u16),
    CertificateRejected(String, u16),
    SignatureRejected(u16),
    RecoveryFailed(&'static str),
    InvalidArgument(&'static str),
    InvalidState(&'static str),
    ParseMrzCharError(char),
    ParseMrzFieldError(&'static str, String),
    ParseAsn1DataError(usize, usize),
    ParseAsn1TagError(String, String),
    InvalidCertificate(&'static str),
    InvalidChainStructure(String),
    UnsupportedAlgorithm(String),
    CalculateHashError(&'static str),
    OpensslErrorStack(openssl::error::ErrorStack),
    UnpadError(cipher::block_padding::UnpadError),
    IntCastError(TryFromIntError),
}

impl EacError {
    /// Maps the error onto the crate's error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match *self {
            Self::PcscError(_) | Self::TransportError(_) | Self::InvalidResponseError() => {
                ErrorKind::Transport
            }
            Self::VerifyMacError()
            | Self::MalformedPadding()
            | Self::MalformedSecureResponse(_) => ErrorKind::SecureChannel,
            Self::FileNotFound(_) | Self::AccessDenied(_) | Self::RecvApduError(..) => {
                ErrorKind::CardStatus
            }
            Self::MutualAuthFailed(_)
            | Self::AuthenticationDenied(..)
            | Self::CertificateRejected(..)
            | Self::SignatureRejected(_)
            | Self::RecoveryFailed(_) => ErrorKind::AuthenticationDenied,
            Self::InvalidArgument(_)
            | Self::InvalidState(_)
            | Self::ParseMrzCharError(_)
            | Self::ParseMrzFieldError(..)
            | Self::ParseAsn1DataError(..)
            | Self::ParseAsn1TagError(..)
            | Self::InvalidCertificate(_)
            | Self::UnsupportedAlgorithm(_) => ErrorKind::InvalidInput,
            Self::InvalidChainStructure(_) => ErrorKind::InvalidChainStructure,
            Self::CalculateHashError(_)
            | Self::OpensslErrorStack(_)
            | Self::UnpadError(_)
            | Self::IntCastError(_) => ErrorKind::Crypto,
        }
    }

    /// The status word returned by the card, if the error carries one.
    #[must_use]
    pub const fn status_word(&self) -> Option<u16> {
        match *self {
            Self::FileNotFound(sw)
            | Self::AccessDenied(sw)
            | Self::RecvApduError(_, sw)
            | Self::MutualAuthFailed(sw)
            | Self::AuthenticationDenied(_, _, sw)
            | Self::CertificateRejected(_, sw)
            | Self::SignatureRejected(sw) => Some(sw),
            _ => None,
        }
    }
}

impl fmt::Display for EacError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::PcscError(ref e) => fmt::Display::fmt(&e, f),
            Self::TransportError(ref msg) => write!(f, "Card transport failure: {msg}"),
            Self::InvalidResponseError() => write!(f, "Card response is invalid"),
            Self::VerifyMacError() => write!(f, "Secure messaging MAC is not correct"),
            Self::MalformedPadding() => write!(f, "Data does not end in ISO 9797-1 padding"),
            Self::MalformedSecureResponse(msg) => {
                write!(f, "Malformed secure messaging response: {msg}")
            }
            Self::FileNotFound(sw) => write!(f, "File not found, status code: {sw:04X}"),
            Self::AccessDenied(sw) => write!(f, "Access denied, status code: {sw:04X}"),
            Self::RecvApduError(command, sw) => {
                write!(f, "{command} failed with status code: {sw:04X}")
            }
            Self::MutualAuthFailed(sw) => {
                write!(f, "Mutual authentication failed, status code: {sw:04X}")
            }
            Self::AuthenticationDenied(protocol, command, sw) => write!(
                f,
                "{protocol} denied at {command}, status code: {sw:04X}"
            ),
            Self::CertificateRejected(ref holder, sw) => write!(
                f,
                "Card rejected certificate {holder}, status code: {sw:04X}"
            ),
            Self::SignatureRejected(sw) => write!(
                f,
                "Card rejected terminal signature, status code: {sw:04X}"
            ),
            Self::RecoveryFailed(msg) => write!(f, "ISO 9796-2 message recovery failed: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Self::InvalidState(msg) => write!(f, "Invalid session state: {msg}"),
            Self::ParseMrzCharError(c) => write!(f, "MRZ can not contain the character: {c}"),
            Self::ParseMrzFieldError(field, ref value) => {
                write!(f, "MRZ field {field} is invalid: {value}")
            }
            Self::ParseAsn1DataError(expected, found) => write!(
                f,
                "ASN.1 data is incomplete, expected len: {expected}, found len: {found}"
            ),
            Self::ParseAsn1TagError(ref expected, ref found) => {
                write!(f, "Invalid ASN.1 tag, expected: {expected}, found: {found}")
            }
            Self::InvalidCertificate(msg) => write!(f, "Invalid CV certificate: {msg}"),
            Self::InvalidChainStructure(ref msg) => {
                write!(f, "Invalid terminal certificate chain: {msg}")
            }
            Self::UnsupportedAlgorithm(ref alg) => write!(f, "Unsupported algorithm: {alg}"),
            Self::CalculateHashError(msg) => {
                write!(f, "Failure during calculation of hashes: {msg}")
            }
            Self::OpensslErrorStack(ref e) => fmt::Display::fmt(&e, f),
            Self::UnpadError(ref e) => fmt::Display::fmt(&e, f),
            Self::IntCastError(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}

impl std::error::Error for EacError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::PcscError(ref e) => Some(e),
            Self::OpensslErrorStack(ref e) => Some(e),
            Self::IntCastError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<openssl::error::ErrorStack> for EacError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::OpensslErrorStack(err)
    }
}
