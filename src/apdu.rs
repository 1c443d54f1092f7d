//! ISO/IEC 7816-4 command and response APDUs.

use tracing::error;

use crate::{util::bytes2hex, EacError};

pub const SW_NO_ERROR: u16 = 0x9000;
pub const SW_END_OF_FILE: u16 = 0x6282;
pub const SW_WRONG_LENGTH: u16 = 0x6700;
pub const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_COMMAND_NOT_ALLOWED: u16 = 0x6986;
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;

pub const CLA_ISO7816: u8 = 0x00;
pub const CLA_COMMAND_CHAINING: u8 = 0x10;
pub const CLA_SECURE_MESSAGING: u8 = 0x0C;

pub const INS_SELECT: u8 = 0xA4;
pub const INS_READ_BINARY: u8 = 0xB0;
pub const INS_READ_BINARY2: u8 = 0xB1;
pub const INS_GET_CHALLENGE: u8 = 0x84;
pub const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
pub const INS_EXTERNAL_AUTHENTICATE: u8 = 0x82;
pub const INS_MSE: u8 = 0x22;
pub const INS_PSO: u8 = 0x2A;
pub const INS_GENERAL_AUTHENTICATE: u8 = 0x86;

/// Largest Nc an extended-length command can carry.
pub const MAX_NC: usize = 0xFFFF;
/// Largest Ne an extended-length command can request.
pub const MAX_NE: usize = 0x1_0000;

/// A command APDU.
///
/// `ne` is the number of expected response bytes; `0` means no Le field,
/// `256` is encoded as a short Le of `00`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    ne: usize,
}

impl CommandApdu {
    /// Creates a case 1 command (header only).
    ///
    /// # Example
    ///
    /// ```
    /// use emrtd_eac::CommandApdu;
    /// let apdu = CommandApdu::new(0x00, 0x84, 0x00, 0x00).with_ne(8);
    /// assert_eq!(apdu.to_bytes().unwrap(), [0x00, 0x84, 0x00, 0x00, 0x08]);
    /// ```
    #[must_use]
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            ne: 0,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    #[must_use]
    pub const fn with_ne(mut self, ne: usize) -> Self {
        self.ne = ne;
        self
    }

    #[must_use]
    pub const fn cla(&self) -> u8 {
        self.cla
    }

    #[must_use]
    pub const fn ins(&self) -> u8 {
        self.ins
    }

    #[must_use]
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    #[must_use]
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub const fn ne(&self) -> usize {
        self.ne
    }

    /// The command header `CLA INS P1 P2`.
    #[must_use]
    pub const fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Serialises the command, choosing short or extended length encoding.
    ///
    /// Extended encoding is used as soon as Nc exceeds 255 or Ne exceeds 256;
    /// Lc and Le then share the extended form.
    ///
    /// # Errors
    ///
    /// * `EacError` if Nc or Ne exceed what extended length can express.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EacError> {
        let nc = self.data.len();
        if nc > MAX_NC || self.ne > MAX_NE {
            error!(
                "APDU lengths out of range, Nc: {nc}, Ne: {}",
                self.ne
            );
            return Err(EacError::InvalidArgument("APDU lengths out of range"));
        }

        let mut out = Vec::with_capacity(4 + 3 + nc + 3);
        out.extend_from_slice(&self.header());

        let extended = nc > 0xFF || self.ne > 0x100;
        // Truncating casts below keep the low bytes, so 256 and 65536 encode as zero.
        if nc > 0 {
            if extended {
                out.push(0x00);
                out.extend_from_slice(&(nc as u16).to_be_bytes());
            } else {
                out.push(nc as u8);
            }
            out.extend_from_slice(&self.data);
        }
        if self.ne > 0 {
            if extended {
                if nc == 0 {
                    out.push(0x00);
                }
                out.extend_from_slice(&(self.ne as u16).to_be_bytes());
            } else {
                out.push(self.ne as u8);
            }
        }
        Ok(out)
    }
}

/// A response APDU: response data followed by the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    data: Vec<u8>,
    sw: u16,
}

impl ResponseApdu {
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>, sw: u16) -> Self {
        Self {
            data: data.into(),
            sw,
        }
    }

    /// Splits raw response bytes into data and status word.
    ///
    /// # Errors
    ///
    /// * `EacError` if the response is shorter than a status word.
    pub fn from_bytes(response: &[u8]) -> Result<Self, EacError> {
        if response.len() < 2 {
            error!(
                "Card response length should be greater than or equal to 2, found {}: {}",
                response.len(),
                bytes2hex(response)
            );
            return Err(EacError::InvalidResponseError());
        }
        let (data, sw) = response.split_at(response.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            sw: u16::from_be_bytes([sw[0], sw[1]]),
        })
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub const fn sw(&self) -> u16 {
        self.sw
    }

    #[cfg(test)]
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.sw.to_be_bytes());
        out
    }
}
