//! Byte and BER-TLV helpers.

use core::{fmt::Write, mem};

use tracing::error;

use crate::EacError;

/// Helper function that converts a byte slice into a hex string.
///
/// # Example
///
/// ```
/// use emrtd_eac::bytes2hex;
/// assert_eq!(bytes2hex(&[0xDE, 0xAD, 0xBE, 0xEF]), "DEADBEEF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut acc, &byte| {
            // Writing to a `String` never fails.
            let _ = write!(&mut acc, "{byte:02X}");
            acc
        })
}

/// Returns the length of the BER tag at the start of `data`.
///
/// A first byte with the low five bits set announces a multi-byte tag,
/// continued while bit 8 of the following bytes is set.
///
/// # Errors
///
/// * `EacError` if `data` ends inside the tag.
pub fn tag_len(data: &[u8]) -> Result<usize, EacError> {
    let Some(&first) = data.first() else {
        error!("Can not read a tag from empty data");
        return Err(EacError::ParseAsn1DataError(1, 0));
    };
    if first & 0x1F != 0x1F {
        return Ok(1);
    }
    let mut len = 1;
    loop {
        let Some(&byte) = data.get(len) else {
            error!("Tag continues past the end of data: {}", bytes2hex(data));
            return Err(EacError::ParseAsn1DataError(len + 1, data.len()));
        };
        len += 1;
        if byte & 0x80 == 0 {
            return Ok(len);
        }
    }
}

/// Parses the BER length field that follows a tag of `tag_len` bytes.
///
/// # Returns
///
/// A tuple of the offset where the value starts and the value length.
///
/// For example, if `tag_len` is 2 and the length field is `81 C8`,
/// the returned value will be `(4, 200)`.
///
/// # Errors
///
/// * `EacError` if the data is too short to read the length field.
pub fn len2int(data: &[u8], tag_len: usize) -> Result<(usize, usize), EacError> {
    let Some(&first) = data.get(tag_len) else {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `tag_len + 1`: `{}`",
            data.len(),
            tag_len + 1
        );
        return Err(EacError::ParseAsn1DataError(tag_len + 1, data.len()));
    };

    if first & 0x80 == 0 {
        return Ok((tag_len + 1, usize::from(first)));
    }

    let length_of_length = usize::from(first & 0x7F);
    if length_of_length == 0 || length_of_length > mem::size_of::<usize>() {
        error!("Unsupported length of length in BER length field: {length_of_length}");
        return Err(EacError::ParseAsn1DataError(tag_len + 1, data.len()));
    }
    let end = tag_len + 1 + length_of_length;
    let Some(length_bytes) = data.get(tag_len + 1..end) else {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `{end}`",
            data.len()
        );
        return Err(EacError::ParseAsn1DataError(end, data.len()));
    };

    let mut buf = [0_u8; mem::size_of::<usize>()];
    buf[mem::size_of::<usize>() - length_of_length..].copy_from_slice(length_bytes);
    Ok((end, usize::from_be_bytes(buf)))
}

/// Encodes `length` as a BER length field.
///
/// # Examples
///
/// ```
/// use emrtd_eac::int2asn1len;
///
/// assert_eq!(int2asn1len(42), [0x2A]);
/// assert_eq!(int2asn1len(200), [0x81, 0xC8]);
/// assert_eq!(int2asn1len(2024), [0x82, 0x07, 0xE8]);
/// ```
#[must_use]
pub fn int2asn1len(length: usize) -> Vec<u8> {
    let bytes = length.to_be_bytes();
    if length < 0x80 {
        return vec![bytes[bytes.len() - 1]];
    }
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let significant = &bytes[skip..];
    let mut encoded = Vec::with_capacity(significant.len() + 1);
    // At most eight length octets, so this fits the low seven bits.
    encoded.push(0x80 | significant.len() as u8);
    encoded.extend_from_slice(significant);
    encoded
}

/// Builds a TLV data object from `tag` and `value`.
#[must_use]
pub fn wrap_do(tag: &[u8], value: &[u8]) -> Vec<u8> {
    let length = int2asn1len(value.len());
    let mut out = Vec::with_capacity(tag.len() + length.len() + value.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(&length);
    out.extend_from_slice(value);
    out
}

/// Checks that `data` starts with `tag`. Multi-byte tags are supported.
///
/// # Errors
///
/// * `EacError` if the data is incomplete or the tags don't match.
pub fn validate_asn1_tag(data: &[u8], tag: &[u8]) -> Result<(), EacError> {
    let Some(found) = data.get(..tag.len()) else {
        error!(
            "Error while validating ASN1 tag, `data.len()`: `{}` is less than `tag.len()`: `{}`",
            data.len(),
            tag.len()
        );
        return Err(EacError::ParseAsn1DataError(tag.len(), data.len()));
    };
    if found != tag {
        error!(
            "Error while validating ASN1 tag, expected: {}, found {}",
            bytes2hex(tag),
            bytes2hex(found)
        );
        return Err(EacError::ParseAsn1TagError(bytes2hex(tag), bytes2hex(found)));
    }
    Ok(())
}

/// Splits the first TLV object off `data`.
///
/// # Returns
///
/// The value of the first object and the bytes following it.
///
/// # Errors
///
/// * `EacError` if the data is incomplete.
pub fn get_asn1_child(data: &[u8], tag_len: usize) -> Result<(&[u8], &[u8]), EacError> {
    let (value_start, value_len) = len2int(data, tag_len)?;
    let end = value_start
        .checked_add(value_len)
        .ok_or(EacError::ParseAsn1DataError(usize::MAX, data.len()))?;
    if data.len() < end {
        error!(
            "Error during get_asn1_child, `data.len()`: `{}` is less than `tl + v`: `{end}`",
            data.len()
        );
        return Err(EacError::ParseAsn1DataError(end, data.len()));
    }
    Ok((&data[value_start..end], &data[end..]))
}

/// Returns the value of the data object tagged `tag` that starts `data`.
///
/// # Errors
///
/// * `EacError` if the tag differs or the object is truncated.
pub fn unwrap_do<'a>(tag: &[u8], data: &'a [u8]) -> Result<&'a [u8], EacError> {
    validate_asn1_tag(data, tag)?;
    let (value, _) = get_asn1_child(data, tag.len())?;
    Ok(value)
}

/// Left-pads `data` with zeroes to `size` bytes, or keeps the last `size`
/// bytes when it is longer.
#[must_use]
pub fn align_to_size(data: &[u8], size: usize) -> Vec<u8> {
    if data.len() >= size {
        return data[data.len() - size..].to_vec();
    }
    let mut out = vec![0; size - data.len()];
    out.extend_from_slice(data);
    out
}

/// Minimal unsigned big-endian encoding of `value`, at least one byte long.
#[must_use]
pub fn unsigned_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes
        .iter()
        .take_while(|&&b| b == 0)
        .count()
        .min(bytes.len() - 1);
    bytes[skip..].to_vec()
}
