// Copyright (C) 2025 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # TLV
//!
//! Decoder for the BER-TLV data objects used by the access rule applets.
//!
//! Lengths follow GlobalPlatform 2.2.1 §11.1.5 (ISO/IEC 7816-4): a first length byte
//! below 0x80 is the length itself, otherwise its low 7 bits give the number of
//! big-endian length bytes that follow.

use thiserror::Error;

/// First length byte at or above this value starts a long-form length.
const SINGLE_BYTE_MAX_LENGTH: u8 = 0x80;

/// Decoder failures. Each one carries the tag being decoded, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlvError {
    /// The data doesn't start with the expected tag.
    #[error("tags don't match: expected {expected}, found {found}")]
    TagMismatch { expected: String, found: String },
    /// The data ends before the length field does.
    #[error("no length for tag {tag}")]
    TruncatedLength { tag: String },
    /// The long-form length uses zero bytes or more than fit in a `usize`.
    #[error("unsupported length encoding {first_byte:#04x} for tag {tag}")]
    UnsupportedLength { tag: String, first_byte: u8 },
    /// Fewer bytes remain than the length field declares.
    #[error("not enough data for tag {tag}: declared {declared}, available {available}")]
    TruncatedValue { tag: String, declared: usize, available: usize },
    /// Exact consumption was required but bytes follow the value.
    #[error("did not consume all for tag {tag}: {remaining} bytes left")]
    TrailingData { tag: String, remaining: usize },
}

/// One decoded data object, borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvNode<'a> {
    /// Tag bytes.
    pub tag: &'a [u8],
    /// Declared length of `value`.
    pub length: usize,
    /// Width in bytes of the encoded length field.
    pub length_field_width: usize,
    /// Value bytes.
    pub value: &'a [u8],
}

/// Reads the length field that starts at `offset`.
///
/// Returns the declared length and the width of the length field in bytes.
pub fn parse_length(data: &[u8], offset: usize) -> Result<(usize, usize), TlvError> {
    parse_length_for(data, offset, &data[..offset.min(data.len())])
}

fn parse_length_for(data: &[u8], offset: usize, tag: &[u8]) -> Result<(usize, usize), TlvError> {
    let first_byte = *data
        .get(offset)
        .ok_or_else(|| TlvError::TruncatedLength { tag: hex::encode_upper(tag) })?;
    if first_byte < SINGLE_BYTE_MAX_LENGTH {
        return Ok((first_byte as usize, 1));
    }

    let num_bytes = (first_byte - SINGLE_BYTE_MAX_LENGTH) as usize;
    if num_bytes == 0 || num_bytes > std::mem::size_of::<usize>() {
        return Err(TlvError::UnsupportedLength { tag: hex::encode_upper(tag), first_byte });
    }
    let length_bytes = data
        .get(offset + 1..offset + 1 + num_bytes)
        .ok_or_else(|| TlvError::TruncatedLength { tag: hex::encode_upper(tag) })?;
    let length = length_bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((length, 1 + num_bytes))
}

/// Decodes the data object tagged `tag` at the start of `data`.
///
/// Returns the node and whatever follows it. With `consume_all`, trailing bytes are an
/// error.
pub fn parse<'a>(
    data: &'a [u8],
    tag: &'a [u8],
    consume_all: bool,
) -> Result<(TlvNode<'a>, &'a [u8]), TlvError> {
    if !data.starts_with(tag) {
        let found = &data[..tag.len().min(data.len())];
        return Err(TlvError::TagMismatch {
            expected: hex::encode_upper(tag),
            found: hex::encode_upper(found),
        });
    }

    let (length, length_field_width) = parse_length_for(data, tag.len(), tag)?;
    let index = tag.len() + length_field_width;
    let available = data.len() - index;
    if available < length {
        return Err(TlvError::TruncatedValue {
            tag: hex::encode_upper(tag),
            declared: length,
            available,
        });
    }
    if consume_all && available != length {
        return Err(TlvError::TrailingData {
            tag: hex::encode_upper(tag),
            remaining: available - length,
        });
    }

    let node = TlvNode { tag, length, length_field_width, value: &data[index..index + length] };
    Ok((node, &data[index + length..]))
}
