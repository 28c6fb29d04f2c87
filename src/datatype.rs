//! Attribute values and their storage codec.
//!
//! A value is stored as a `(text, binary, control)` triple. The first control
//! byte is the format version. Writers always produce version `0x02`; an empty
//! control block marks the legacy format, which remains readable.
//!
//! Version `0x02`:
//! * `control[1]` is the shape, `0x01` for scalars and `0x02` for arrays.
//! * Text-like values keep scalars verbatim in `text`. Arrays concatenate their
//!   elements in `text`, and `control` carries the element count followed by
//!   one length per element. Integers are little-endian `i32`, element lengths
//!   count UTF-16 code units.
//! * Images keep their payload in `binary`. A scalar's control block is
//!   size, 32 byte SHA-256 hash, mime type length and mime type bytes. Arrays
//!   hold the count, all sizes, all hashes, all mime type lengths and then all
//!   mime type bytes, while `binary` concatenates the payloads in order.

// used to print out readable forms of a value
use std::fmt;

use serde::{Deserialize, Serialize};
// integrity hash of binary values
use sha2::{Digest, Sha256};

use crate::error::{Result, StrataError};

pub const VERSION_LEGACY: u8 = 0x01;
pub const VERSION_CURRENT: u8 = 0x02;
const SHAPE_SCALAR: u8 = 0x01;
const SHAPE_ARRAY: u8 = 0x02;
const HASH_LENGTH: usize = 32;

// ------------- Value types --------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeValueType {
    Text,
    MultilineText,
    Integer,
    JSON,
    YAML,
    Image,
}
impl AttributeValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeValueType::Text => "text",
            AttributeValueType::MultilineText => "multiline_text",
            AttributeValueType::Integer => "integer",
            AttributeValueType::JSON => "json",
            AttributeValueType::YAML => "yaml",
            AttributeValueType::Image => "image",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(AttributeValueType::Text),
            "multiline_text" => Some(AttributeValueType::MultilineText),
            "integer" => Some(AttributeValueType::Integer),
            "json" => Some(AttributeValueType::JSON),
            "yaml" => Some(AttributeValueType::YAML),
            "image" => Some(AttributeValueType::Image),
            _ => None,
        }
    }
}
impl fmt::Display for AttributeValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------- Binary proxy --------------
/// Metadata of a binary payload, optionally with the payload itself.
#[derive(Debug, Clone)]
pub struct BinaryProxy {
    hash: Vec<u8>,
    mime_type: String,
    size: i32,
    data: Option<Vec<u8>>,
}
impl BinaryProxy {
    pub fn from_data(mime_type: impl Into<String>, data: Vec<u8>) -> Result<Self> {
        let size = i32::try_from(data.len()).map_err(|_| {
            StrataError::InvalidInput(format!("binary value of {} bytes is too large", data.len()))
        })?;
        let hash = Sha256::digest(&data).to_vec();
        Ok(Self {
            hash,
            mime_type: mime_type.into(),
            size,
            data: Some(data),
        })
    }
    pub fn from_hash(hash: Vec<u8>, mime_type: impl Into<String>, size: i32) -> Self {
        Self {
            hash,
            mime_type: mime_type.into(),
            size,
            data: None,
        }
    }
    pub fn from_hash_and_data(hash: Vec<u8>, mime_type: impl Into<String>, data: Vec<u8>) -> Result<Self> {
        let size = i32::try_from(data.len()).map_err(|_| {
            StrataError::InvalidInput(format!("binary value of {} bytes is too large", data.len()))
        })?;
        Ok(Self {
            hash,
            mime_type: mime_type.into(),
            size,
            data: Some(data),
        })
    }
    pub fn hash(&self) -> &[u8] {
        &self.hash
    }
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }
    pub fn size(&self) -> i32 {
        self.size
    }
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
    pub fn has_full_data(&self) -> bool {
        self.data.is_some()
    }
}
// Two proxies are equal when they describe the same payload, with or without it.
impl PartialEq for BinaryProxy {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.mime_type == other.mime_type && self.size == other.size
    }
}

// ------------- Attribute value --------------
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    MultilineText(String),
    Integer(i64),
    JSON(serde_json::Value),
    /// kept as its source text
    YAML(String),
    Image(BinaryProxy),
    TextArray(Vec<String>),
    MultilineTextArray(Vec<String>),
    IntegerArray(Vec<i64>),
    JSONArray(Vec<serde_json::Value>),
    YAMLArray(Vec<String>),
    ImageArray(Vec<BinaryProxy>),
}
impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        AttributeValue::Text(value.into())
    }
    pub fn value_type(&self) -> AttributeValueType {
        match self {
            AttributeValue::Text(_) | AttributeValue::TextArray(_) => AttributeValueType::Text,
            AttributeValue::MultilineText(_) | AttributeValue::MultilineTextArray(_) => {
                AttributeValueType::MultilineText
            }
            AttributeValue::Integer(_) | AttributeValue::IntegerArray(_) => AttributeValueType::Integer,
            AttributeValue::JSON(_) | AttributeValue::JSONArray(_) => AttributeValueType::JSON,
            AttributeValue::YAML(_) | AttributeValue::YAMLArray(_) => AttributeValueType::YAML,
            AttributeValue::Image(_) | AttributeValue::ImageArray(_) => AttributeValueType::Image,
        }
    }
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            AttributeValue::TextArray(_)
                | AttributeValue::MultilineTextArray(_)
                | AttributeValue::IntegerArray(_)
                | AttributeValue::JSONArray(_)
                | AttributeValue::YAMLArray(_)
                | AttributeValue::ImageArray(_)
        )
    }
    pub fn array_len(&self) -> Option<usize> {
        match self {
            AttributeValue::TextArray(v)
            | AttributeValue::MultilineTextArray(v)
            | AttributeValue::YAMLArray(v) => Some(v.len()),
            AttributeValue::IntegerArray(v) => Some(v.len()),
            AttributeValue::JSONArray(v) => Some(v.len()),
            AttributeValue::ImageArray(v) => Some(v.len()),
            _ => None,
        }
    }
    /// The text elements of a text or multiline text value, `None` for every
    /// other type.
    pub fn text_values(&self) -> Option<Vec<&str>> {
        match self {
            AttributeValue::Text(s) | AttributeValue::MultilineText(s) => Some(vec![s.as_str()]),
            AttributeValue::TextArray(v) | AttributeValue::MultilineTextArray(v) => {
                Some(v.iter().map(String::as_str).collect())
            }
            _ => None,
        }
    }
}
impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttributeValue::Text(s) | AttributeValue::MultilineText(s) | AttributeValue::YAML(s) => {
                write!(f, "{s}")
            }
            AttributeValue::Integer(i) => write!(f, "{i}"),
            AttributeValue::JSON(j) => write!(f, "{j}"),
            AttributeValue::Image(p) => write!(f, "<{} {} bytes>", p.mime_type, p.size),
            AttributeValue::TextArray(v)
            | AttributeValue::MultilineTextArray(v)
            | AttributeValue::YAMLArray(v) => write!(f, "[{}]", v.join(", ")),
            AttributeValue::IntegerArray(v) => write!(
                f,
                "[{}]",
                v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
            ),
            AttributeValue::JSONArray(v) => write!(
                f,
                "[{}]",
                v.iter().map(|j| j.to_string()).collect::<Vec<_>>().join(", ")
            ),
            AttributeValue::ImageArray(v) => write!(f, "[{} images]", v.len()),
        }
    }
}

// ------------- Codec --------------
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedValue {
    pub text: String,
    pub binary: Vec<u8>,
    pub control: Vec<u8>,
}

pub fn encode(value: &AttributeValue) -> Result<EncodedValue> {
    match value {
        AttributeValue::Text(s) | AttributeValue::MultilineText(s) | AttributeValue::YAML(s) => {
            Ok(encode_string(s.clone()))
        }
        AttributeValue::Integer(i) => Ok(encode_string(i.to_string())),
        AttributeValue::JSON(j) => Ok(encode_string(j.to_string())),
        AttributeValue::TextArray(v)
        | AttributeValue::MultilineTextArray(v)
        | AttributeValue::YAMLArray(v) => encode_string_array(v.iter().map(String::as_str)),
        AttributeValue::IntegerArray(v) => {
            let strings: Vec<String> = v.iter().map(|i| i.to_string()).collect();
            encode_string_array(strings.iter().map(String::as_str))
        }
        AttributeValue::JSONArray(v) => {
            let strings: Vec<String> = v.iter().map(|j| j.to_string()).collect();
            encode_string_array(strings.iter().map(String::as_str))
        }
        AttributeValue::Image(p) => encode_binary(p),
        AttributeValue::ImageArray(v) => encode_binary_array(v),
    }
}

pub fn decode(
    text: &str,
    binary: &[u8],
    control: &[u8],
    value_type: AttributeValueType,
    full_binary: bool,
) -> Result<AttributeValue> {
    if control.is_empty() {
        return decode_legacy(text, value_type);
    }
    let version = control[0];
    if version == VERSION_LEGACY {
        return Err(StrataError::decode(
            "did not expect attribute value to be stored in version 0x01",
        ));
    }
    if version != VERSION_CURRENT {
        return Err(StrataError::decode(format!(
            "unknown attribute value version 0x{version:02x}"
        )));
    }
    let shape = *control
        .get(1)
        .ok_or_else(|| StrataError::decode("control block lacks a shape byte"))?;
    let is_array = match shape {
        SHAPE_SCALAR => false,
        SHAPE_ARRAY => true,
        other => {
            return Err(StrataError::decode(format!("unknown value shape 0x{other:02x}")));
        }
    };
    match (value_type, is_array) {
        (AttributeValueType::Text, false) => Ok(AttributeValue::Text(text.to_owned())),
        (AttributeValueType::MultilineText, false) => {
            Ok(AttributeValue::MultilineText(text.to_owned()))
        }
        (AttributeValueType::Integer, false) => Ok(AttributeValue::Integer(parse_integer(text)?)),
        (AttributeValueType::JSON, false) => Ok(AttributeValue::JSON(serde_json::from_str(text)?)),
        (AttributeValueType::YAML, false) => Ok(AttributeValue::YAML(text.to_owned())),
        (AttributeValueType::Text, true) => Ok(AttributeValue::TextArray(decode_string_array(text, control)?)),
        (AttributeValueType::MultilineText, true) => Ok(AttributeValue::MultilineTextArray(
            decode_string_array(text, control)?,
        )),
        (AttributeValueType::Integer, true) => Ok(AttributeValue::IntegerArray(
            decode_string_array(text, control)?
                .iter()
                .map(|s| parse_integer(s))
                .collect::<Result<_>>()?,
        )),
        (AttributeValueType::JSON, true) => Ok(AttributeValue::JSONArray(
            decode_string_array(text, control)?
                .iter()
                .map(|s| serde_json::from_str(s).map_err(StrataError::from))
                .collect::<Result<_>>()?,
        )),
        (AttributeValueType::YAML, true) => Ok(AttributeValue::YAMLArray(decode_string_array(text, control)?)),
        (AttributeValueType::Image, false) => {
            let (hash, size, mime_type) = decode_binary_control(control)?;
            if full_binary {
                let data = binary
                    .get(..usize_from(size)?)
                    .ok_or_else(|| StrataError::decode("binary payload is truncated"))?;
                Ok(AttributeValue::Image(BinaryProxy::from_hash_and_data(hash, mime_type, data.to_vec())?))
            } else {
                Ok(AttributeValue::Image(BinaryProxy::from_hash(hash, mime_type, size)))
            }
        }
        (AttributeValueType::Image, true) => {
            let elements = decode_binary_array_control(control)?;
            let mut proxies = Vec::with_capacity(elements.len());
            let mut start = 0usize;
            for (hash, size, mime_type) in elements {
                if full_binary {
                    let end = start + usize_from(size)?;
                    let data = binary
                        .get(start..end)
                        .ok_or_else(|| StrataError::decode("binary payload is truncated"))?;
                    proxies.push(BinaryProxy::from_hash_and_data(hash, mime_type, data.to_vec())?);
                    start = end;
                } else {
                    proxies.push(BinaryProxy::from_hash(hash, mime_type, size));
                }
            }
            Ok(AttributeValue::ImageArray(proxies))
        }
    }
}

fn encode_string(value: String) -> EncodedValue {
    EncodedValue {
        text: value,
        binary: Vec::new(),
        control: vec![VERSION_CURRENT, SHAPE_SCALAR],
    }
}

fn encode_string_array<'a, I: Iterator<Item = &'a str> + Clone>(values: I) -> Result<EncodedValue> {
    let mut control = vec![VERSION_CURRENT, SHAPE_ARRAY];
    let count = values.clone().count();
    control.extend_from_slice(&i32_from(count)?.to_le_bytes());
    let mut text = String::new();
    for value in values {
        control.extend_from_slice(&i32_from(value.encode_utf16().count())?.to_le_bytes());
        text.push_str(value);
    }
    Ok(EncodedValue {
        text,
        binary: Vec::new(),
        control,
    })
}

fn check_binary(proxy: &BinaryProxy) -> Result<&[u8]> {
    let data = proxy.data().ok_or_else(|| {
        StrataError::Encode("cannot encode a binary value that does not contain the full data".into())
    })?;
    if proxy.hash.len() != HASH_LENGTH {
        return Err(StrataError::Encode(format!(
            "hash of invalid length {} for binary value",
            proxy.hash.len()
        )));
    }
    Ok(data)
}

fn encode_binary(proxy: &BinaryProxy) -> Result<EncodedValue> {
    let data = check_binary(proxy)?;
    let mime = proxy.mime_type.as_bytes();
    let mut control = vec![VERSION_CURRENT, SHAPE_SCALAR];
    control.extend_from_slice(&proxy.size.to_le_bytes());
    control.extend_from_slice(&proxy.hash);
    control.extend_from_slice(&i32_from(mime.len())?.to_le_bytes());
    control.extend_from_slice(mime);
    Ok(EncodedValue {
        text: String::new(),
        binary: data.to_vec(),
        control,
    })
}

fn encode_binary_array(proxies: &[BinaryProxy]) -> Result<EncodedValue> {
    let mut binary = Vec::new();
    for proxy in proxies {
        binary.extend_from_slice(check_binary(proxy)?);
    }
    let mut control = vec![VERSION_CURRENT, SHAPE_ARRAY];
    control.extend_from_slice(&i32_from(proxies.len())?.to_le_bytes());
    for proxy in proxies {
        control.extend_from_slice(&proxy.size.to_le_bytes());
    }
    for proxy in proxies {
        control.extend_from_slice(&proxy.hash);
    }
    for proxy in proxies {
        control.extend_from_slice(&i32_from(proxy.mime_type.len())?.to_le_bytes());
    }
    for proxy in proxies {
        control.extend_from_slice(proxy.mime_type.as_bytes());
    }
    Ok(EncodedValue {
        text: String::new(),
        binary,
        control,
    })
}

fn decode_string_array(text: &str, control: &[u8]) -> Result<Vec<String>> {
    let mut reader = ControlReader::new(control, 2);
    let count = reader.read_len()?;
    let lengths = (0..count).map(|_| reader.read_len()).collect::<Result<Vec<_>>>()?;
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut elements = Vec::with_capacity(count);
    let mut start = 0usize;
    for len in lengths {
        let end = start + len;
        let slice = units
            .get(start..end)
            .ok_or_else(|| StrataError::decode("text is shorter than its element lengths"))?;
        let element = String::from_utf16(slice)
            .map_err(|_| StrataError::decode("element boundary splits a character"))?;
        elements.push(element);
        start = end;
    }
    if start != units.len() {
        return Err(StrataError::decode(format!(
            "{} text units beyond the element lengths",
            units.len() - start
        )));
    }
    Ok(elements)
}

fn decode_binary_control(control: &[u8]) -> Result<(Vec<u8>, i32, String)> {
    let mut reader = ControlReader::new(control, 2);
    let size = reader.read_i32()?;
    let hash = reader.read_bytes(HASH_LENGTH)?.to_vec();
    let mime_len = reader.read_len()?;
    let mime_type = reader.read_utf8(mime_len)?;
    Ok((hash, size, mime_type))
}

fn decode_binary_array_control(control: &[u8]) -> Result<Vec<(Vec<u8>, i32, String)>> {
    let mut reader = ControlReader::new(control, 2);
    let count = reader.read_len()?;
    let sizes = (0..count).map(|_| reader.read_i32()).collect::<Result<Vec<_>>>()?;
    let hashes = (0..count)
        .map(|_| reader.read_bytes(HASH_LENGTH).map(<[u8]>::to_vec))
        .collect::<Result<Vec<_>>>()?;
    let mime_lengths = (0..count).map(|_| reader.read_len()).collect::<Result<Vec<_>>>()?;
    let mime_types = mime_lengths
        .into_iter()
        .map(|len| reader.read_utf8(len))
        .collect::<Result<Vec<_>>>()?;
    Ok(hashes
        .into_iter()
        .zip(sizes)
        .zip(mime_types)
        .map(|((hash, size), mime)| (hash, size, mime))
        .collect())
}

fn decode_legacy(text: &str, value_type: AttributeValueType) -> Result<AttributeValue> {
    let mut chars = text.chars();
    let marker = chars
        .next()
        .ok_or_else(|| StrataError::decode("legacy value lacks its multiplicity marker"))?;
    let rest = chars.as_str();
    if marker == 'A' {
        let values: Vec<String> = tokenize(rest, ',', '\\')
            .into_iter()
            .map(|v| v.replace("\\\\", "\\"))
            .collect();
        match value_type {
            AttributeValueType::Text => Ok(AttributeValue::TextArray(values)),
            AttributeValueType::MultilineText => Ok(AttributeValue::MultilineTextArray(values)),
            AttributeValueType::Integer => Ok(AttributeValue::IntegerArray(
                values.iter().map(|s| parse_integer(s)).collect::<Result<_>>()?,
            )),
            AttributeValueType::JSON => Ok(AttributeValue::JSONArray(
                values
                    .iter()
                    .map(|s| serde_json::from_str(s).map_err(StrataError::from))
                    .collect::<Result<_>>()?,
            )),
            AttributeValueType::YAML => Ok(AttributeValue::YAMLArray(values)),
            AttributeValueType::Image => Err(StrataError::decode(
                "image values have no legacy representation",
            )),
        }
    } else {
        match value_type {
            AttributeValueType::Text => Ok(AttributeValue::Text(rest.to_owned())),
            AttributeValueType::MultilineText => Ok(AttributeValue::MultilineText(rest.to_owned())),
            AttributeValueType::Integer => Ok(AttributeValue::Integer(parse_integer(rest)?)),
            AttributeValueType::JSON => Ok(AttributeValue::JSON(serde_json::from_str(rest)?)),
            AttributeValueType::YAML => Ok(AttributeValue::YAML(rest.to_owned())),
            AttributeValueType::Image => Err(StrataError::decode(
                "image values have no legacy representation",
            )),
        }
    }
}

// Splits on unescaped separators, dropping the escape characters.
fn tokenize(input: &str, separator: char, escape: char) -> Vec<String> {
    if input.is_empty() {
        return vec![String::new()];
    }
    let mut tokens = Vec::new();
    let mut buffer = String::new();
    let mut escaping = false;
    for c in input.chars() {
        if escaping {
            buffer.push(c);
            escaping = false;
        } else if c == escape {
            escaping = true;
        } else if c == separator {
            tokens.push(std::mem::take(&mut buffer));
        } else {
            buffer.push(c);
        }
    }
    if !buffer.is_empty() || input.ends_with(separator) {
        tokens.push(buffer);
    }
    tokens
}

fn parse_integer(s: &str) -> Result<i64> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| StrataError::decode(format!("'{s}' is not an integer: {e}")))
}

fn i32_from(n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| StrataError::Encode(format!("length {n} does not fit the control block")))
}

fn usize_from(n: i32) -> Result<usize> {
    usize::try_from(n).map_err(|_| StrataError::decode(format!("negative length {n}")))
}

struct ControlReader<'a> {
    control: &'a [u8],
    offset: usize,
}
impl<'a> ControlReader<'a> {
    fn new(control: &'a [u8], offset: usize) -> Self {
        Self { control, offset }
    }
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset + len;
        let bytes = self
            .control
            .get(self.offset..end)
            .ok_or_else(|| StrataError::decode(format!("control block truncated at byte {}", self.offset)))?;
        self.offset = end;
        Ok(bytes)
    }
    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
    fn read_len(&mut self) -> Result<usize> {
        usize_from(self.read_i32()?)
    }
    fn read_utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StrataError::decode("mime type is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_handles_escapes_and_edges() {
        assert_eq!(tokenize("a,b", ',', '\\'), vec!["a", "b"]);
        assert_eq!(tokenize("a\\,b,c", ',', '\\'), vec!["a,b", "c"]);
        assert_eq!(tokenize("a,", ',', '\\'), vec!["a", ""]);
        assert_eq!(tokenize("", ',', '\\'), vec![""]);
    }

    #[test]
    fn control_reader_reports_truncation() {
        let mut reader = ControlReader::new(&[0x02, 0x02, 0x01, 0x00], 2);
        assert!(reader.read_i32().is_err());
    }

    #[test]
    fn negative_lengths_are_rejected() {
        let mut control = vec![VERSION_CURRENT, SHAPE_ARRAY];
        control.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(decode("", &[], &control, AttributeValueType::Text, false).is_err());
    }
}
