// LDAP protocol handling with BER encoding/decoding
// Client side of the LDAP v3 message set (RFC 4511)

use crate::error::{LdapError, Result};
use crate::filter::Filter;
use std::fmt;

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// StartTLS extended operation (RFC 4511 §4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Unsolicited Notice of Disconnection (RFC 4511 §4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Upper bound for a single frame unless the caller configures another.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// LDAP Message structure
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

impl ProtocolOp {
    /// Application tag this operation is framed with.
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolOp::BindRequest(_) => LDAP_TAG_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => LDAP_TAG_BIND_RESPONSE,
            ProtocolOp::UnbindRequest => LDAP_TAG_UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => LDAP_TAG_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => LDAP_TAG_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => LDAP_TAG_SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => LDAP_TAG_SEARCH_RESULT_DONE,
            ProtocolOp::AbandonRequest(_) => LDAP_TAG_ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => LDAP_TAG_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => LDAP_TAG_EXTENDED_RESPONSE,
        }
    }

    /// Human-readable operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BIND",
            ProtocolOp::BindResponse(_) => "BIND_RESPONSE",
            ProtocolOp::UnbindRequest => "UNBIND",
            ProtocolOp::SearchRequest(_) => "SEARCH",
            ProtocolOp::SearchResultEntry(_) => "SEARCH_ENTRY",
            ProtocolOp::SearchResultReference(_) => "SEARCH_REFERENCE",
            ProtocolOp::SearchResultDone(_) => "SEARCH_DONE",
            ProtocolOp::AbandonRequest(_) => "ABANDON",
            ProtocolOp::ExtendedRequest(_) => "EXTENDED",
            ProtocolOp::ExtendedResponse(_) => "EXTENDED_RESPONSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    /// Simple authentication, [0] IMPLICIT OCTET STRING. Not required to be UTF-8.
    pub password: Vec<u8>,
}

/// Protocol result codes. Codes without a named variant survive as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    Other,
    Unknown(i32),
}

impl ResultCode {
    pub fn code(self) -> i32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongerAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::InappropriateMatching => 18,
            ResultCode::ConstraintViolation => 19,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::LoopDetect => 54,
            ResultCode::Other => 80,
            ResultCode::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            7 => ResultCode::AuthMethodNotSupported,
            8 => ResultCode::StrongerAuthRequired,
            10 => ResultCode::Referral,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            13 => ResultCode::ConfidentialityRequired,
            16 => ResultCode::NoSuchAttribute,
            17 => ResultCode::UndefinedAttributeType,
            18 => ResultCode::InappropriateMatching,
            19 => ResultCode::ConstraintViolation,
            21 => ResultCode::InvalidAttributeSyntax,
            32 => ResultCode::NoSuchObject,
            33 => ResultCode::AliasProblem,
            34 => ResultCode::InvalidDnSyntax,
            48 => ResultCode::InappropriateAuthentication,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            54 => ResultCode::LoopDetect,
            80 => ResultCode::Other,
            other => ResultCode::Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Unknown(code) => write!(f, "resultCode {}", code),
            named => write!(f, "{:?} ({})", named, named.code()),
        }
    }
}

/// LDAPResult: shared body of every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referral: Vec<String>,
}

impl LdapResult {
    pub fn new(result_code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referral: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }

    /// Turn a non-success result into an `Operation` error.
    pub fn success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(LdapError::Operation {
                code: self.result_code,
                matched_dn: self.matched_dn,
                diagnostic: self.diagnostic_message,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base = 0,
    OneLevel = 1,
    Subtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = LdapError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::Base),
            1 => Ok(SearchScope::OneLevel),
            2 => Ok(SearchScope::Subtree),
            _ => Err(LdapError::protocol(format!("Invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    #[default]
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl TryFrom<u8> for DerefAliases {
    type Error = LdapError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObject),
            3 => Ok(DerefAliases::Always),
            _ => Err(LdapError::protocol(format!("Invalid derefAliases: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<PartialAttribute>,
}

/// Attribute as it appears on the wire: type plus values in transmitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

// Universal tags
const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0A;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| LdapError::protocol("BER truncated: unexpected end of element"))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let tag = self.read_byte()?;
        if tag & 0x1F == 0x1F {
            return Err(LdapError::protocol(format!(
                "Multi-byte tag 0x{:02X} not supported",
                tag
            )));
        }
        Ok(tag)
    }

    /// Length octets; the value must fit in what is left of this element.
    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let first_byte = self.read_byte()?;
        let length = if first_byte & 0x80 == 0 {
            first_byte as usize
        } else {
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                return Err(LdapError::protocol("Indefinite length not supported"));
            }
            if length_bytes > 4 {
                return Err(LdapError::protocol(format!(
                    "Length too large: {} bytes",
                    length_bytes
                )));
            }
            let mut length = 0usize;
            for _ in 0..length_bytes {
                length = (length << 8) | self.read_byte()? as usize;
            }
            length
        };
        if length > self.remaining() {
            return Err(LdapError::protocol(format!(
                "BER length {} exceeds remaining {} bytes",
                length,
                self.remaining()
            )));
        }
        Ok(length)
    }

    /// Read one complete TLV, returning its tag and contents.
    pub(crate) fn read_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        let contents = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok((tag, contents))
    }

    pub(crate) fn expect(&mut self, tag: u8, what: &str) -> Result<&'a [u8]> {
        let (found, contents) = self.read_tlv()?;
        if found != tag {
            return Err(LdapError::protocol(format!(
                "Expected {} tag (0x{:02X}), got: 0x{:02X}",
                what, tag, found
            )));
        }
        Ok(contents)
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        decode_integer(self.expect(TAG_INTEGER, "INTEGER")?)
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<i32> {
        decode_integer(self.expect(TAG_ENUMERATED, "ENUMERATED")?)
    }

    /// ENUMERATED restricted to a small non-negative range (scope, derefAliases).
    fn read_small_enumerated(&mut self) -> Result<u8> {
        let value = self.read_enumerated()?;
        u8::try_from(value)
            .map_err(|_| LdapError::protocol(format!("Enumerated value out of range: {}", value)))
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        decode_boolean(self.expect(TAG_BOOLEAN, "BOOLEAN")?)
    }

    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        Ok(self.expect(TAG_OCTET_STRING, "OCTET STRING")?.to_vec())
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        decode_utf8(self.expect(TAG_OCTET_STRING, "OCTET STRING")?)
    }

    pub(crate) fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.expect(TAG_SEQUENCE, "SEQUENCE")?))
    }

    /// Error unless every byte of this element was consumed.
    pub(crate) fn finish(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(LdapError::protocol(format!(
                "{}: {} trailing bytes",
                what,
                self.remaining()
            )))
        }
    }
}

fn decode_integer(contents: &[u8]) -> Result<i32> {
    if contents.is_empty() {
        return Err(LdapError::protocol("Integer with zero-length contents"));
    }
    if contents.len() > 4 {
        return Err(LdapError::protocol(format!(
            "Integer too large: {} bytes",
            contents.len()
        )));
    }
    // Sign extension for negative numbers
    let mut value: i32 = if contents[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in contents {
        value = (value << 8) | byte as i32;
    }
    Ok(value)
}

fn decode_boolean(contents: &[u8]) -> Result<bool> {
    if contents.len() != 1 {
        return Err(LdapError::protocol(format!(
            "Boolean value must be 1 byte, got: {}",
            contents.len()
        )));
    }
    Ok(contents[0] != 0)
}

pub(crate) fn decode_utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| LdapError::protocol("Invalid UTF-8 string"))
}

// BER encoding utilities
pub(crate) struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub(crate) fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub(crate) fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        let mut encoded = Vec::with_capacity(5);
        encode_length(length, &mut encoded);
        self.buffer.extend_from_slice(&encoded);
    }

    /// INTEGER-style contents under an arbitrary tag (ENUMERATED, Abandon).
    pub(crate) fn write_integer_with_tag(&mut self, tag: u8, value: i32) {
        let contents = integer_contents(value);
        self.write_tag(tag);
        self.write_length(contents.len());
        self.buffer.extend_from_slice(&contents);
    }

    pub(crate) fn write_integer(&mut self, value: i32) {
        self.write_integer_with_tag(TAG_INTEGER, value);
    }

    pub(crate) fn write_enumerated(&mut self, value: i32) {
        self.write_integer_with_tag(TAG_ENUMERATED, value);
    }

    pub(crate) fn write_octet_string_with_tag(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub(crate) fn write_octet_string(&mut self, data: &[u8]) {
        self.write_octet_string_with_tag(TAG_OCTET_STRING, data);
    }

    pub(crate) fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub(crate) fn write_boolean_with_tag(&mut self, tag: u8, value: bool) {
        self.write_tag(tag);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub(crate) fn write_boolean(&mut self, value: bool) {
        self.write_boolean_with_tag(TAG_BOOLEAN, value);
    }

    /// Open a constructed element; the returned position is handed to `end_constructed`.
    pub(crate) fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let length_pos = self.buffer.len();
        self.buffer.push(0); // Placeholder for length
        length_pos
    }

    /// Back-patch the length of the element opened at `length_pos`. Supports short and long form.
    pub(crate) fn end_constructed(&mut self, length_pos: usize) {
        let content_len = self.buffer.len() - (length_pos + 1);
        let mut encoded = Vec::with_capacity(5);
        encode_length(content_len, &mut encoded);
        self.buffer.splice(length_pos..length_pos + 1, encoded);
    }

    pub(crate) fn start_sequence(&mut self) -> usize {
        self.start_constructed(TAG_SEQUENCE)
    }

    pub(crate) fn end_sequence(&mut self, start_pos: usize) {
        self.end_constructed(start_pos);
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn encode_length(length: usize, out: &mut Vec<u8>) {
    if length < 0x80 {
        // Short form
        out.push(length as u8);
    } else {
        // Long form, minimal number of octets
        let bytes = (length as u32).to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        out.push(0x80 | (4 - start) as u8);
        out.extend_from_slice(&bytes[start..]);
    }
}

/// Minimal two's-complement contents for an INTEGER.
fn integer_contents(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// BindRequest simple authentication [0]
const LDAP_CONTEXT_SIMPLE_AUTH: u8 = 0x80;
/// BindRequest SASL authentication [3]
const LDAP_CONTEXT_SASL_AUTH: u8 = 0xA3;
/// BindResponse serverSaslCreds [7]
const LDAP_CONTEXT_SERVER_SASL_CREDS: u8 = 0x87;
/// LDAPResult referral [3]
const LDAP_CONTEXT_REFERRAL: u8 = 0xA3;
const LDAP_CONTEXT_EXT_REQUEST_NAME: u8 = 0x80;
const LDAP_CONTEXT_EXT_REQUEST_VALUE: u8 = 0x81;
const LDAP_CONTEXT_EXT_RESPONSE_NAME: u8 = 0x8A;
const LDAP_CONTEXT_EXT_RESPONSE_VALUE: u8 = 0x8B;

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30).
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Result of trying to parse one LDAP message from the front of a buffer.
#[derive(Debug, PartialEq)]
pub enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    /// A complete frame was decoded; `consumed` bytes belong to it.
    Message { message: LdapMessage, consumed: usize },
}

/// Frame and decode the first message in `buffer`.
///
/// Returns `Incomplete` when the declared length runs past the end of the buffer.
/// A frame whose declared length exceeds `max_frame_bytes`, or whose contents do
/// not decode, is a protocol error.
pub fn try_parse_message(buffer: &[u8], max_frame_bytes: usize) -> Result<TryParseResult> {
    let Some(&first_byte) = buffer.first() else {
        return Ok(TryParseResult::Incomplete);
    };
    if first_byte != LDAP_MESSAGE_SEQUENCE_TAG {
        return Err(LdapError::protocol(format!(
            "Frame does not start with SEQUENCE: 0x{:02X}",
            first_byte
        )));
    }
    let Some(&length_byte) = buffer.get(1) else {
        return Ok(TryParseResult::Incomplete);
    };

    let (header_len, content_len) = if length_byte & 0x80 == 0 {
        (2, length_byte as usize)
    } else {
        let length_bytes = (length_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            return Err(LdapError::protocol("Invalid frame length encoding"));
        }
        if buffer.len() < 2 + length_bytes {
            return Ok(TryParseResult::Incomplete);
        }
        let mut length = 0usize;
        for &b in &buffer[2..2 + length_bytes] {
            length = (length << 8) | b as usize;
        }
        (2 + length_bytes, length)
    };

    if content_len > max_frame_bytes {
        return Err(LdapError::protocol(format!(
            "Frame of {} bytes exceeds limit of {}",
            content_len, max_frame_bytes
        )));
    }
    let total_length = header_len + content_len;
    if buffer.len() < total_length {
        return Ok(TryParseResult::Incomplete);
    }

    let message = parse_ldap_message(&buffer[..total_length])?;
    Ok(TryParseResult::Message {
        message,
        consumed: total_length,
    })
}

/// Decode exactly one complete LDAPMessage.
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence()?;
    outer.finish("LDAPMessage")?;

    let message_id = reader.read_integer()?;
    if message_id < 0 {
        return Err(LdapError::protocol(format!(
            "Negative message ID: {}",
            message_id
        )));
    }

    let (tag, body) = reader.read_tlv()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(body)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(body)?),
        LDAP_TAG_UNBIND_REQUEST => {
            if !body.is_empty() {
                return Err(LdapError::protocol("UnbindRequest must be empty"));
            }
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(body)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => {
            ProtocolOp::SearchResultEntry(parse_search_result_entry(body)?)
        }
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            ProtocolOp::SearchResultReference(parse_uri_list(body, "SearchResultReference")?)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => {
            let mut r = BerReader::new(body);
            let result = parse_ldap_result(&mut r)?;
            r.finish("SearchResultDone")?;
            ProtocolOp::SearchResultDone(result)
        }
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(decode_integer(body)?),
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(body)?),
        LDAP_TAG_EXTENDED_RESPONSE => {
            ProtocolOp::ExtendedResponse(parse_extended_response(body)?)
        }
        _ => {
            return Err(LdapError::protocol(format!(
                "Unsupported LDAP operation tag: 0x{:02X}",
                tag
            )))
        }
    };

    let controls = if reader.is_empty() {
        None
    } else {
        let body = reader.expect(LDAP_CONTEXT_CONTROLS, "controls [0]")?;
        Some(parse_controls(body)?)
    };
    reader.finish("LDAPMessage")?;

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(body: &[u8]) -> Result<Vec<Control>> {
    let mut reader = BerReader::new(body);
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut ctrl = reader.read_sequence()?;
        let ctype = ctrl.read_string()?;
        let critical = if ctrl.peek_tag() == Some(TAG_BOOLEAN) {
            ctrl.read_boolean()?
        } else {
            false
        };
        let value = if ctrl.is_empty() {
            None
        } else {
            Some(ctrl.read_octet_string()?)
        };
        ctrl.finish("Control")?;
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_bind_request(body: &[u8]) -> Result<BindRequest> {
    let mut reader = BerReader::new(body);
    let version = reader.read_integer()?;
    let name = reader.read_string()?;
    let (auth_tag, credentials) = reader.read_tlv()?;
    let password = match auth_tag {
        LDAP_CONTEXT_SIMPLE_AUTH => credentials.to_vec(),
        LDAP_CONTEXT_SASL_AUTH => {
            return Err(LdapError::protocol("SASL authentication is not supported"))
        }
        other => {
            return Err(LdapError::protocol(format!(
                "Unknown bind authentication tag: 0x{:02X}",
                other
            )))
        }
    };
    reader.finish("BindRequest")?;
    Ok(BindRequest {
        version,
        name,
        password,
    })
}

fn parse_bind_response(body: &[u8]) -> Result<LdapResult> {
    let mut reader = BerReader::new(body);
    let result = parse_ldap_result(&mut reader)?;
    if reader.peek_tag() == Some(LDAP_CONTEXT_SERVER_SASL_CREDS) {
        // serverSaslCreds only accompany SASL binds; simple binds ignore them.
        reader.read_tlv()?;
    }
    reader.finish("BindResponse")?;
    Ok(result)
}

fn parse_ldap_result(reader: &mut BerReader) -> Result<LdapResult> {
    let result_code = ResultCode::from(reader.read_enumerated()?);
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    let referral = if reader.peek_tag() == Some(LDAP_CONTEXT_REFERRAL) {
        let body = reader.expect(LDAP_CONTEXT_REFERRAL, "referral [3]")?;
        parse_uri_list(body, "Referral")?
    } else {
        Vec::new()
    };
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referral,
    })
}

fn parse_uri_list(body: &[u8], what: &str) -> Result<Vec<String>> {
    let mut reader = BerReader::new(body);
    let mut uris = Vec::new();
    while !reader.is_empty() {
        uris.push(reader.read_string()?);
    }
    if uris.is_empty() {
        return Err(LdapError::protocol(format!("{} without URIs", what)));
    }
    Ok(uris)
}

fn parse_search_request(body: &[u8]) -> Result<SearchRequest> {
    let mut reader = BerReader::new(body);
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_small_enumerated()?)?;
    let deref_aliases = DerefAliases::try_from(reader.read_small_enumerated()?)?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = Filter::decode(&mut reader)?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string()?);
    }
    reader.finish("SearchRequest")?;

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_search_result_entry(body: &[u8]) -> Result<SearchResultEntry> {
    let mut reader = BerReader::new(body);
    let object_name = reader.read_string()?;
    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(parse_partial_attribute(&mut attrs)?);
    }
    reader.finish("SearchResultEntry")?;
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
fn parse_partial_attribute(reader: &mut BerReader) -> Result<PartialAttribute> {
    let mut seq = reader.read_sequence()?;
    let attr_type = seq.read_string()?;
    let (vals_tag, vals_body) = seq.read_tlv()?;
    // Some servers frame the value set as a SEQUENCE.
    if vals_tag != TAG_SET && vals_tag != TAG_SEQUENCE {
        return Err(LdapError::protocol(format!(
            "Expected SET of attribute values, got: 0x{:02X}",
            vals_tag
        )));
    }
    let mut vals = BerReader::new(vals_body);
    let mut attr_values = Vec::new();
    while !vals.is_empty() {
        attr_values.push(vals.read_octet_string()?);
    }
    seq.finish("PartialAttribute")?;
    Ok(PartialAttribute {
        attr_type,
        attr_values,
    })
}

fn parse_extended_request(body: &[u8]) -> Result<ExtendedRequest> {
    let mut reader = BerReader::new(body);
    let request_name = decode_utf8(reader.expect(LDAP_CONTEXT_EXT_REQUEST_NAME, "requestName [0]")?)?;
    let request_value = if reader.is_empty() {
        None
    } else {
        Some(
            reader
                .expect(LDAP_CONTEXT_EXT_REQUEST_VALUE, "requestValue [1]")?
                .to_vec(),
        )
    };
    reader.finish("ExtendedRequest")?;
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(body: &[u8]) -> Result<ExtendedResponse> {
    let mut reader = BerReader::new(body);
    let result = parse_ldap_result(&mut reader)?;
    let response_name = if reader.peek_tag() == Some(LDAP_CONTEXT_EXT_RESPONSE_NAME) {
        Some(decode_utf8(reader.expect(LDAP_CONTEXT_EXT_RESPONSE_NAME, "responseName [10]")?)?)
    } else {
        None
    };
    let response_value = if reader.peek_tag() == Some(LDAP_CONTEXT_EXT_RESPONSE_VALUE) {
        Some(
            reader
                .expect(LDAP_CONTEXT_EXT_RESPONSE_VALUE, "responseValue [11]")?
                .to_vec(),
        )
    } else {
        None
    };
    reader.finish("ExtendedResponse")?;
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    if message.message_id < 0 {
        return Err(LdapError::Unsupported("negative message ID"));
    }
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::BindResponse(result) => {
            encode_result_op(&mut writer, LDAP_TAG_BIND_RESPONSE, result)
        }
        ProtocolOp::UnbindRequest => {
            writer.write_tag(LDAP_TAG_UNBIND_REQUEST);
            writer.write_length(0);
        }
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req),
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultReference(uris) => {
            if uris.is_empty() {
                return Err(LdapError::Unsupported("SearchResultReference without URIs"));
            }
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                writer.write_string(uri);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultDone(result) => {
            encode_result_op(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, result)
        }
        ProtocolOp::AbandonRequest(id) => {
            if *id < 0 {
                return Err(LdapError::Unsupported("abandon of a negative message ID"));
            }
            writer.write_integer_with_tag(LDAP_TAG_ABANDON_REQUEST, *id);
        }
        ProtocolOp::ExtendedRequest(req) => encode_extended_request(&mut writer, req),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(&mut writer, resp),
    }

    if let Some(controls) = &message.controls {
        encode_controls(&mut writer, controls);
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) {
    let pos = writer.start_constructed(LDAP_CONTEXT_CONTROLS);
    for control in controls {
        let ctrl = writer.start_sequence();
        writer.write_string(&control.ctype);
        // criticality DEFAULT FALSE is omitted
        if control.critical {
            writer.write_boolean(true);
        }
        if let Some(ref value) = control.value {
            writer.write_octet_string(value);
        }
        writer.end_sequence(ctrl);
    }
    writer.end_constructed(pos);
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    let pos = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    writer.write_octet_string_with_tag(LDAP_CONTEXT_SIMPLE_AUTH, &req.password);
    writer.end_constructed(pos);
}

fn write_ldap_result(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.result_code.code());
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    if !result.referral.is_empty() {
        let pos = writer.start_constructed(LDAP_CONTEXT_REFERRAL);
        for uri in &result.referral {
            writer.write_string(uri);
        }
        writer.end_constructed(pos);
    }
}

fn encode_result_op(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let pos = writer.start_constructed(tag);
    write_ldap_result(writer, result);
    writer.end_constructed(pos);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_REQUEST);
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i32);
    writer.write_enumerated(req.deref_aliases as i32);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    req.filter.encode(writer);
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs_start = writer.start_sequence();
    for attr in &entry.attributes {
        let seq_start = writer.start_sequence();
        writer.write_string(&attr.attr_type);
        let vals_start = writer.start_constructed(TAG_SET);
        for value in &attr.attr_values {
            writer.write_octet_string(value);
        }
        writer.end_constructed(vals_start);
        writer.end_sequence(seq_start);
    }
    writer.end_sequence(attrs_start);
    writer.end_constructed(pos);
}

fn encode_extended_request(writer: &mut BerWriter, req: &ExtendedRequest) {
    let pos = writer.start_constructed(LDAP_TAG_EXTENDED_REQUEST);
    writer.write_octet_string_with_tag(LDAP_CONTEXT_EXT_REQUEST_NAME, req.request_name.as_bytes());
    if let Some(ref value) = req.request_value {
        writer.write_octet_string_with_tag(LDAP_CONTEXT_EXT_REQUEST_VALUE, value);
    }
    writer.end_constructed(pos);
}

fn encode_extended_response(writer: &mut BerWriter, resp: &ExtendedResponse) {
    let pos = writer.start_constructed(LDAP_TAG_EXTENDED_RESPONSE);
    write_ldap_result(writer, &resp.result);
    if let Some(ref name) = resp.response_name {
        writer.write_octet_string_with_tag(LDAP_CONTEXT_EXT_RESPONSE_NAME, name.as_bytes());
    }
    if let Some(ref value) = resp.response_value {
        writer.write_octet_string_with_tag(LDAP_CONTEXT_EXT_RESPONSE_VALUE, value);
    }
    writer.end_constructed(pos);
}
