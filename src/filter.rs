//! RFC 4515 search filters: string parsing, canonical display, and the BER CHOICE encoding.

use crate::error::{LdapError, Result};
use crate::ldap_protocol::{decode_utf8, BerReader, BerWriter};
use std::fmt;
use std::str::FromStr;

// Filter CHOICE tags
const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

// SubstringFilter components
const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

// MatchingRuleAssertion components
const MATCHING_RULE: u8 = 0x81;
const MATCHING_TYPE: u8 = 0x82;
const MATCHING_VALUE: u8 = 0x83;
const MATCHING_DN_ATTRIBUTES: u8 = 0x84;

const MAX_FILTER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: Vec<u8>,
    },
    /// At least one of `initial`, `any`, `last` is non-empty.
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    Present(String),
    Approx {
        attr: String,
        value: Vec<u8>,
    },
    Extensible {
        rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// Parse the string form, e.g. `(&(objectClass=person)(cn=Rie*))`.
    /// A bare `attr=value` without enclosing parentheses is accepted.
    pub fn parse(input: &str) -> Result<Filter> {
        let invalid = |reason: String| LdapError::InvalidFilter {
            filter: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty filter".to_string()));
        }
        let wrapped;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            wrapped.as_str()
        };

        let mut parser = Parser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter(0).map_err(invalid)?;
        if parser.pos != parser.input.len() {
            return Err(invalid(format!(
                "unexpected characters at offset {}",
                parser.pos
            )));
        }
        Ok(filter)
    }

    pub(crate) fn encode(&self, writer: &mut BerWriter) {
        match self {
            Filter::And(children) => encode_set(writer, FILTER_AND, children),
            Filter::Or(children) => encode_set(writer, FILTER_OR, children),
            Filter::Not(inner) => {
                let pos = writer.start_constructed(FILTER_NOT);
                inner.encode(writer);
                writer.end_constructed(pos);
            }
            Filter::Equality { attr, value } => encode_ava(writer, FILTER_EQUALITY, attr, value),
            Filter::GreaterOrEqual { attr, value } => {
                encode_ava(writer, FILTER_GREATER_OR_EQUAL, attr, value)
            }
            Filter::LessOrEqual { attr, value } => {
                encode_ava(writer, FILTER_LESS_OR_EQUAL, attr, value)
            }
            Filter::Approx { attr, value } => encode_ava(writer, FILTER_APPROX, attr, value),
            Filter::Substrings {
                attr,
                initial,
                any,
                last,
            } => {
                let pos = writer.start_constructed(FILTER_SUBSTRINGS);
                writer.write_string(attr);
                let seq = writer.start_sequence();
                if let Some(initial) = initial {
                    writer.write_octet_string_with_tag(SUBSTRING_INITIAL, initial);
                }
                for part in any {
                    writer.write_octet_string_with_tag(SUBSTRING_ANY, part);
                }
                if let Some(last) = last {
                    writer.write_octet_string_with_tag(SUBSTRING_FINAL, last);
                }
                writer.end_sequence(seq);
                writer.end_constructed(pos);
            }
            Filter::Present(attr) => {
                writer.write_octet_string_with_tag(FILTER_PRESENT, attr.as_bytes());
            }
            Filter::Extensible {
                rule,
                attr,
                value,
                dn_attributes,
            } => {
                let pos = writer.start_constructed(FILTER_EXTENSIBLE);
                if let Some(rule) = rule {
                    writer.write_octet_string_with_tag(MATCHING_RULE, rule.as_bytes());
                }
                if let Some(attr) = attr {
                    writer.write_octet_string_with_tag(MATCHING_TYPE, attr.as_bytes());
                }
                writer.write_octet_string_with_tag(MATCHING_VALUE, value);
                // dnAttributes DEFAULT FALSE
                if *dn_attributes {
                    writer.write_boolean_with_tag(MATCHING_DN_ATTRIBUTES, true);
                }
                writer.end_constructed(pos);
            }
        }
    }

    pub(crate) fn decode(reader: &mut BerReader) -> Result<Filter> {
        decode_filter(reader, 0)
    }
}

impl FromStr for Filter {
    type Err = LdapError;
    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

fn encode_set(writer: &mut BerWriter, tag: u8, children: &[Filter]) {
    let pos = writer.start_constructed(tag);
    for child in children {
        child.encode(writer);
    }
    writer.end_constructed(pos);
}

fn encode_ava(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let pos = writer.start_constructed(tag);
    writer.write_string(attr);
    writer.write_octet_string(value);
    writer.end_constructed(pos);
}

fn decode_filter(reader: &mut BerReader, depth: usize) -> Result<Filter> {
    if depth > MAX_FILTER_DEPTH {
        return Err(LdapError::protocol("Filter nested too deeply"));
    }
    let (tag, body) = reader.read_tlv()?;
    let mut inner = BerReader::new(body);
    let filter = match tag {
        FILTER_AND | FILTER_OR => {
            let mut children = Vec::new();
            while !inner.is_empty() {
                children.push(decode_filter(&mut inner, depth + 1)?);
            }
            if tag == FILTER_AND {
                Filter::And(children)
            } else {
                Filter::Or(children)
            }
        }
        FILTER_NOT => Filter::Not(Box::new(decode_filter(&mut inner, depth + 1)?)),
        FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX => {
            let attr = inner.read_string()?;
            let value = inner.read_octet_string()?;
            match tag {
                FILTER_EQUALITY => Filter::Equality { attr, value },
                FILTER_GREATER_OR_EQUAL => Filter::GreaterOrEqual { attr, value },
                FILTER_LESS_OR_EQUAL => Filter::LessOrEqual { attr, value },
                _ => Filter::Approx { attr, value },
            }
        }
        FILTER_SUBSTRINGS => {
            let attr = inner.read_string()?;
            let mut parts = inner.read_sequence()?;
            let (mut initial, mut any, mut last) = (None, Vec::new(), None);
            while !parts.is_empty() {
                let (part_tag, value) = parts.read_tlv()?;
                match part_tag {
                    SUBSTRING_INITIAL if initial.is_none() && any.is_empty() && last.is_none() => {
                        initial = Some(value.to_vec())
                    }
                    SUBSTRING_ANY if last.is_none() => any.push(value.to_vec()),
                    SUBSTRING_FINAL if last.is_none() => last = Some(value.to_vec()),
                    other => {
                        return Err(LdapError::protocol(format!(
                            "Unexpected substring component 0x{:02X}",
                            other
                        )))
                    }
                }
            }
            if initial.is_none() && any.is_empty() && last.is_none() {
                return Err(LdapError::protocol("Substring filter without components"));
            }
            Filter::Substrings {
                attr,
                initial,
                any,
                last,
            }
        }
        FILTER_PRESENT => {
            return Ok(Filter::Present(decode_utf8(body)?));
        }
        FILTER_EXTENSIBLE => {
            let mut rule = None;
            let mut attr = None;
            let mut value = None;
            let mut dn_attributes = false;
            while !inner.is_empty() {
                let (part_tag, contents) = inner.read_tlv()?;
                match part_tag {
                    MATCHING_RULE => rule = Some(decode_utf8(contents)?),
                    MATCHING_TYPE => attr = Some(decode_utf8(contents)?),
                    MATCHING_VALUE => value = Some(contents.to_vec()),
                    MATCHING_DN_ATTRIBUTES => {
                        dn_attributes = contents.first().is_some_and(|&b| b != 0)
                    }
                    other => {
                        return Err(LdapError::protocol(format!(
                            "Unexpected extensible match component 0x{:02X}",
                            other
                        )))
                    }
                }
            }
            let value = value
                .ok_or_else(|| LdapError::protocol("Extensible match without matchValue"))?;
            Filter::Extensible {
                rule,
                attr,
                value,
                dn_attributes,
            }
        }
        other => {
            return Err(LdapError::protocol(format!(
                "Unknown filter tag: 0x{:02X}",
                other
            )))
        }
    };
    inner.finish("Filter")?;
    Ok(filter)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> std::result::Result<(), String> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += 1;
                Ok(())
            }
            Some(found) => Err(format!(
                "expected '{}' at offset {}, found '{}'",
                c as char, self.pos, found as char
            )),
            None => Err(format!("expected '{}' at end of input", c as char)),
        }
    }

    fn parse_filter(&mut self, depth: usize) -> std::result::Result<Filter, String> {
        if depth > MAX_FILTER_DEPTH {
            return Err("filter nested too deeply".to_string());
        }
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list(depth)?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list(depth)?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter(depth + 1)?))
            }
            Some(_) => self.parse_item()?,
            None => return Err("unterminated filter".to_string()),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self, depth: usize) -> std::result::Result<Vec<Filter>, String> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter(depth + 1)?);
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> std::result::Result<Filter, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                b')' => break,
                b'(' => return Err(format!("unescaped '(' at offset {}", self.pos)),
                _ => self.pos += 1,
            }
        }
        let item = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| "filter is not valid UTF-8".to_string())?;

        let eq = item
            .find('=')
            .ok_or_else(|| format!("missing '=' in \"{}\"", item))?;
        let (left, raw) = (&item[..eq], &item[eq + 1..]);
        if let Some(left) = left.strip_suffix(':') {
            return parse_extensible(left, raw);
        }
        let (attr, op) = match left.as_bytes().last() {
            Some(b'~') => (&left[..left.len() - 1], Some(b'~')),
            Some(b'>') => (&left[..left.len() - 1], Some(b'>')),
            Some(b'<') => (&left[..left.len() - 1], Some(b'<')),
            _ => (left, None),
        };
        validate_attribute(attr)?;
        let attr = attr.to_string();

        match op {
            Some(op) => {
                if raw.contains('*') {
                    return Err(format!("'*' not allowed in \"{}\"", item));
                }
                let value = unescape(raw)?;
                Ok(match op {
                    b'~' => Filter::Approx { attr, value },
                    b'>' => Filter::GreaterOrEqual { attr, value },
                    _ => Filter::LessOrEqual { attr, value },
                })
            }
            None if raw == "*" => Ok(Filter::Present(attr)),
            None if raw.contains('*') => {
                let pieces: Vec<&str> = raw.split('*').collect();
                let initial = match pieces[0] {
                    "" => None,
                    s => Some(unescape(s)?),
                };
                let last = match pieces[pieces.len() - 1] {
                    "" => None,
                    s => Some(unescape(s)?),
                };
                let any = pieces[1..pieces.len() - 1]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .map(|s| unescape(s))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if initial.is_none() && any.is_empty() && last.is_none() {
                    return Err(format!("empty substring assertion in \"{}\"", item));
                }
                Ok(Filter::Substrings {
                    attr,
                    initial,
                    any,
                    last,
                })
            }
            None => Ok(Filter::Equality {
                attr,
                value: unescape(raw)?,
            }),
        }
    }
}

/// `[attr][:dn][:rule]:=value`
fn parse_extensible(left: &str, raw: &str) -> std::result::Result<Filter, String> {
    let mut parts = left.split(':');
    let attr = match parts.next() {
        Some("") | None => None,
        Some(a) => {
            validate_attribute(a)?;
            Some(a.to_string())
        }
    };
    let mut dn_attributes = false;
    let mut rule = None;
    for part in parts {
        if part.eq_ignore_ascii_case("dn") && !dn_attributes && rule.is_none() {
            dn_attributes = true;
        } else if rule.is_none() && !part.is_empty() {
            validate_attribute(part)?;
            rule = Some(part.to_string());
        } else {
            return Err(format!("malformed extensible match \"{}:=\"", left));
        }
    }
    if attr.is_none() && rule.is_none() {
        return Err("extensible match needs an attribute or a matching rule".to_string());
    }
    if raw.contains('*') {
        return Err("'*' not allowed in extensible match value".to_string());
    }
    Ok(Filter::Extensible {
        rule,
        attr,
        value: unescape(raw)?,
        dn_attributes,
    })
}

/// Attribute descriptions: names, OIDs, and `;`-separated options.
fn validate_attribute(attr: &str) -> std::result::Result<(), String> {
    if attr.is_empty() {
        return Err("missing attribute name".to_string());
    }
    if let Some(c) = attr
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ';' | '_')))
    {
        return Err(format!("invalid character '{}' in attribute \"{}\"", c, attr));
    }
    Ok(())
}

/// Resolve `\XX` hex escapes.
fn unescape(raw: &str) -> std::result::Result<Vec<u8>, String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| format!("invalid escape in \"{}\"", raw))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    match std::str::from_utf8(value) {
        Ok(s) => {
            for c in s.chars() {
                match c {
                    '*' | '(' | ')' | '\\' | '\0' => write!(f, "\\{:02x}", c as u32)?,
                    c => write!(f, "{}", c)?,
                }
            }
        }
        Err(_) => {
            for &b in value {
                if b.is_ascii_graphic() && !matches!(b, b'*' | b'(' | b')' | b'\\') || b == b' ' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{:02x}", b)?;
                }
            }
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({}", op)?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attr, value } => {
                write!(f, "({}=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::GreaterOrEqual { attr, value } => {
                write!(f, "({}>=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::LessOrEqual { attr, value } => {
                write!(f, "({}<=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::Approx { attr, value } => {
                write!(f, "({}~=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substrings {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    write_escaped(f, initial)?;
                }
                write!(f, "*")?;
                for part in any {
                    write_escaped(f, part)?;
                    write!(f, "*")?;
                }
                if let Some(last) = last {
                    write_escaped(f, last)?;
                }
                write!(f, ")")
            }
            Filter::Extensible {
                rule,
                attr,
                value,
                dn_attributes,
            } => {
                write!(f, "(")?;
                if let Some(attr) = attr {
                    write!(f, "{}", attr)?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":=")?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
        }
    }
}
