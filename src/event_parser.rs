//! Event-definition text format (spec.md §6): one line per counter,
//! comma-separated `key=value` fields. Parsing drives a three-phase
//! callback (`start`, `field`, `complete`) per line so a consumer can
//! assemble whatever counter-descriptor shape it needs without the parser
//! committing to one struct.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1, hex_digit1, multispace0, oct_digit1};
use nom::combinator::{map, map_res, recognize};
use nom::multi::separated_list1;
use nom::sequence::{preceded, separated_pair, tuple};
use nom::IResult;

use crate::error::{PcmError, Result};

/// The known field keys (spec.md §6). `Other` keeps the parser permissive
/// for forward-compatible files: an unrecognized key is still surfaced to
/// the visitor's `field` callback, just tagged `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKey {
    HName,
    VName,
    Multiplier,
    Ctr,
    Unit,
    Opcode,
    EvSel,
    Umask,
    Reset,
    EdgeDet,
    Ignored,
    OverflowEnable,
    En,
    Invert,
    Thresh,
    ChMask,
    FcMask,
    Other(String),
}

impl FieldKey {
    fn parse(s: &str) -> FieldKey {
        match s {
            "hname" => FieldKey::HName,
            "vname" => FieldKey::VName,
            "multiplier" => FieldKey::Multiplier,
            "ctr" => FieldKey::Ctr,
            "unit" => FieldKey::Unit,
            "opcode" => FieldKey::Opcode,
            "ev_sel" => FieldKey::EvSel,
            "umask" => FieldKey::Umask,
            "reset" => FieldKey::Reset,
            "edge_det" => FieldKey::EdgeDet,
            "ignored" => FieldKey::Ignored,
            "overflow_enable" => FieldKey::OverflowEnable,
            "en" => FieldKey::En,
            "invert" => FieldKey::Invert,
            "thresh" => FieldKey::Thresh,
            "ch_mask" => FieldKey::ChMask,
            "fc_mask" => FieldKey::FcMask,
            other => FieldKey::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldKey::HName => "hname",
            FieldKey::VName => "vname",
            FieldKey::Multiplier => "multiplier",
            FieldKey::Ctr => "ctr",
            FieldKey::Unit => "unit",
            FieldKey::Opcode => "opcode",
            FieldKey::EvSel => "ev_sel",
            FieldKey::Umask => "umask",
            FieldKey::Reset => "reset",
            FieldKey::EdgeDet => "edge_det",
            FieldKey::Ignored => "ignored",
            FieldKey::OverflowEnable => "overflow_enable",
            FieldKey::En => "en",
            FieldKey::Invert => "invert",
            FieldKey::Thresh => "thresh",
            FieldKey::ChMask => "ch_mask",
            FieldKey::FcMask => "fc_mask",
            FieldKey::Other(s) => s,
        }
    }

    fn is_text_field(&self) -> bool {
        matches!(self, FieldKey::HName | FieldKey::VName | FieldKey::Unit | FieldKey::Other(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Number(u64),
    Text(String),
}

impl FieldValue {
    fn serialize(&self) -> String {
        match self {
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

/// Three-phase sink a consumer implements to assemble its own
/// counter-descriptor type out of a parsed line.
pub trait EventRecordVisitor {
    type Output;
    fn start(&mut self);
    fn field(&mut self, key: &FieldKey, value: &FieldValue);
    fn complete(&mut self) -> Self::Output;
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

/// C-style numeric literal: `0x...` hex, `0...` octal (when more than one
/// digit and no later non-octal digit), or plain decimal.
fn c_style_number(input: &str) -> IResult<&str, u64> {
    alt((
        map_res(preceded(alt((tag("0x"), tag("0X"))), hex_digit1), |s| u64::from_str_radix(s, 16)),
        map_res(
            recognize(tuple((char('0'), oct_digit1))),
            |s: &str| u64::from_str_radix(&s[1..], 8),
        ),
        map_res(digit1, |s: &str| s.parse::<u64>()),
    ))(input)
}

fn bareword_text(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ',' && c != '\n' && c != '\r')(input)
}

fn field_value(key: &FieldKey, input: &str) -> IResult<&str, FieldValue> {
    if key.is_text_field() {
        map(bareword_text, |s: &str| FieldValue::Text(s.trim().to_string()))(input)
    } else {
        map(c_style_number, FieldValue::Number)(input)
    }
}

fn key_value(input: &str) -> IResult<&str, (FieldKey, FieldValue)> {
    let (input, _) = multispace0(input)?;
    let (input, key_str) = identifier(input)?;
    let key = FieldKey::parse(key_str);
    let (input, (_, value)) = separated_pair(char('='), multispace0, |i| field_value(&key, i))(input)?;
    Ok((input, (key, value)))
}

fn parse_line(input: &str) -> IResult<&str, Vec<(FieldKey, FieldValue)>> {
    separated_list1(char(','), key_value)(input)
}

/// Parses one non-empty, non-comment line into its ordered `(key, value)`
/// fields.
pub fn parse_record(line: &str) -> Result<Vec<(FieldKey, FieldValue)>> {
    let (rest, fields) = parse_line(line.trim()).map_err(|e| PcmError::unknown("event_parser", format!("{e:?}")))?;
    if !rest.trim().is_empty() {
        return Err(PcmError::unknown("event_parser", format!("trailing input: {rest:?}")));
    }
    Ok(fields)
}

/// Writes a record back out in the same `key=value,key=value` shape
/// `parse_record` accepts, preserving field order.
pub fn serialize_record(fields: &[(FieldKey, FieldValue)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k.as_str(), v.serialize()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Drives the three-phase visitor over every non-empty, non-`#`-comment
/// line of `text`, collecting one `Output` per line.
pub fn parse_event_file<V: EventRecordVisitor>(text: &str, mut make_visitor: impl FnMut() -> V) -> Result<Vec<V::Output>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields = parse_record(trimmed)?;
        let mut visitor = make_visitor();
        visitor.start();
        for (key, value) in &fields {
            visitor.field(key, value);
        }
        out.push(visitor.complete());
    }
    Ok(out)
}

/// Reference visitor assembling a plain descriptor: every field keyed by
/// its normalized name, used by the round-trip test and available to
/// callers that don't need a bespoke shape.
#[derive(Debug, Clone, Default)]
pub struct EventDescriptor {
    pub fields: Vec<(FieldKey, FieldValue)>,
}

impl EventDescriptor {
    pub fn get(&self, key: &FieldKey) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[derive(Default)]
pub struct DescriptorBuilder {
    fields: Vec<(FieldKey, FieldValue)>,
}

impl EventRecordVisitor for DescriptorBuilder {
    type Output = EventDescriptor;

    fn start(&mut self) {
        self.fields.clear();
    }

    fn field(&mut self, key: &FieldKey, value: &FieldValue) {
        self.fields.push((key.clone(), value.clone()));
    }

    fn complete(&mut self) -> EventDescriptor {
        EventDescriptor { fields: std::mem::take(&mut self.fields) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_hex_decimal_and_text_fields() {
        let line = "hname=L3_MISS,ev_sel=0x2E,umask=0x41,ctr=1,thresh=0";
        let fields = parse_record(line).unwrap();
        assert_eq!(fields[0], (FieldKey::HName, FieldValue::Text("L3_MISS".to_string())));
        assert_eq!(fields[1], (FieldKey::EvSel, FieldValue::Number(0x2E)));
        assert_eq!(fields[2], (FieldKey::Umask, FieldValue::Number(0x41)));
        assert_eq!(fields[3], (FieldKey::Ctr, FieldValue::Number(1)));
        assert_eq!(fields[4], (FieldKey::Thresh, FieldValue::Number(0)));
    }

    #[test]
    fn parse_serialize_parse_is_idempotent() {
        let line = "hname=UNHALTED_CORE_CYCLES,vname=cycles,multiplier=1,ctr=0,ev_sel=0x3C,umask=0x00,en=1";
        let parsed = parse_record(line).unwrap();
        let serialized = serialize_record(&parsed);
        let reparsed = parse_record(&serialized).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn visitor_three_phases_fire_once_per_line() {
        let text = "hname=A,ev_sel=0x1\nhname=B,ev_sel=0x2\n# comment\n\n";
        let descriptors = parse_event_file(text, DescriptorBuilder::default).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].get(&FieldKey::HName), Some(&FieldValue::Text("A".to_string())));
        assert_eq!(descriptors[1].get(&FieldKey::EvSel), Some(&FieldValue::Number(2)));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_record("hname=A,ev_sel=0x1 garbage").is_err());
    }
}
