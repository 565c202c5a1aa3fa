//! Trigger expressions: parsing and evaluation.
//!
//! Syntax: one or more `unit(expression)` fields separated by whitespace or
//! commas, where `unit` is `second`, `minute`, `hour` or `day` (`sec` and
//! `min` are accepted too) and `expression` is `*` or `*%N`. Fields compose
//! by AND.
//!
//! ```text
//! second(*%10)              every 10 seconds
//! minute(*%5)               second 0 of every 5th minute
//! hour(*%6), minute(*%30)   00:00, 00:30, 06:00, 06:30, ...
//! ```
//!
//! `*%N` is a zero-based modulus on the unit's value (`day` counts from the
//! first of the month as 0). Units finer than the finest field must be zero,
//! so `minute(*)` fires once per minute, not sixty times. Coarser units are
//! unconstrained.
//!
//! Evaluation works on whole UTC seconds and is pure.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Second,
    Minute,
    Hour,
    Day,
}

impl Unit {
    /// Coarsest first.
    const ALL: [Unit; 4] = [Unit::Day, Unit::Hour, Unit::Minute, Unit::Second];

    fn seconds(self) -> i64 {
        match self {
            Unit::Second => 1,
            Unit::Minute => 60,
            Unit::Hour => 3_600,
            Unit::Day => 86_400,
        }
    }

    fn value(self, at: &DateTime<Utc>) -> u32 {
        match self {
            Unit::Second => at.second(),
            Unit::Minute => at.minute(),
            Unit::Hour => at.hour(),
            Unit::Day => at.day0(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Unit::Second => "second",
            Unit::Minute => "minute",
            Unit::Hour => "hour",
            Unit::Day => "day",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "second" | "sec" => Some(Unit::Second),
            "minute" | "min" => Some(Unit::Minute),
            "hour" => Some(Unit::Hour),
            "day" => Some(Unit::Day),
            _ => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One `unit(*%every)` selector. `every == 1` is `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub unit: Unit,
    pub every: u32,
}

impl Field {
    fn matches(&self, at: &DateTime<Utc>) -> bool {
        self.unit.value(at) % self.every == 0
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.every == 1 {
            write!(f, "{}(*)", self.unit)
        } else {
            write!(f, "{}(*%{})", self.unit, self.every)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerParseErrorKind {
    #[error("empty trigger expression")]
    Empty,
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),
    #[error("expected '{0}'")]
    Expected(char),
    #[error("expected a number after '%'")]
    MissingModulus,
    #[error("modulus must be greater than zero")]
    ZeroModulus,
    #[error("modulus is too large")]
    ModulusOverflow,
    #[error("unit '{0}' appears more than once")]
    DuplicateUnit(Unit),
}

/// Parse failure with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid trigger at position {position}: {kind}")]
pub struct TriggerParseError {
    pub position: usize,
    pub kind: TriggerParseErrorKind,
}

/// Parsed trigger expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Trigger {
    /// Sorted coarsest first, one per unit.
    fields: Vec<Field>,
}

impl Trigger {
    pub fn parse(input: &str) -> Result<Self, TriggerParseError> {
        Parser::new(input).parse()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    fn finest(&self) -> Unit {
        // parse guarantees at least one field
        self.fields.last().map_or(Unit::Second, |f| f.unit)
    }

    /// First unit (coarsest first) whose value rules `at` out.
    fn mismatch(&self, at: &DateTime<Utc>) -> Option<Unit> {
        let finest = self.finest();
        Unit::ALL.into_iter().find(|&unit| {
            match self.fields.iter().find(|f| f.unit == unit) {
                Some(field) => !field.matches(at),
                None => unit < finest && unit.value(at) != 0,
            }
        })
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        at.nanosecond() == 0 && self.mismatch(&at).is_none()
    }

    /// Least matching slot strictly after `after`.
    ///
    /// `None` only past the end of representable time.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut ts = after.timestamp().checked_add(1)?;
        loop {
            let at = DateTime::from_timestamp(ts, 0)?;
            match self.mismatch(&at) {
                None => return Some(at),
                // nothing else in this unit period can match
                Some(unit) => {
                    let step = unit.seconds();
                    ts = ts.div_euclid(step).checked_add(1)?.checked_mul(step)?;
                }
            }
        }
    }

    /// Greatest matching slot at or before `at`.
    pub fn previous_occurrence(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut ts = at.timestamp();
        loop {
            let candidate = DateTime::from_timestamp(ts, 0)?;
            match self.mismatch(&candidate) {
                None => return Some(candidate),
                Some(unit) => {
                    let step = unit.seconds();
                    ts = ts.div_euclid(step).checked_mul(step)?.checked_sub(1)?;
                }
            }
        }
    }
}

impl FromStr for Trigger {
    type Err = TriggerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Trigger::parse(s)
    }
}

impl TryFrom<String> for Trigger {
    type Error = TriggerParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Trigger::parse(&value)
    }
}

impl From<Trigger> for String {
    fn from(trigger: Trigger) -> Self {
        trigger.to_string()
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // finest first reads naturally: "second(*%10) minute(*%5)"
        for (i, field) in self.fields.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, kind: TriggerParseErrorKind) -> TriggerParseError {
        TriggerParseError {
            position: self.pos,
            kind,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn skip_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.input[start..self.pos]
    }

    fn expect(&mut self, expected: char) -> Result<(), TriggerParseError> {
        self.skip_while(char::is_whitespace);
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            Ok(())
        } else {
            Err(self.error(TriggerParseErrorKind::Expected(expected)))
        }
    }

    fn parse(mut self) -> Result<Trigger, TriggerParseError> {
        let mut fields: Vec<Field> = Vec::new();
        loop {
            self.skip_while(|c| c.is_whitespace() || c == ',');
            if self.peek().is_none() {
                break;
            }
            let start = self.pos;
            let field = self.field()?;
            if fields.iter().any(|f| f.unit == field.unit) {
                return Err(TriggerParseError {
                    position: start,
                    kind: TriggerParseErrorKind::DuplicateUnit(field.unit),
                });
            }
            fields.push(field);
        }
        if fields.is_empty() {
            return Err(self.error(TriggerParseErrorKind::Empty));
        }
        fields.sort_by(|a, b| b.unit.cmp(&a.unit));
        Ok(Trigger { fields })
    }

    fn field(&mut self) -> Result<Field, TriggerParseError> {
        let start = self.pos;
        let name = self.skip_while(|c| c.is_ascii_alphabetic());
        let unit = Unit::from_name(&name.to_ascii_lowercase()).ok_or_else(|| TriggerParseError {
            position: start,
            kind: TriggerParseErrorKind::UnknownUnit(name.to_string()),
        })?;
        self.expect('(')?;
        self.expect('*')?;
        self.skip_while(char::is_whitespace);
        let every = if self.peek() == Some('%') {
            self.pos += 1;
            self.skip_while(char::is_whitespace);
            self.modulus()?
        } else {
            1
        };
        self.expect(')')?;
        Ok(Field { unit, every })
    }

    fn modulus(&mut self) -> Result<u32, TriggerParseError> {
        let start = self.pos;
        let digits = self.skip_while(|c| c.is_ascii_digit());
        let at = |kind| TriggerParseError {
            position: start,
            kind,
        };
        if digits.is_empty() {
            return Err(at(TriggerParseErrorKind::MissingModulus));
        }
        match digits.parse::<u32>() {
            Ok(0) => Err(at(TriggerParseErrorKind::ZeroModulus)),
            Ok(n) => Ok(n),
            Err(_) => Err(at(TriggerParseErrorKind::ModulusOverflow)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[rstest]
    #[case("second(*%10)", "second(*%10)")]
    #[case("  sec( * % 3 )  ", "second(*%3)")]
    #[case("minute(*%5), hour(*)", "minute(*%5) hour(*)")]
    #[case("DAY(*%2) second(*)", "second(*) day(*%2)")]
    fn parses_and_normalizes(#[case] input: &str, #[case] canonical: &str) {
        assert_eq!(Trigger::parse(input).unwrap().to_string(), canonical);
    }

    #[rstest]
    #[case("", 0, TriggerParseErrorKind::Empty)]
    #[case("week(*)", 0, TriggerParseErrorKind::UnknownUnit("week".into()))]
    #[case("second*", 6, TriggerParseErrorKind::Expected('('))]
    #[case("second(5)", 7, TriggerParseErrorKind::Expected('*'))]
    #[case("second(*%)", 9, TriggerParseErrorKind::MissingModulus)]
    #[case("second(*%0)", 9, TriggerParseErrorKind::ZeroModulus)]
    #[case("second(*%99999999999)", 9, TriggerParseErrorKind::ModulusOverflow)]
    #[case("second(*%2", 10, TriggerParseErrorKind::Expected(')'))]
    #[case("second(*) sec(*%2)", 10, TriggerParseErrorKind::DuplicateUnit(Unit::Second))]
    fn reports_positioned_errors(
        #[case] input: &str,
        #[case] position: usize,
        #[case] kind: TriggerParseErrorKind,
    ) {
        assert_eq!(
            Trigger::parse(input).unwrap_err(),
            TriggerParseError { position, kind }
        );
    }

    #[test]
    fn every_tenth_second_is_strictly_increasing() {
        let trigger = Trigger::parse("second(*%10)").unwrap();
        let mut t = at(8, 0, 3);
        let mut slots = Vec::new();
        for _ in 0..8 {
            t = trigger.next_occurrence(t).unwrap();
            slots.push(t);
        }
        assert_eq!(slots[0], at(8, 0, 10));
        for pair in slots.windows(2) {
            assert_eq!(pair[1] - pair[0], chrono::Duration::seconds(10));
        }
        assert_eq!(slots[7], at(8, 1, 20));
    }

    #[rstest]
    #[case("second(*%10)", at(8, 0, 10), at(8, 0, 20))]
    #[case("second(*%10)", at(8, 0, 59), at(8, 1, 0))]
    #[case("minute(*%5)", at(8, 0, 0), at(8, 5, 0))]
    #[case("minute(*%5)", at(8, 3, 59), at(8, 5, 0))]
    #[case("minute(*)", at(8, 0, 30), at(8, 1, 0))]
    #[case("hour(*%6) minute(*%30)", at(6, 10, 0), at(6, 30, 0))]
    #[case("hour(*%6) minute(*%30)", at(6, 30, 0), at(12, 0, 0))]
    #[case("hour(*%6) second(*%30)", at(7, 0, 0), at(12, 0, 0))]
    #[case("day(*%2)", at(0, 0, 0), Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap())]
    fn next_occurrence_cases(
        #[case] input: &str,
        #[case] after: DateTime<Utc>,
        #[case] expected: DateTime<Utc>,
    ) {
        let trigger = Trigger::parse(input).unwrap();
        let next = trigger.next_occurrence(after).unwrap();
        assert_eq!(next, expected);
        assert!(trigger.matches(next));
    }

    #[test]
    fn sub_second_input_still_moves_forward() {
        let trigger = Trigger::parse("second(*)").unwrap();
        let t = at(8, 0, 5) + chrono::Duration::milliseconds(999);
        assert_eq!(trigger.next_occurrence(t).unwrap(), at(8, 0, 6));
    }

    #[rstest]
    #[case("second(*%10)", at(8, 0, 37), at(8, 0, 30))]
    #[case("second(*%10)", at(8, 0, 30), at(8, 0, 30))]
    #[case("minute(*%5)", at(8, 4, 59), at(8, 0, 0))]
    #[case("hour(*%6) minute(*%30)", at(11, 59, 59), at(6, 30, 0))]
    fn previous_occurrence_cases(
        #[case] input: &str,
        #[case] at_or_before: DateTime<Utc>,
        #[case] expected: DateTime<Utc>,
    ) {
        let trigger = Trigger::parse(input).unwrap();
        assert_eq!(trigger.previous_occurrence(at_or_before).unwrap(), expected);
    }

    #[test]
    fn next_is_monotonic() {
        let trigger = Trigger::parse("minute(*%7) second(*%15)").unwrap();
        let mut prev = trigger.next_occurrence(at(0, 0, 0)).unwrap();
        for s in 1..3_600 {
            let t = at(0, 0, 0) + chrono::Duration::seconds(s);
            let next = trigger.next_occurrence(t).unwrap();
            assert!(next > t);
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn serde_uses_the_expression_string() {
        let trigger: Trigger = serde_json::from_str(r#""minute(*%5)""#).unwrap();
        assert_eq!(serde_json::to_string(&trigger).unwrap(), r#""minute(*%5)""#);
        assert!(serde_json::from_str::<Trigger>(r#""minute(*%0)""#).is_err());
    }
}
