//! Canonical asset addressing.
//!
//! An address renders to a stable string usable as a lookup key:
//!
//! ```text
//! addr := set_id "." asset_type [ "(" arg { "," arg } ")" ] [ "[" addr { "," addr } "]" ]
//! ```
//!
//! Examples: `btcusdt.price`, `btcusdt.volume`,
//! `btcusdt.ema(12)[btcusdt.price,btcusdt.volume]`. Two addresses are equal
//! iff their canonical strings are equal. Dependencies are embedded
//! sub-addresses, so every address is a finite tree.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetAddress(String);

impl AssetAddress {
    pub fn from_canonical(s: impl Into<String>) -> EngineResult<AssetAddress> {
        let addr = AssetAddress(s.into());
        addr.parse()?;
        Ok(addr)
    }

    /// Build an address by folding a set id into the asset's own parts.
    pub fn build(
        set_id: &str,
        asset_type: &str,
        arguments: &[String],
        dependencies: &[AssetAddress],
    ) -> AssetAddress {
        let mut s = format!("{}.{}", set_id.to_lowercase(), asset_type);
        if !arguments.is_empty() {
            s.push('(');
            s.push_str(&arguments.join(","));
            s.push(')');
        }
        if !dependencies.is_empty() {
            s.push('[');
            let deps: Vec<&str> = dependencies.iter().map(|d| d.as_str()).collect();
            s.push_str(&deps.join(","));
            s.push(']');
        }
        AssetAddress(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn parse(&self) -> EngineResult<ParsedAddress> {
        let mut parser = Parser {
            input: self.0.as_bytes(),
            pos: 0,
        };
        let parsed = parser.parse_address()?;
        if parser.pos != parser.input.len() {
            return Err(EngineError::Validation(format!(
                "trailing characters in asset address '{}'",
                self.0
            )));
        }
        Ok(parsed)
    }
}

impl fmt::Display for AssetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured form of an [`AssetAddress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub set_id: String,
    pub asset_type: String,
    pub arguments: Vec<String>,
    pub dependencies: Vec<AssetAddress>,
}

impl ParsedAddress {
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    pub fn address(&self) -> AssetAddress {
        AssetAddress::build(
            &self.set_id,
            &self.asset_type,
            &self.arguments,
            &self.dependencies,
        )
    }

    /// Transitive dependency addresses, self excluded, pre-order.
    pub fn dependency_closure(&self) -> EngineResult<Vec<AssetAddress>> {
        let mut out = Vec::new();
        for dep in &self.dependencies {
            out.push(dep.clone());
            let parsed = dep.parse()?;
            out.extend(parsed.dependency_closure()?);
        }
        out.dedup();
        Ok(out)
    }

    /// CSV column prefix for this asset. The set id is prepended only when
    /// the export mixes several sets.
    pub fn column_prefix(&self, include_set: bool) -> String {
        let mut name = self.asset_type.clone();
        for arg in &self.arguments {
            name.push('-');
            name.push_str(arg);
        }
        if include_set {
            format!("{}_{}", self.set_id, name)
        } else {
            name
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> EngineError {
        EngineError::Validation(format!(
            "invalid asset address '{}' at byte {}: {}",
            String::from_utf8_lossy(self.input),
            self.pos,
            msg
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&self.input[start..self.pos]).unwrap_or("")
    }

    fn expect(&mut self, c: u8) -> EngineResult<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c as char)))
        }
    }

    fn parse_address(&mut self) -> EngineResult<ParsedAddress> {
        let set_id = self.take_while(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if set_id.is_empty() {
            return Err(self.error("empty set id"));
        }
        self.expect(b'.')?;
        let asset_type =
            self.take_while(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_' || c == b'-');
        if asset_type.is_empty() {
            return Err(self.error("empty asset type"));
        }

        let mut arguments = Vec::new();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let arg = self.take_while(|c| c != b',' && c != b')');
                if arg.is_empty() {
                    return Err(self.error("empty argument"));
                }
                arguments.push(arg.to_string());
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("unterminated argument list")),
                }
            }
        }

        let mut dependencies = Vec::new();
        if self.peek() == Some(b'[') {
            self.pos += 1;
            loop {
                let dep = self.parse_address()?;
                dependencies.push(dep.address());
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b']') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("unterminated dependency list")),
                }
            }
        }

        Ok(ParsedAddress {
            set_id: set_id.to_string(),
            asset_type: asset_type.to_string(),
            arguments,
            dependencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_address_round_trip() {
        let addr = AssetAddress::from_canonical("btcusdt.price").unwrap();
        let parsed = addr.parse().unwrap();
        assert_eq!(parsed.set_id, "btcusdt");
        assert_eq!(parsed.asset_type, "price");
        assert!(parsed.dependencies.is_empty());
        assert_eq!(parsed.address(), addr);
    }

    #[test]
    fn indicator_address_round_trip() {
        let addr = AssetAddress::from_canonical(
            "btcusdt.ema(12)[btcusdt.price,btcusdt.volume]",
        )
        .unwrap();
        let parsed = addr.parse().unwrap();
        assert_eq!(parsed.asset_type, "ema");
        assert_eq!(parsed.arguments, vec!["12"]);
        assert_eq!(parsed.dependencies.len(), 2);
        assert_eq!(parsed.address(), addr);
    }

    #[test]
    fn nested_dependencies_flatten_into_closure() {
        let addr = AssetAddress::from_canonical(
            "btcusdt.ratio[btcusdt.ema(12)[btcusdt.price],btcusdt.volume]",
        )
        .unwrap();
        let closure = addr.parse().unwrap().dependency_closure().unwrap();
        let strings: Vec<&str> = closure.iter().map(|a| a.as_str()).collect();
        assert_eq!(
            strings,
            vec![
                "btcusdt.ema(12)[btcusdt.price]",
                "btcusdt.price",
                "btcusdt.volume"
            ]
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(AssetAddress::from_canonical("").is_err());
        assert!(AssetAddress::from_canonical("btcusdt").is_err());
        assert!(AssetAddress::from_canonical("BTC.price").is_err());
        assert!(AssetAddress::from_canonical("btcusdt.ema(").is_err());
        assert!(AssetAddress::from_canonical("btcusdt.ema[btcusdt.price").is_err());
        assert!(AssetAddress::from_canonical("btcusdt.price extra").is_err());
    }

    #[test]
    fn column_prefix_folds_arguments() {
        let addr = AssetAddress::from_canonical("btcusdt.ema(12)[btcusdt.price]").unwrap();
        let parsed = addr.parse().unwrap();
        assert_eq!(parsed.column_prefix(false), "ema-12");
        assert_eq!(parsed.column_prefix(true), "btcusdt_ema-12");
    }
}
