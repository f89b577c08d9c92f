//! Core domain types: tickers, price updates and delivered tokens.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a user holding price triggers.
pub type UserId = u64;

/// Short uppercase symbol identifying an instrument (e.g. "BTC").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    /// Normalize and validate a raw symbol.
    ///
    /// Surrounding whitespace is trimmed and the symbol is uppercased. Empty
    /// symbols and symbols with anything but ASCII alphanumerics are rejected.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let symbol = raw.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(CoreError::InvalidArgument("empty ticker".to_string()));
        }
        if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidArgument(format!(
                "ticker {:?} must be alphanumeric",
                raw
            )));
        }
        Ok(Self(symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Ticker {
    type Error = CoreError;

    fn try_from(raw: String) -> CoreResult<Self> {
        Self::parse(&raw)
    }
}

impl From<Ticker> for String {
    fn from(ticker: Ticker) -> Self {
        ticker.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ticker {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single instrument's latest known price, the unit delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub ticker: Ticker,
    pub price: f64,
}

impl Token {
    pub fn new(ticker: Ticker, price: f64) -> Self {
        Self { ticker, price }
    }
}

/// One or more ticks observed in a single inbound frame. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    prices: HashMap<Ticker, f64>,
}

impl PriceUpdate {
    pub fn single(ticker: Ticker, price: f64) -> Self {
        let mut prices = HashMap::with_capacity(1);
        prices.insert(ticker, price);
        Self { prices }
    }

    /// Build an update from several ticks. Returns `None` for an empty input.
    pub fn from_pairs<I>(pairs: I) -> Option<Self>
    where
        I: IntoIterator<Item = (Ticker, f64)>,
    {
        let prices: HashMap<Ticker, f64> = pairs.into_iter().collect();
        if prices.is_empty() {
            None
        } else {
            Some(Self { prices })
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn get(&self, ticker: &Ticker) -> Option<f64> {
        self.prices.get(ticker).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ticker, f64)> {
        self.prices.iter().map(|(t, p)| (t, *p))
    }

    /// Expand into one token per ticker.
    pub fn tokens(&self) -> Vec<Token> {
        self.prices
            .iter()
            .map(|(ticker, price)| Token::new(ticker.clone(), *price))
            .collect()
    }
}
