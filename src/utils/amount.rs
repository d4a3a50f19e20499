use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("amount is empty")]
    Empty,
    #[error("amount contains a non-digit character")]
    NonDigit,
    #[error("amount does not fit into 128 bits")]
    Overflow,
}

/// Parses a base-unit integer amount string ("1000000") into a `u128`.
///
/// Monetary amounts are carried as opaque integer strings end to end and
/// never pass through floating point.
pub fn parse_base_amount(s: &str) -> Result<u128, AmountParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AmountParseError::Empty);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountParseError::NonDigit);
    }
    s.parse().map_err(|_| AmountParseError::Overflow)
}

/// Computes a fee amount from a decimal gas price string ("0.025") and a
/// gas limit, using integer math only.
///
/// `price * limit` is evaluated as `(int_part * limit) + (frac_part * limit
/// / 10^frac_digits)`, truncating toward zero.
pub fn fee_from_gas_price(gas_price: &str, gas_limit: u64) -> Result<u128, AmountParseError> {
    let gas_price = gas_price.trim();
    if gas_price.is_empty() {
        return Err(AmountParseError::Empty);
    }

    let (int_part, frac_part) = match gas_price.split_once('.') {
        Some((i, f)) => (i, f),
        None => (gas_price, ""),
    };

    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
        || (int_part.is_empty() && frac_part.is_empty())
    {
        return Err(AmountParseError::NonDigit);
    }

    let limit = u128::from(gas_limit);
    let int_value: u128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| AmountParseError::Overflow)?
    };

    let mut fee = int_value
        .checked_mul(limit)
        .ok_or(AmountParseError::Overflow)?;

    if !frac_part.is_empty() {
        let frac_value: u128 = frac_part.parse().map_err(|_| AmountParseError::Overflow)?;
        let scale = 10u128
            .checked_pow(frac_part.len() as u32)
            .ok_or(AmountParseError::Overflow)?;
        let frac_fee = frac_value
            .checked_mul(limit)
            .ok_or(AmountParseError::Overflow)?
            / scale;
        fee = fee.checked_add(frac_fee).ok_or(AmountParseError::Overflow)?;
    }

    Ok(fee)
}

/// Serde adapter for `u128` amounts represented as base-unit integer
/// strings in config files and over the wire.
pub mod base_amount {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_base_amount(&s).map_err(serde::de::Error::custom)
    }
}

/// Like [`base_amount`], for optional fields.
pub mod base_amount_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u128>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| super::parse_base_amount(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
