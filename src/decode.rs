/// Wire Decoding - Hex Quantities and Transfer Logs
///
/// Everything that crosses the JSON-RPC boundary is hex text. Quantities are
/// parsed through `BigUint` and narrowed to native integers only when they
/// provably fit; amounts stay arbitrary precision and leave this module as
/// decimal strings.

use num_bigint::BigUint;
use num_traits::{Num, ToPrimitive};

use crate::constants::{MAX_SAFE_QUANTITY, TRANSFER_TOPIC0};
use crate::error::Error;
use crate::rpc::RawLog;
use crate::types::Transfer;

/// Parse a `0x…` JSON-RPC quantity into a u64.
///
/// Conversion goes through `BigUint` first; anything above 2^53 - 1 refuses
/// to narrow, with the offending value in the error. Heights and timestamps
/// past that bound indicate a corrupt or hostile provider.
pub fn parse_quantity(hex: &str, context: &str) -> Result<u64, Error> {
    let digits = hex
        .strip_prefix("0x")
        .ok_or_else(|| Error::Validation(format!("{context}: quantity {hex:?} missing 0x prefix")))?;
    if digits.is_empty() {
        return Err(Error::Validation(format!("{context}: empty quantity")));
    }
    let value = BigUint::from_str_radix(digits, 16)
        .map_err(|_| Error::Validation(format!("{context}: quantity {hex:?} is not hex")))?;
    match value.to_u64() {
        Some(v) if v <= MAX_SAFE_QUANTITY => Ok(v),
        _ => Err(Error::Validation(format!(
            "{context}: quantity {hex} exceeds the safe integer bound"
        ))),
    }
}

/// Parse a 32-byte hex word into its decimal-string value.
pub fn parse_uint256(hex: &str, context: &str) -> Result<String, Error> {
    let digits = hex
        .strip_prefix("0x")
        .ok_or_else(|| Error::Validation(format!("{context}: word {hex:?} missing 0x prefix")))?;
    if digits.is_empty() || digits.len() > 64 {
        return Err(Error::Validation(format!(
            "{context}: word has {} hex chars, expected 1..=64",
            digits.len()
        )));
    }
    let value = BigUint::from_str_radix(digits, 16)
        .map_err(|_| Error::Validation(format!("{context}: word {hex:?} is not hex")))?;
    Ok(value.to_str_radix(10))
}

/// Extract the trailing 20 bytes of a 32-byte topic as a `0x…` address.
fn topic_to_address(topic: &str, context: &str) -> Result<String, Error> {
    let digits = topic
        .strip_prefix("0x")
        .ok_or_else(|| Error::Validation(format!("{context}: topic missing 0x prefix")))?;
    if digits.len() != 64 {
        return Err(Error::Validation(format!(
            "{context}: topic has {} hex chars, expected 64",
            digits.len()
        )));
    }
    // Address topics are left-padded with twelve zero bytes.
    let (padding, address) = digits.split_at(24);
    if padding.bytes().any(|b| b != b'0') {
        return Err(Error::Validation(format!(
            "{context}: address topic has non-zero padding"
        )));
    }
    Ok(format!("0x{}", address.to_ascii_lowercase()))
}

/// Decode a raw log into a `Transfer`.
///
/// Accepts the canonical `Transfer(address,address,uint256)` layout and the
/// variant carrying a trailing `uint256` timestamp in the data; anything else
/// is a validation error (the engine filtered on topic0, so a mismatched log
/// here is a provider fault, not routine noise).
pub fn decode_transfer(log: &RawLog) -> Result<Transfer, Error> {
    let context = format!(
        "log {}#{}",
        log.transaction_hash.as_deref().unwrap_or("?"),
        log.log_index.as_deref().unwrap_or("?")
    );

    let topic0 = log
        .topics
        .first()
        .ok_or_else(|| Error::Validation(format!("{context}: log has no topics")))?;
    if !topic0.eq_ignore_ascii_case(TRANSFER_TOPIC0) {
        return Err(Error::Validation(format!(
            "{context}: topic0 {topic0} is not a Transfer signature"
        )));
    }
    if log.topics.len() != 3 {
        return Err(Error::Validation(format!(
            "{context}: Transfer expects 3 topics, got {}",
            log.topics.len()
        )));
    }

    let from_address = topic_to_address(&log.topics[1], &context)?;
    let to_address = topic_to_address(&log.topics[2], &context)?;

    let data = log
        .data
        .strip_prefix("0x")
        .ok_or_else(|| Error::Validation(format!("{context}: data missing 0x prefix")))?;
    // One word = value; two words = value + trailing timestamp.
    let amount = match data.len() {
        64 => parse_uint256(&format!("0x{}", &data[..64]), &context)?,
        128 => parse_uint256(&format!("0x{}", &data[..64]), &context)?,
        other => {
            return Err(Error::Validation(format!(
                "{context}: Transfer data has {other} hex chars, expected 64 or 128"
            )))
        }
    };

    let block_number = parse_quantity(
        log.block_number
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("{context}: log missing blockNumber")))?,
        &context,
    )?;
    let log_index = parse_quantity(
        log.log_index
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("{context}: log missing logIndex")))?,
        &context,
    )?;
    let transaction_hash = log
        .transaction_hash
        .clone()
        .ok_or_else(|| Error::Validation(format!("{context}: log missing transactionHash")))?
        .to_ascii_lowercase();

    Ok(Transfer {
        block_number,
        transaction_hash,
        log_index,
        from_address,
        to_address,
        amount,
        token_address: log.address.to_ascii_lowercase(),
    })
}
