/// Validator - Runtime Schema and Invariant Checks
///
/// Pure functions between the wire and the store. Hex is normalised to
/// lowercase and shape-checked, quantities go through the big-integer
/// narrowing in `decode`, and batch validation is all-or-nothing: one bad
/// block fails the whole batch rather than letting a partial batch commit.

use crate::constants::MAX_TIMESTAMP_DRIFT_SECS;
use crate::decode::parse_quantity;
use crate::error::Error;
use crate::rpc::RawBlock;
use crate::types::{Block, Transfer};

/// Normalise and shape-check a 32-byte hash: `^0x[0-9a-f]{64}$`.
pub fn normalize_hash(value: &str, context: &str) -> Result<String, Error> {
    let lower = value.to_ascii_lowercase();
    let digits = lower
        .strip_prefix("0x")
        .ok_or_else(|| Error::Validation(format!("{context}: hash {value:?} missing 0x prefix")))?;
    if digits.len() != 64 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Validation(format!(
            "{context}: hash {value:?} is not 32 bytes of hex"
        )));
    }
    Ok(lower)
}

/// Normalise and shape-check a 20-byte address: `^0x[0-9a-f]{40}$`.
pub fn normalize_address(value: &str, context: &str) -> Result<String, Error> {
    let lower = value.to_ascii_lowercase();
    let digits = lower
        .strip_prefix("0x")
        .ok_or_else(|| {
            Error::Validation(format!("{context}: address {value:?} missing 0x prefix"))
        })?;
    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Validation(format!(
            "{context}: address {value:?} is not 20 bytes of hex"
        )));
    }
    Ok(lower)
}

/// Check an amount is a plain non-negative decimal integer, at most 78
/// digits (2^256 - 1). No sign, no exponent, no decimal point.
pub fn check_amount(value: &str, context: &str) -> Result<(), Error> {
    if value.is_empty() || value.len() > 78 {
        return Err(Error::Validation(format!(
            "{context}: amount has {} digits, expected 1..=78",
            value.len()
        )));
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Validation(format!(
            "{context}: amount {value:?} is not a decimal integer"
        )));
    }
    if value.len() > 1 && value.starts_with('0') {
        return Err(Error::Validation(format!(
            "{context}: amount {value:?} has leading zeros"
        )));
    }
    Ok(())
}

/// Validate one raw block into its committed form.
pub fn validate_block(raw: &RawBlock, chain_id: u64, now_secs: u64) -> Result<Block, Error> {
    let number = parse_quantity(&raw.number, "block.number")?;
    let context = format!("block {number}");

    let hash = normalize_hash(&raw.hash, &context)?;
    let parent_hash = normalize_hash(&raw.parent_hash, &context)?;
    let timestamp = parse_quantity(&raw.timestamp, &context)?;

    if timestamp > now_secs + MAX_TIMESTAMP_DRIFT_SECS {
        return Err(Error::Validation(format!(
            "{context}: timestamp {timestamp} is more than a day in the future"
        )));
    }

    Ok(Block {
        number,
        hash,
        parent_hash,
        timestamp,
        chain_id,
    })
}

/// Validate every block or none. The result is NOT sorted; ordering is the
/// engine's responsibility before linkage is checked.
pub fn validate_blocks(
    raws: &[RawBlock],
    chain_id: u64,
    now_secs: u64,
) -> Result<Vec<Block>, Error> {
    raws.iter()
        .map(|raw| validate_block(raw, chain_id, now_secs))
        .collect()
}

/// Re-check a decoded transfer at the store boundary.
pub fn validate_transfer(transfer: &Transfer) -> Result<(), Error> {
    let context = format!(
        "transfer ({}, {})",
        transfer.block_number, transfer.log_index
    );
    normalize_hash(&transfer.transaction_hash, &context)?;
    normalize_address(&transfer.from_address, &context)?;
    normalize_address(&transfer.to_address, &context)?;
    normalize_address(&transfer.token_address, &context)?;
    check_amount(&transfer.amount, &context)
}

/// All-or-nothing transfer validation.
pub fn validate_transfers(transfers: &[Transfer]) -> Result<(), Error> {
    transfers.iter().try_for_each(validate_transfer)
}

/// Check intra-batch continuity: consecutive heights, each block's
/// parent_hash equal to its predecessor's hash. Input must be sorted.
pub fn check_linkage(blocks: &[Block]) -> Result<(), Error> {
    for pair in blocks.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.number != prev.number + 1 {
            return Err(Error::Validation(format!(
                "batch is not contiguous: block {} follows block {}",
                next.number, prev.number
            )));
        }
        if next.parent_hash != prev.hash {
            return Err(Error::Validation(format!(
                "linkage break inside batch: block {} claims parent {}, predecessor is {}",
                next.number, next.parent_hash, prev.hash
            )));
        }
    }
    Ok(())
}
