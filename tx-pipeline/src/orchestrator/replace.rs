//! Fee bumping for speed-up and cancel replacements

use ethers::types::U256;

use crate::ledger::TxParams;

/// Gas limit of a plain value transfer, used by cancel replacements
pub const CANCEL_GAS_LIMIT: u64 = 21_000;

/// `price` raised by 10%, rounded up
pub fn bump(price: U256) -> U256 {
    (price * U256::from(11) + U256::from(9)) / U256::from(10)
}

/// Copy the fee fields of `original` onto `params`, raised to at least 110%.
/// A caller-supplied `gas_price` is used when it is higher than the minimum bump.
pub fn bumped_fees(original: &TxParams, gas_price: Option<U256>, params: &mut TxParams) {
    let at_least = |minimum: U256| gas_price.map_or(minimum, |custom| custom.max(minimum));

    if original.is_eip1559() {
        params.gas_price = None;
        params.max_fee_per_gas = original.max_fee_per_gas.map(|fee| at_least(bump(fee)));
        params.max_priority_fee_per_gas = original.max_priority_fee_per_gas.map(bump);
    } else {
        params.gas_price = Some(at_least(original.gas_price.map(bump).unwrap_or_default()));
        params.max_fee_per_gas = None;
        params.max_priority_fee_per_gas = None;
    }
}

/// Params for a replacement that keeps the original's call but pays more
pub fn speed_up_params(original: &TxParams, gas_price: Option<U256>) -> TxParams {
    let mut params = original.clone();
    params.nonce = None;
    bumped_fees(original, gas_price, &mut params);
    params
}

/// Zero-value self-transfer competing for the original's nonce
pub fn cancel_params(original: &TxParams, gas_price: Option<U256>) -> TxParams {
    let mut params = original.clone();
    params.to = Some(original.from);
    params.value = U256::zero();
    params.gas = U256::from(CANCEL_GAS_LIMIT);
    params.data = None;
    params.nonce = None;
    bumped_fees(original, gas_price, &mut params);
    params
}
