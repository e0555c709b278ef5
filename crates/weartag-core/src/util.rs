//! Small helpers shared across the crate.

use std::sync::{Mutex, MutexGuard, PoisonError};

use btleplug::platform::PeripheralId;

/// Address reported by CoreBluetooth, which hides real MAC addresses.
const PLACEHOLDER_ADDRESS: &str = "00:00:00:00:00:00";

/// Lock a std mutex, recovering the data if a holder panicked.
///
/// Engine state is only mutated in short critical sections that leave it
/// consistent, so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Format a peripheral ID as a plain string.
///
/// On macOS peripheral IDs are UUIDs, elsewhere they wrap the address.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Stable tag identifier from an address and peripheral ID.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    match normalize_address(address) {
        Some(address) => address,
        None => format_peripheral_id(peripheral_id),
    }
}

/// Upper-case a MAC address, or `None` for the macOS placeholder.
pub(crate) fn normalize_address(address: &str) -> Option<String> {
    let address = address.trim();
    if address.is_empty() || address == PLACEHOLDER_ADDRESS {
        None
    } else {
        Some(address.to_ascii_uppercase())
    }
}
