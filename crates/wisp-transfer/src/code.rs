/// Pairing codes: four uppercase letters, a hyphen, four digits (`QXBT-4821`).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::TransferError;

pub const CODE_LETTERS: usize = 4;
pub const CODE_DIGITS: usize = 4;

/// Generate a fresh code from the OS entropy source, falling back to the
/// thread-local generator if the OS source is unavailable.
pub fn generate_code() -> String {
    match StdRng::try_from_os_rng() {
        Ok(mut rng) => code_from_rng(&mut rng),
        Err(e) => {
            tracing::warn!("OS randomness unavailable ({e}), using thread rng for pairing code");
            code_from_rng(&mut rand::rng())
        }
    }
}

pub fn code_from_rng<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut code = String::with_capacity(CODE_LETTERS + 1 + CODE_DIGITS);
    for _ in 0..CODE_LETTERS {
        code.push(char::from(b'A' + rng.random_range(0..26u8)));
    }
    code.push('-');
    for _ in 0..CODE_DIGITS {
        code.push(char::from(b'0' + rng.random_range(0..10u8)));
    }
    code
}

pub fn is_valid_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == CODE_LETTERS + 1 + CODE_DIGITS
        && bytes[..CODE_LETTERS].iter().all(u8::is_ascii_uppercase)
        && bytes[CODE_LETTERS] == b'-'
        && bytes[CODE_LETTERS + 1..].iter().all(u8::is_ascii_digit)
}

/// Trim and uppercase user input, then validate it.
pub fn parse_code(input: &str) -> Result<String, TransferError> {
    let code = input.trim().to_ascii_uppercase();
    if is_valid_code(&code) {
        Ok(code)
    } else {
        Err(TransferError::InvalidCode(input.to_string()))
    }
}
