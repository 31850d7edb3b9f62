//! Identifier generation: `{prefix}_{base36 millis}_{random base36}`.

use chrono::Utc;
use rand::Rng;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 9;

/// Generate an identifier that is unique with overwhelming probability.
pub fn generate(prefix: &str) -> String {
  let millis = Utc::now().timestamp_millis().max(0) as u64;
  let mut rng = rand::thread_rng();
  let suffix: String = (0..SUFFIX_LEN)
    .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
    .collect();
  format!("{}_{}_{}", prefix, base36(millis), suffix)
}

fn base36(mut n: u64) -> String {
  if n == 0 {
    return "0".to_string();
  }
  let mut digits = Vec::new();
  while n > 0 {
    digits.push(ALPHABET[(n % 36) as usize]);
    n /= 36;
  }
  digits.reverse();
  String::from_utf8_lossy(&digits).into_owned()
}
