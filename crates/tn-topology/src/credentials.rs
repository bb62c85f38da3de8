use std::collections::BTreeMap;
use std::fmt::Write;

use rand::Rng;
use rand::distr::Alphanumeric;

pub const PRIVATE_KEY_ENV: &str = "ETH_PRIVATE_KEY";
pub const PASSWORD_ENV: &str = "ETH_PASSWORD";

const PASSWORD_LEN: usize = 24;

/// Account key material handed to a chain-connected node.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// 32 bytes, lowercase hex.
    pub private_key: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").finish_non_exhaustive()
    }
}

impl Credential {
    pub fn generate(rng: &mut impl Rng) -> Self {
        let key: [u8; 32] = rng.random();
        let password = (0..PASSWORD_LEN)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect();

        Self {
            private_key: hex(&key),
            password,
        }
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (PRIVATE_KEY_ENV.to_string(), self.private_key.clone()),
            (PASSWORD_ENV.to_string(), self.password.clone()),
        ])
    }
}

/// Random shared secret between orchestrators and their transcoders.
pub fn shared_secret(rng: &mut impl Rng) -> String {
    let bytes: [u8; 16] = rng.random();
    hex(&bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn key_is_64_hex_chars() {
        let cred = Credential::generate(&mut StdRng::seed_from_u64(1));
        assert_eq!(cred.private_key.len(), 64);
        assert!(cred.private_key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(cred.password.len(), PASSWORD_LEN);
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let a = Credential::generate(&mut StdRng::seed_from_u64(5));
        let b = Credential::generate(&mut StdRng::seed_from_u64(5));
        let c = Credential::generate(&mut StdRng::seed_from_u64(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn debug_hides_secrets() {
        let cred = Credential::generate(&mut StdRng::seed_from_u64(1));
        assert!(!format!("{cred:?}").contains(&cred.private_key));
    }
}
