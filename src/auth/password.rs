use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use pbkdf2::password_hash::{Output, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{pbkdf2_hmac, Params, Pbkdf2};
use rand::RngCore;
use sha2::Sha256;

/// Iteration count for new hashes. Stored hashes carry their own count.
pub const PBKDF2_ROUNDS: u32 = 29_000;
const SALT_LEN: usize = 16;
const OUTPUT_LEN: usize = 32;
const PBKDF2_SHA256_PREFIX: &str = "$pbkdf2-sha256$";

/// PBKDF2-HMAC-SHA256 with a random 16-byte salt, as a PHC string
/// (`$pbkdf2-sha256$i=29000,l=32$<salt>$<hash>`).
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| anyhow!("Failed to encode salt: {}", e))?;

    let params = Params {
        rounds: PBKDF2_ROUNDS,
        output_length: OUTPUT_LEN,
    };
    let hash = Pbkdf2
        .hash_password_customized(password.as_bytes(), None, None, params, &salt)
        .map_err(|e| anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// `Ok(false)` for a wrong password; `Err` only when the stored hash is unreadable.
/// Accepts PHC strings and the passlib form older credential stores hold.
pub fn verify_password(password: &str, stored: &str) -> Result<bool> {
    if let Some(legacy) = PasslibHash::detect(stored) {
        return legacy?.verify(password);
    }
    let parsed =
        PasswordHash::new(stored).map_err(|e| anyhow!("Failed to parse stored hash: {}", e))?;
    Ok(Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok())
}

/// passlib `$pbkdf2-sha256$<rounds>$<salt>$<digest>`. Salt and digest are
/// unpadded base64 with `.` in place of `+`.
struct PasslibHash {
    rounds: u32,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl PasslibHash {
    /// `None` when `stored` is not in passlib form (a bare round count where
    /// PHC has `i=...`).
    fn detect(stored: &str) -> Option<Result<Self>> {
        let rest = stored.strip_prefix(PBKDF2_SHA256_PREFIX)?;
        let mut fields = rest.split('$');
        let rounds = fields.next()?;
        if rounds.is_empty() || !rounds.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self::parse(rounds, fields.next(), fields.next(), fields.next()))
    }

    fn parse(
        rounds: &str,
        salt: Option<&str>,
        digest: Option<&str>,
        extra: Option<&str>,
    ) -> Result<Self> {
        let (Some(salt), Some(digest), None) = (salt, digest, extra) else {
            return Err(anyhow!("Malformed pbkdf2-sha256 hash"));
        };
        let rounds = rounds
            .parse::<u32>()
            .context("Invalid pbkdf2-sha256 round count")?;
        if rounds == 0 {
            return Err(anyhow!("Invalid pbkdf2-sha256 round count"));
        }
        Ok(Self {
            rounds,
            salt: decode_ab64(salt).context("Invalid pbkdf2-sha256 salt")?,
            digest: decode_ab64(digest).context("Invalid pbkdf2-sha256 digest")?,
        })
    }

    fn verify(&self, password: &str) -> Result<bool> {
        let mut computed = vec![0u8; self.digest.len()];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &self.salt, self.rounds, &mut computed);
        let expected = Output::new(&self.digest)
            .map_err(|e| anyhow!("Unsupported pbkdf2-sha256 digest: {}", e))?;
        let actual = Output::new(&computed)
            .map_err(|e| anyhow!("Unsupported pbkdf2-sha256 digest: {}", e))?;
        // Output equality is constant-time.
        Ok(expected == actual)
    }
}

fn decode_ab64(encoded: &str) -> Result<Vec<u8>> {
    Ok(STANDARD_NO_PAD.decode(encoded.replace('.', "+"))?)
}
