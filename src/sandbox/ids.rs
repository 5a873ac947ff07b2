use super::error::SandboxError;

const ALPHABET: &[u8; 64] = b"useandom-26T198340PX75pxJACKVERYMINDBUSHWOLF_GQZbfghjklqvwyzrict";

pub const SANDBOX_ID_PREFIX: &str = "sbx-";

/// Random string over a 64-symbol URL-safe alphabet.
fn random_string(len: usize) -> Result<String, SandboxError> {
    let mut bytes = vec![0u8; len];
    getrandom::fill(&mut bytes)
        .map_err(|e| SandboxError::Backend(format!("random source unavailable: {e}")))?;
    Ok(bytes
        .iter()
        .map(|b| ALPHABET[(b & 63) as usize] as char)
        .collect())
}

/// `sbx-` followed by 12 random symbols (72 bits).
pub fn generate_sandbox_id() -> Result<String, SandboxError> {
    Ok(format!("{SANDBOX_ID_PREFIX}{}", random_string(12)?))
}

pub fn generate_access_token() -> Result<String, SandboxError> {
    random_string(32)
}

/// `sk-sandbox-` followed by 24 random bytes in hex.
pub fn generate_api_key() -> Result<String, SandboxError> {
    let mut bytes = [0u8; 24];
    getrandom::fill(&mut bytes)
        .map_err(|e| SandboxError::Backend(format!("random source unavailable: {e}")))?;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sk-sandbox-{hex}"))
}
