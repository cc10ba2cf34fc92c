use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const BASIC: &str = "Basic ";

/// Device key carried by an `Authorization` header value.
///
/// `<scheme> <token>` yields the token, a value without a space is the key
/// itself and `Basic` credentials yield the password half.
pub fn key_from_authorization(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(encoded) = value.strip_prefix(BASIC) {
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (_, password) = decoded.split_once(':')?;
        return non_empty(password);
    }

    match value.split_once(' ') {
        Some((_, token)) => non_empty(token.trim()),
        None => non_empty(value),
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
