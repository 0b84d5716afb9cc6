//! Shared-access-signature tokens for the twin store.
//!
//! A SAS token signs `{url-encoded resource}\n{expiry}` with HMAC-SHA256
//! under the shared access key, and is sent verbatim as the `Authorization`
//! header value.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Percent-encode everything outside the unreserved set.
pub(crate) fn url_encode(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  for byte in input.bytes() {
    match byte {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
        out.push(byte as char)
      }
      other => out.push_str(&format!("%{other:02X}")),
    }
  }
  out
}

/// Build a `SharedAccessSignature` header value for `resource_uri`, valid
/// until `expiry_unix` (seconds since the epoch).
pub fn sign(resource_uri: &str, key: &[u8], key_name: &str, expiry_unix: i64) -> String {
  let encoded_resource = url_encode(resource_uri);
  let string_to_sign = format!("{encoded_resource}\n{expiry_unix}");

  let mut mac =
    HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
  mac.update(string_to_sign.as_bytes());
  let signature = B64.encode(mac.finalize().into_bytes());

  format!(
    "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry_unix}&skn={key_name}",
    url_encode(&signature)
  )
}
