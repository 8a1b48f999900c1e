//! OAuth 1.0a request signing (HMAC-SHA1).
//!
//! Twitter's media upload endpoints authenticate with the app-level
//! OAuth 1.0a credential rather than the user's OAuth 2.0 bearer token.
//! Only the pieces those endpoints need are implemented: parameter
//! normalization, the signature base string, and the Authorization header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;

use crate::config::TwitterAppCredential;
use crate::error::{Error, Result};

/// RFC 3986 unreserved characters stay bare; everything else is encoded.
const STRICT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, STRICT).to_string()
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Build the `Authorization: OAuth ...` header for one request.
///
/// `params` must contain every request parameter that participates in the
/// signature (form fields and query parameters); body parts sent as
/// multipart do not participate, per the Twitter upload contract.
pub fn authorization_header(
    credential: &TwitterAppCredential,
    method: &str,
    url: &str,
    params: &[(String, String)],
    nonce: &str,
    timestamp_secs: i64,
) -> String {
    let timestamp = timestamp_secs.to_string();
    let oauth_params = [
        ("oauth_consumer_key", credential.api_key.as_str()),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_token", credential.access_token.as_str()),
        ("oauth_version", "1.0"),
    ]
    .map(|(k, v)| (k.to_string(), v.to_string()));

    // Normalized parameter string: all params, encoded, sorted.
    let mut all: Vec<(String, String)> = params
        .iter()
        .cloned()
        .chain(oauth_params.iter().cloned())
        .map(|(k, v)| (percent_encode(&k), percent_encode(&v)))
        .collect();
    all.sort();
    let param_string = all
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    );

    let signing_key = format!(
        "{}&{}",
        percent_encode(&credential.api_secret),
        percent_encode(&credential.access_token_secret)
    );
    let signature = STANDARD.encode(hmac_sha1(signing_key.as_bytes(), base_string.as_bytes()));

    let mut header_params: Vec<(String, String)> = oauth_params.to_vec();
    header_params.push(("oauth_signature".to_string(), signature));
    header_params.sort();

    let fields = header_params
        .iter()
        .map(|(k, v)| format!(r#"{}="{}""#, percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {fields}")
}

/// Random nonce for one request.
pub fn nonce() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|e| Error::internal(format!("rng failure: {e}")))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> TwitterAppCredential {
        TwitterAppCredential {
            api_key: "xvz1evFS4wEEPTGEFPHBog".into(),
            api_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".into(),
            access_token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".into(),
            access_token_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".into(),
        }
    }

    #[test]
    fn percent_encoding_is_rfc3986_strict() {
        assert_eq!(percent_encode("Ladies + Gentlemen"), "Ladies%20%2B%20Gentlemen");
        assert_eq!(percent_encode("An encoded string!"), "An%20encoded%20string%21");
        assert_eq!(percent_encode("Dogs, Cats & Mice"), "Dogs%2C%20Cats%20%26%20Mice");
        assert_eq!(percent_encode("unreserved.-_~"), "unreserved.-_~");
    }

    #[test]
    fn header_carries_all_oauth_fields() {
        let header = authorization_header(
            &credential(),
            "post",
            "https://upload.twitter.com/1.1/media/upload.json",
            &[("command".into(), "INIT".into())],
            "abc123",
            1318622958,
        );

        assert!(header.starts_with("OAuth "));
        for field in [
            "oauth_consumer_key=",
            "oauth_nonce=\"abc123\"",
            "oauth_signature=",
            "oauth_signature_method=\"HMAC-SHA1\"",
            "oauth_timestamp=\"1318622958\"",
            "oauth_token=",
            "oauth_version=\"1.0\"",
        ] {
            assert!(header.contains(field), "missing {field} in {header}");
        }
    }

    #[test]
    fn signature_is_deterministic_and_parameter_sensitive() {
        let cred = credential();
        let url = "https://upload.twitter.com/1.1/media/upload.json";
        let a = authorization_header(
            &cred,
            "POST",
            url,
            &[("command".into(), "INIT".into())],
            "n",
            100,
        );
        let b = authorization_header(
            &cred,
            "POST",
            url,
            &[("command".into(), "INIT".into())],
            "n",
            100,
        );
        assert_eq!(a, b);

        let c = authorization_header(
            &cred,
            "POST",
            url,
            &[("command".into(), "FINALIZE".into())],
            "n",
            100,
        );
        assert_ne!(a, c);
    }

    #[test]
    fn nonce_is_unique() {
        assert_ne!(nonce().unwrap(), nonce().unwrap());
    }
}
