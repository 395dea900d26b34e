//! OAuth 1.0a request signing (HMAC-SHA1).
//!
//! Signing never touches the network: given a method, URL, parameters and credentials it
//! produces the `Authorization` header and the final request URL. Parameters whose name
//! starts with `oauth_` (e.g. `oauth_callback`, `oauth_verifier`) travel in the header;
//! everything else stays in the query string.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;
use url::Url;

use crate::profile::ConsumerCredentials;

use super::session::TokenPair;
use super::utils;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";
pub const OAUTH_VERSION: &str = "1.0";
const NONCE_LEN: usize = 32;

/// Errors raised while signing a request. Never retryable.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid request URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("request URL '{0}' has no host")]
    MissingHost(String),
    #[error("invalid signing key")]
    InvalidKey,
}

/// Per-call values that make a signature unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub nonce: String,
    pub timestamp: i64,
}

impl SigningContext {
    /// Fresh random nonce and the current Unix time.
    pub fn fresh() -> Self {
        Self {
            nonce: utils::nonce(NONCE_LEN),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// A request ready to send: target URL plus the `Authorization` header value.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: String,
    pub url: Url,
    pub authorization: String,
    oauth_params: Vec<(String, String)>,
}

impl SignedRequest {
    pub fn signature(&self) -> Option<&str> {
        self.oauth_param("oauth_signature")
    }

    pub fn oauth_param(&self, name: &str) -> Option<&str> {
        self.oauth_params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Sign a request with a fresh nonce and timestamp.
pub fn sign(
    method: &str,
    url: &str,
    params: &[(String, String)],
    credentials: &ConsumerCredentials,
    token: Option<&TokenPair>,
) -> Result<SignedRequest, SigningError> {
    sign_with(
        method,
        url,
        params,
        credentials,
        token,
        &SigningContext::fresh(),
    )
}

/// Sign a request using an explicit nonce and timestamp.
pub fn sign_with(
    method: &str,
    url: &str,
    params: &[(String, String)],
    credentials: &ConsumerCredentials,
    token: Option<&TokenPair>,
    context: &SigningContext,
) -> Result<SignedRequest, SigningError> {
    let mut target = parse_target(url)?;
    let mut query: Vec<(String, String)> = target
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    target.set_query(None);
    target.set_fragment(None);

    let mut oauth_params = vec![
        (
            "oauth_consumer_key".to_owned(),
            credentials.key().to_owned(),
        ),
        ("oauth_nonce".to_owned(), context.nonce.clone()),
        (
            "oauth_signature_method".to_owned(),
            SIGNATURE_METHOD.to_owned(),
        ),
        ("oauth_timestamp".to_owned(), context.timestamp.to_string()),
        ("oauth_version".to_owned(), OAUTH_VERSION.to_owned()),
    ];
    if let Some(token) = token {
        oauth_params.push(("oauth_token".to_owned(), token.token.clone()));
    }
    for (key, value) in params {
        if key.starts_with("oauth_") {
            oauth_params.push((key.clone(), value.clone()));
        } else {
            query.push((key.clone(), value.clone()));
        }
    }

    let method = method.to_ascii_uppercase();
    let base = base_string(
        &method,
        &target,
        query.iter().chain(oauth_params.iter()),
    );
    let key = signing_key(credentials.secret(), token.map(|t| t.secret.as_str()));
    let signature = hmac_sha1_base64(&key, &base)?;
    oauth_params.push(("oauth_signature".to_owned(), signature));

    if !query.is_empty() {
        target.set_query(Some(&encode_pairs(query.iter(), "&")));
    }

    let authorization = format!(
        "OAuth {}",
        oauth_params
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"", percent_encode(key), percent_encode(value)))
            .collect::<Vec<_>>()
            .join(",")
    );

    Ok(SignedRequest {
        method,
        url: target,
        authorization,
        oauth_params,
    })
}

/// Signature base string: `METHOD&encoded-base-url&encoded-normalized-params`.
pub fn base_string<'a, I>(method: &str, url: &Url, params: I) -> String
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(&base_url(url)),
        percent_encode(&normalize_params(params))
    )
}

/// RFC 3986 encoding: everything except `A-Z a-z 0-9 - . _ ~` is escaped.
pub fn percent_encode(value: &str) -> Cow<'_, str> {
    urlencoding::encode(value)
}

fn parse_target(url: &str) -> Result<Url, SigningError> {
    let parsed = Url::parse(url).map_err(|source| SigningError::InvalidUrl {
        url: url.to_owned(),
        source,
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(SigningError::UnsupportedScheme(other.to_owned())),
    }
    if parsed.host_str().is_none() {
        return Err(SigningError::MissingHost(url.to_owned()));
    }
    Ok(parsed)
}

fn base_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
        None => format!("{}://{}{}", url.scheme(), host, url.path()),
    }
}

fn normalize_params<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    let mut encoded: Vec<(String, String)> = params
        .into_iter()
        .map(|(key, value)| (percent_encode(key).into_owned(), percent_encode(value).into_owned()))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode_pairs<'a, I>(pairs: I, separator: &str) -> String
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>()
        .join(separator)
}

fn signing_key(consumer_secret: &str, token_secret: Option<&str>) -> String {
    format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret.unwrap_or_default())
    )
}

fn hmac_sha1_base64(key: &str, message: &str) -> Result<String, SigningError> {
    let mut mac =
        HmacSha1::new_from_slice(key.as_bytes()).map_err(|_| SigningError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_credentials() -> ConsumerCredentials {
        ConsumerCredentials::new("dpf43f3p2l4k3l03", "kd94hf93k423kf44")
    }

    fn reference_token() -> TokenPair {
        TokenPair::access("nnch734d00sl2jdk", "pfkkdhi9sl3r4s00")
    }

    fn reference_context() -> SigningContext {
        SigningContext {
            nonce: "kllo9940pd9333jh".into(),
            timestamp: 1191242096,
        }
    }

    #[test]
    fn matches_published_reference_signature() {
        let signed = sign_with(
            "get",
            "http://photos.example.net/photos?file=vacation.jpg&size=original",
            &[],
            &reference_credentials(),
            Some(&reference_token()),
            &reference_context(),
        )
        .unwrap();

        assert_eq!(signed.method, "GET");
        assert_eq!(signed.signature(), Some("tR3+Ty81lMeYAr/Fid0kMTYa/WM="));
        assert_eq!(
            signed.url.as_str(),
            "http://photos.example.net/photos?file=vacation.jpg&size=original"
        );
        assert!(signed
            .authorization
            .contains("oauth_signature=\"tR3%2BTy81lMeYAr%2FFid0kMTYa%2FWM%3D\""));
        assert!(signed.authorization.starts_with("OAuth "));
    }

    #[test]
    fn reference_base_string() {
        let url = Url::parse("http://photos.example.net/photos").unwrap();
        let params = vec![
            ("file".to_owned(), "vacation.jpg".to_owned()),
            ("size".to_owned(), "original".to_owned()),
            ("oauth_consumer_key".to_owned(), "dpf43f3p2l4k3l03".to_owned()),
            ("oauth_token".to_owned(), "nnch734d00sl2jdk".to_owned()),
            ("oauth_signature_method".to_owned(), "HMAC-SHA1".to_owned()),
            ("oauth_timestamp".to_owned(), "1191242096".to_owned()),
            ("oauth_nonce".to_owned(), "kllo9940pd9333jh".to_owned()),
            ("oauth_version".to_owned(), "1.0".to_owned()),
        ];
        assert_eq!(
            base_string("GET", &url, params.iter()),
            "GET&http%3A%2F%2Fphotos.example.net%2Fphotos&file%3Dvacation.jpg%26\
             oauth_consumer_key%3Ddpf43f3p2l4k3l03%26oauth_nonce%3Dkllo9940pd9333jh%26\
             oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D1191242096%26\
             oauth_token%3Dnnch734d00sl2jdk%26oauth_version%3D1.0%26size%3Doriginal"
        );
    }

    #[test]
    fn request_token_leg_uses_empty_token_secret() {
        let credentials = ConsumerCredentials::new("ck", "cs");
        let context = SigningContext {
            nonce: "abc".into(),
            timestamp: 100,
        };
        let signed = sign_with(
            "GET",
            "https://api.etrade.com/oauth/request_token",
            &[("oauth_callback".to_owned(), "oob".to_owned())],
            &credentials,
            None,
            &context,
        )
        .unwrap();

        let base = "GET&https%3A%2F%2Fapi.etrade.com%2Foauth%2Frequest_token&\
                    oauth_callback%3Doob%26oauth_consumer_key%3Dck%26oauth_nonce%3Dabc%26\
                    oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D100%26\
                    oauth_version%3D1.0";
        let mut mac = HmacSha1::new_from_slice(b"cs&").unwrap();
        mac.update(base.as_bytes());
        let expected = STANDARD.encode(mac.finalize().into_bytes());

        assert_eq!(signed.signature(), Some(expected.as_str()));
        assert_eq!(signed.oauth_param("oauth_callback"), Some("oob"));
        assert!(signed.oauth_param("oauth_token").is_none());
        assert!(signed.url.query().is_none());
    }

    #[test]
    fn deterministic_for_fixed_nonce_and_timestamp() {
        let params = vec![("realTimeNAV".to_owned(), "true".to_owned())];
        let first = sign_with(
            "GET",
            "https://apisb.etrade.com/v1/accounts/abc/balance.json",
            &params,
            &reference_credentials(),
            Some(&reference_token()),
            &reference_context(),
        )
        .unwrap();
        let second = sign_with(
            "GET",
            "https://apisb.etrade.com/v1/accounts/abc/balance.json",
            &params,
            &reference_credentials(),
            Some(&reference_token()),
            &reference_context(),
        )
        .unwrap();
        assert_eq!(first.authorization, second.authorization);

        let other_nonce = SigningContext {
            nonce: "different".into(),
            ..reference_context()
        };
        let third = sign_with(
            "GET",
            "https://apisb.etrade.com/v1/accounts/abc/balance.json",
            &params,
            &reference_credentials(),
            Some(&reference_token()),
            &other_nonce,
        )
        .unwrap();
        assert_ne!(first.signature(), third.signature());
    }

    #[test]
    fn non_oauth_params_stay_in_query() {
        let signed = sign(
            "GET",
            "https://apisb.etrade.com/v1/accounts/key/balance.json",
            &[
                ("instType".to_owned(), "BROKERAGE".to_owned()),
                ("oauth_verifier".to_owned(), "123456".to_owned()),
            ],
            &reference_credentials(),
            Some(&reference_token()),
        )
        .unwrap();
        assert_eq!(signed.url.query(), Some("instType=BROKERAGE"));
        assert_eq!(signed.oauth_param("oauth_verifier"), Some("123456"));
        assert!(signed.authorization.contains("oauth_verifier=\"123456\""));
        assert!(!signed.authorization.contains("instType"));
    }

    #[test]
    fn fresh_signatures_use_distinct_nonces() {
        let credentials = ConsumerCredentials::new("ck", "cs");
        let first = sign("GET", "https://api.etrade.com/x", &[], &credentials, None).unwrap();
        let second = sign("GET", "https://api.etrade.com/x", &[], &credentials, None).unwrap();
        assert_ne!(
            first.oauth_param("oauth_nonce"),
            second.oauth_param("oauth_nonce")
        );
    }

    #[test]
    fn percent_encoding_follows_rfc3986() {
        assert_eq!(
            percent_encode("Hello Ladies + Gentlemen, a signed OAuth request!"),
            "Hello%20Ladies%20%2B%20Gentlemen%2C%20a%20signed%20OAuth%20request%21"
        );
        assert_eq!(percent_encode("-._~"), "-._~");
    }

    #[test]
    fn malformed_urls_are_rejected() {
        let credentials = ConsumerCredentials::new("ck", "cs");
        assert!(matches!(
            sign("GET", "not a url", &[], &credentials, None).unwrap_err(),
            SigningError::InvalidUrl { .. }
        ));
        assert!(matches!(
            sign("GET", "ftp://example.com/file", &[], &credentials, None).unwrap_err(),
            SigningError::UnsupportedScheme(_)
        ));
    }
}
