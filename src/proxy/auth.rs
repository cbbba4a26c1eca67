//! Proxy-Authorization parsing
//!
//! Clients select backends by offering template variables in the username of
//! their Basic credentials: `k1=v1,k2=v2,tag`. The password is ignored.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHORIZATION};
use tracing::debug;

use crate::error::{FailoverError, Result};
use crate::proxy::template::Variables;

const BASIC_PREFIX: &str = "Basic ";

/// Extract the template variables offered by the client.
///
/// A missing header or a non-Basic scheme yields no variables. Credentials
/// that fail to decode are an error; they must abort the request rather than
/// silently select the variable-free backends.
pub fn extract_variables(headers: &HeaderMap) -> Result<Variables> {
    let Some(value) = headers.get(PROXY_AUTHORIZATION) else {
        return Ok(Variables::new());
    };
    parse_credentials(value)
}

fn parse_credentials(value: &HeaderValue) -> Result<Variables> {
    let raw = value.as_bytes();
    if raw.len() < BASIC_PREFIX.len()
        || !raw[..BASIC_PREFIX.len()].eq_ignore_ascii_case(BASIC_PREFIX.as_bytes())
    {
        debug!("Ignoring non-Basic proxy credentials");
        return Ok(Variables::new());
    }

    let decoded = BASE64
        .decode(&raw[BASIC_PREFIX.len()..])
        .map_err(|e| FailoverError::MalformedCredentials(e.to_string()))?;
    let credentials = String::from_utf8(decoded)
        .map_err(|e| FailoverError::MalformedCredentials(e.to_string()))?;

    let username = match credentials.split_once(':') {
        Some((user, _password)) => user,
        None => credentials.as_str(),
    };

    Ok(parse_variable_list(username))
}

/// Parse `k1=v1,k2=v2,tag` into a variable map; a bare tag maps to "".
pub fn parse_variable_list(list: &str) -> Variables {
    list.split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Build a `Basic` header value from a username and password
pub fn basic_credentials(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    format!("{}{}", BASIC_PREFIX, BASE64.encode(credentials.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(auth_value) = auth {
            headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(auth_value).unwrap());
        }
        headers
    }

    #[test]
    fn test_missing_header_yields_no_variables() {
        let vars = extract_variables(&headers_with_auth(None)).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn test_non_basic_scheme_yields_no_variables() {
        let vars = extract_variables(&headers_with_auth(Some("Bearer token123"))).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn test_key_values_and_tags() {
        let credentials = BASE64.encode(b"country=jp,session=42,premium:ignored");
        let vars = extract_variables(&headers_with_auth(Some(&format!("Basic {}", credentials))))
            .unwrap();

        assert_eq!(vars.len(), 3);
        assert_eq!(vars["country"], "jp");
        assert_eq!(vars["session"], "42");
        assert_eq!(vars["premium"], "");
        assert!(!vars.values().any(|v| v == "ignored"));
    }

    #[test]
    fn test_password_never_becomes_a_variable() {
        let credentials = BASE64.encode(b"foo:bar=baz,qux");
        let vars = extract_variables(&headers_with_auth(Some(&format!("Basic {}", credentials))))
            .unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["foo"], "");
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let credentials = BASE64.encode(b"tag");
        let vars = extract_variables(&headers_with_auth(Some(&format!("bAsIc {}", credentials))))
            .unwrap();
        assert!(vars.contains_key("tag"));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let vars = parse_variable_list("token=a=b");
        assert_eq!(vars["token"], "a=b");
    }

    #[test]
    fn test_malformed_base64_is_an_error() {
        let err = extract_variables(&headers_with_auth(Some("Basic !!!not-base64"))).unwrap_err();
        assert!(matches!(err, FailoverError::MalformedCredentials(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_basic_credentials_round_trip() {
        let header = basic_credentials("proxy1", "s3cret");
        assert_eq!(header, format!("Basic {}", BASE64.encode(b"proxy1:s3cret")));
    }
}
