//! CGI-style request environment map construction (spec §4.1) and
//! response header folding.

use std::collections::HashMap;

use http::{HeaderMap, HeaderValue};
use serde_json::{Map, Value};

/// Build the JSON environment map sent as the first outbound frame of an
/// exchange, per spec §4.1's construction rules.
///
/// `headers` is iterated in order; `meta` entries are merged last and win
/// over any synthesized key of the same name.
pub fn build_env(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(String, String)],
    meta: &HashMap<String, String>,
) -> Map<String, Value> {
    let mut env = Map::new();

    env.insert("REQUEST_METHOD".into(), Value::String(method.to_owned()));
    env.insert("PATH_INFO".into(), Value::String(path.to_owned()));
    env.insert("QUERY_STRING".into(), Value::String(query.to_owned()));
    env.insert("SCRIPT_NAME".into(), Value::String(String::new()));
    env.insert("REMOTE_ADDR".into(), Value::String("0.0.0.0".into()));
    env.insert("SERVER_ADDR".into(), Value::String("0.0.0.0".into()));

    if let Some((_, host)) = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("host")) {
        if let Some((name, port)) = host.split_once(':') {
            env.insert("SERVER_NAME".into(), Value::String(name.to_owned()));
            env.insert("SERVER_PORT".into(), Value::String(port.to_owned()));
        }
    }

    for (key, value) in headers {
        let cgi_key = cgi_header_key(key);
        env.insert(cgi_key, Value::String(value.clone()));
    }

    for (key, value) in meta {
        env.insert(key.clone(), Value::String(value.clone()));
    }

    env
}

/// Upcase a header name, replace `-` with `_`, and prefix with `HTTP_`
/// unless the result is exactly `CONTENT_TYPE` or `CONTENT_LENGTH`.
fn cgi_header_key(header_name: &str) -> String {
    let upcased: String = header_name
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect();

    if upcased == "CONTENT_TYPE" || upcased == "CONTENT_LENGTH" {
        upcased
    } else {
        format!("HTTP_{}", upcased)
    }
}

/// Fold a response's JSON header map (string -> string, possibly embedding
/// `\n` for repeated header lines) into an [`http::HeaderMap`] with one
/// entry per folded line, per spec §4.1's inbound rules.
pub fn fold_response_headers(raw: &HashMap<String, String>) -> http::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in raw {
        let header_name: http::HeaderName = name.parse()?;
        for line in value.split('\n') {
            headers.append(header_name.clone(), HeaderValue::from_str(line)?);
        }
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_environment_per_spec_scenario_6() {
        let headers = vec![
            ("Host".to_string(), "x:81".to_string()),
            ("Content-Type".to_string(), "t".to_string()),
            ("X-Foo".to_string(), "y".to_string()),
        ];
        let mut meta = HashMap::new();
        meta.insert("REMOTE_ADDR".to_string(), "1.2.3.4".to_string());

        let env = build_env("POST", "/a", "b=1", &headers, &meta);

        assert_eq!(env["REQUEST_METHOD"], "POST");
        assert_eq!(env["PATH_INFO"], "/a");
        assert_eq!(env["QUERY_STRING"], "b=1");
        assert_eq!(env["SERVER_NAME"], "x");
        assert_eq!(env["SERVER_PORT"], "81");
        assert_eq!(env["CONTENT_TYPE"], "t");
        assert_eq!(env["HTTP_X_FOO"], "y");
        assert_eq!(env["REMOTE_ADDR"], "1.2.3.4");
    }

    #[test]
    fn leaves_server_name_and_port_unset_without_host() {
        let env = build_env("GET", "/", "", &[], &HashMap::new());
        assert!(!env.contains_key("SERVER_NAME"));
        assert!(!env.contains_key("SERVER_PORT"));
    }

    #[test]
    fn host_without_colon_is_ignored() {
        let headers = vec![("Host".to_string(), "example".to_string())];
        let env = build_env("GET", "/", "", &headers, &HashMap::new());
        assert!(!env.contains_key("SERVER_NAME"));
    }

    #[test]
    fn meta_wins_over_synthesized_keys() {
        let mut meta = HashMap::new();
        meta.insert("REQUEST_METHOD".to_string(), "OVERRIDDEN".to_string());
        let env = build_env("GET", "/", "", &[], &meta);
        assert_eq!(env["REQUEST_METHOD"], "OVERRIDDEN");
    }

    #[test]
    fn folds_embedded_newlines_into_repeated_header_lines() {
        let mut raw = HashMap::new();
        raw.insert("Set-Cookie".to_string(), "a=1\nb=2".to_string());
        let headers = fold_response_headers(&raw).unwrap();
        let values: Vec<_> = headers.get_all("set-cookie").iter().collect();
        assert_eq!(values.len(), 2);
    }
}
