// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! REST transport
//!
//! Maps the command-path vocabulary of the binary API onto the RouterOS
//! REST interface: `/print` becomes GET (or POST with a query body),
//! `/add`/`/set`/`/remove` become PUT/PATCH/DELETE, anything else POSTs to
//! the full path. Authentication is HTTP Basic; every successful response
//! is normalized to a list of string-valued rows.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::Row;

/// Attribute set on rows returned through idempotency recovery, so callers
/// can distinguish "already existed" from "just created".
pub const RECOVERED_MARKER: &str = ".recovered";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
}

/// One planned HTTP exchange, before any I/O.
#[derive(Debug, PartialEq)]
struct RestPlan {
    method: Method,
    /// Path under `/rest`, including any `.id` segment.
    path: String,
    body: Option<Value>,
}

pub struct RestTransport {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: SecretString,
    timeout: Duration,
}

impl RestTransport {
    pub fn new(config: &RestConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;
        let base_url = Url::parse(&format!("https://{}:{}", config.host, config.port))
            .map_err(|e| Error::Config(format!("invalid REST endpoint: {e}")))?;
        Ok(Self {
            http,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.timeout,
        })
    }

    /// Distinguish a blown deadline from other transport failures.
    fn transport_error(&self, e: reqwest::Error, command: &str) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                operation: command.to_string(),
                elapsed: self.timeout,
            }
        } else {
            Error::Http(e)
        }
    }

    /// Execute one command. With `idempotency_key` set, a duplicate error on
    /// a create is recovered by querying the existing object back.
    pub async fn execute(
        &self,
        command: &str,
        params: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Row>> {
        match self.dispatch(command, params).await {
            Ok(rows) => Ok(rows),
            Err(e) if e.is_duplicate() && idempotency_key.is_some() => {
                let key = idempotency_key.unwrap_or("name");
                tracing::debug!("Duplicate on {}, recovering via {}", command, key);
                self.recover_existing(command, params, key).await
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&self, command: &str, params: &[(String, String)]) -> Result<Vec<Row>> {
        let plan = plan_request(command, params)?;
        let url = self.rest_url(&plan.path)?;
        tracing::debug!("{} {}", plan.method, url);

        let mut request = self
            .http
            .request(plan.method, url)
            .basic_auth(&self.username, Some(self.password.expose_secret()));
        if let Some(body) = &plan.body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e, command))?;
        self.parse_response(response, command).await
    }

    /// Fetch the object a duplicate error collided with:
    /// `GET <menu-path>?<key>=<value>`. The returned row carries the
    /// recovery marker.
    async fn recover_existing(
        &self,
        command: &str,
        params: &[(String, String)],
        key: &str,
    ) -> Result<Vec<Row>> {
        let menu_path = command.strip_suffix("/add").unwrap_or(command);
        let value = params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::IdempotencyLost {
                key: key.to_string(),
                value: String::new(),
            })?;

        let mut url = self.rest_url(menu_path)?;
        url.query_pairs_mut().append_pair(key, &value);

        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|e| self.transport_error(e, command))?;
        let rows = self.parse_response(response, command).await?;

        let Some(mut row) = rows.into_iter().next() else {
            return Err(Error::IdempotencyLost {
                key: key.to_string(),
                value,
            });
        };
        row.insert(RECOVERED_MARKER.to_string(), "true".to_string());
        Ok(vec![row])
    }

    fn rest_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(&format!("/rest{path}"))
            .map_err(|e| Error::Config(format!("invalid REST path {path:?}: {e}")))
    }

    async fn parse_response(
        &self,
        response: reqwest::Response,
        command: &str,
    ) -> Result<Vec<Row>> {
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let body = response.text().await?;
        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Vec::new());
            }
            let value: Value = serde_json::from_str(&body).map_err(|e| {
                Error::Protocol(format!("unparseable REST body for {command}: {e}"))
            })?;
            return Ok(rows_from_json(value));
        }
        Err(error_from_body(status.as_u16(), &body, command))
    }
}

/// Translate one command into its HTTP exchange.
fn plan_request(command: &str, params: &[(String, String)]) -> Result<RestPlan> {
    if let Some(path) = command.strip_suffix("/print") {
        if params.is_empty() {
            return Ok(RestPlan {
                method: Method::GET,
                path: path.to_string(),
                body: None,
            });
        }
        return Ok(RestPlan {
            method: Method::POST,
            path: format!("{path}/print"),
            body: Some(print_body(params)?),
        });
    }
    if let Some(path) = command.strip_suffix("/add") {
        return Ok(RestPlan {
            method: Method::PUT,
            path: path.to_string(),
            body: Some(params_object(params, None)),
        });
    }
    if let Some(path) = command.strip_suffix("/set") {
        let id = require_id(command, params)?;
        return Ok(RestPlan {
            method: Method::PATCH,
            path: format!("{path}/{id}"),
            body: Some(params_object(params, Some(".id"))),
        });
    }
    if let Some(path) = command.strip_suffix("/remove") {
        let id = require_id(command, params)?;
        return Ok(RestPlan {
            method: Method::DELETE,
            path: format!("{path}/{id}"),
            body: None,
        });
    }
    Ok(RestPlan {
        method: Method::POST,
        path: command.to_string(),
        body: Some(params_object(params, None)),
    })
}

/// Body for a filtered print: `.proplist` array plus `.query` words.
///
/// Query values may not contain `=`: the RouterOS `.query` array gives no
/// way to escape it, so such filters are refused up front.
fn print_body(params: &[(String, String)]) -> Result<Value> {
    let mut body = Map::new();
    let mut query = Vec::new();
    for (key, value) in params {
        if let Some(field) = key.strip_prefix('?') {
            if value.contains('=') {
                return Err(Error::Config(format!(
                    "query value for {field:?} contains '=', which cannot be escaped"
                )));
            }
            query.push(Value::String(format!("{field}={value}")));
        } else if key == ".proplist" {
            let props: Vec<Value> = value
                .split(',')
                .map(|p| Value::String(p.to_string()))
                .collect();
            body.insert(".proplist".to_string(), Value::Array(props));
        } else {
            body.insert(key.clone(), Value::String(value.clone()));
        }
    }
    if !query.is_empty() {
        body.insert(".query".to_string(), Value::Array(query));
    }
    Ok(Value::Object(body))
}

fn params_object(params: &[(String, String)], skip: Option<&str>) -> Value {
    let mut body = Map::new();
    for (key, value) in params {
        if Some(key.as_str()) == skip {
            continue;
        }
        body.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(body)
}

fn require_id<'p>(command: &str, params: &'p [(String, String)]) -> Result<&'p str> {
    params
        .iter()
        .find(|(k, _)| k == ".id")
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| Error::Config(format!("{command} requires an .id parameter")))
}

/// Normalize a REST payload: array of objects, or a single object, into
/// string-valued rows.
fn rows_from_json(value: Value) -> Vec<Row> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(row_from_json).collect(),
        object @ Value::Object(_) => row_from_json(object).map_or_else(Vec::new, |r| vec![r]),
        _ => Vec::new(),
    }
}

fn row_from_json(value: Value) -> Option<Row> {
    let Value::Object(map) = value else {
        return None;
    };
    Some(
        map.into_iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, text)
            })
            .collect(),
    )
}

/// Parse a non-2xx body (JSON preferred, raw text fallback) into a typed
/// router error.
fn error_from_body(status: u16, body: &str, command: &str) -> Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["detail", "message", "error"]
                .iter()
                .find_map(|f| v.get(f).and_then(Value::as_str).map(String::from))
        })
        .unwrap_or_else(|| body.trim().to_string());
    Error::Router {
        detail,
        status: Some(status),
        command: Some(command.to_string()),
        raw: Some(body.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_print_without_params_is_get() {
        let plan = plan_request("/ip/address/print", &[]).unwrap();
        assert_eq!(plan.method, Method::GET);
        assert_eq!(plan.path, "/ip/address");
        assert!(plan.body.is_none());
    }

    #[test]
    fn test_print_with_params_is_post() {
        let plan = plan_request(
            "/ip/address/print",
            &params(&[("?interface", "ether1"), (".proplist", ".id,address")]),
        )
        .unwrap();
        assert_eq!(plan.method, Method::POST);
        assert_eq!(plan.path, "/ip/address/print");
        assert_eq!(
            plan.body.unwrap(),
            json!({
                ".proplist": [".id", "address"],
                ".query": ["interface=ether1"],
            })
        );
    }

    #[test]
    fn test_query_value_with_equals_rejected() {
        let err =
            plan_request("/ip/address/print", &params(&[("?comment", "a=b")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_add_is_put() {
        let plan = plan_request(
            "/ip/address/add",
            &params(&[("address", "10.0.0.1/24"), ("interface", "ether1")]),
        )
        .unwrap();
        assert_eq!(plan.method, Method::PUT);
        assert_eq!(plan.path, "/ip/address");
        assert_eq!(
            plan.body.unwrap(),
            json!({"address": "10.0.0.1/24", "interface": "ether1"})
        );
    }

    #[test]
    fn test_set_patches_by_id_without_id_in_body() {
        let plan = plan_request(
            "/ip/address/set",
            &params(&[(".id", "*1A"), ("comment", "uplink")]),
        )
        .unwrap();
        assert_eq!(plan.method, Method::PATCH);
        assert_eq!(plan.path, "/ip/address/*1A");
        assert_eq!(plan.body.unwrap(), json!({"comment": "uplink"}));
    }

    #[test]
    fn test_set_without_id_fails() {
        let err = plan_request("/ip/address/set", &params(&[("comment", "x")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_remove_is_delete() {
        let plan = plan_request("/ip/address/remove", &params(&[(".id", "*1A")])).unwrap();
        assert_eq!(plan.method, Method::DELETE);
        assert_eq!(plan.path, "/ip/address/*1A");
        assert!(plan.body.is_none());
    }

    #[test]
    fn test_other_commands_post_to_full_path() {
        let plan = plan_request("/system/reboot", &[]).unwrap();
        assert_eq!(plan.method, Method::POST);
        assert_eq!(plan.path, "/system/reboot");
        assert_eq!(plan.body.unwrap(), json!({}));
    }

    #[test]
    fn test_rows_from_single_object() {
        let rows = rows_from_json(json!({"name": "ether1", "mtu": 1500, "running": true}));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").map(String::as_str), Some("ether1"));
        assert_eq!(rows[0].get("mtu").map(String::as_str), Some("1500"));
        assert_eq!(rows[0].get("running").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_rows_from_array() {
        let rows = rows_from_json(json!([{"name": "a"}, {"name": "b"}]));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_error_from_json_body() {
        let err = error_from_body(
            400,
            r#"{"detail": "failure: already have such address", "error": 400}"#,
            "/ip/address/add",
        );
        assert!(err.is_duplicate());
        match err {
            Error::Router { detail, status, command, raw } => {
                assert_eq!(detail, "failure: already have such address");
                assert_eq!(status, Some(400));
                assert_eq!(command.as_deref(), Some("/ip/address/add"));
                assert!(raw.is_some());
            }
            other => panic!("expected Router, got {other:?}"),
        }
    }

    #[test]
    fn test_error_from_plain_text_body() {
        let err = error_from_body(503, "service unavailable", "/ip/address/print");
        assert!(err.is_retryable());
        match err {
            Error::Router { detail, .. } => assert_eq!(detail, "service unavailable"),
            other => panic!("expected Router, got {other:?}"),
        }
    }
}
