// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Client configuration
//!
//! Settings come from constructor arguments with environment-variable
//! overrides on top. A configuration that embeds credentials in code is
//! refused unless explicitly allowed or the credentials arrive through the
//! environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::transport::TlsOptions;


/// Default ports per transport
pub mod defaults {
    /// Plain binary API
    pub const API_PORT: u16 = 8728;
    /// Binary API over TLS
    pub const API_TLS_PORT: u16 = 8729;
    /// REST over HTTPS
    pub const REST_PORT: u16 = 443;
}

/// Environment variable names recognized by the client
pub mod env_vars {
    pub const HOST: &str = "MIKROTIK_HOST";
    pub const USER: &str = "MIKROTIK_USER";
    pub const PASS: &str = "MIKROTIK_PASS";
    pub const PORT: &str = "MIKROTIK_PORT";
    pub const PROTOCOL: &str = "MIKROTIK_PROTOCOL";
    /// Secondary socket port reserved for follow-mode streams in hybrid mode
    pub const PORT_APISSL: &str = "MIKROTIK_PORT_APISSL";

    /// The core set whose combined presence marks credentials as
    /// environment-supplied.
    pub const CORE: [&str; 4] = [HOST, USER, PASS, PORT];
}

/// Which transport carries commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Socket,
    Rest,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "socket" => Ok(Self::Socket),
            "rest" => Ok(Self::Rest),
            other => Err(Error::Config(format!(
                "unknown protocol {other:?}, expected \"socket\" or \"rest\""
            ))),
        }
    }
}

/// Configuration for one router client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub username: String,
    pub password: SecretString,
    pub protocol: Protocol,
    /// Primary port; defaults per protocol and TLS mode when unset.
    pub port: Option<u16>,
    /// Secondary socket port for hybrid streaming alongside REST.
    pub stream_port: Option<u16>,
    /// TLS on the binary API socket.
    pub tls: bool,
    pub accept_invalid_certs: bool,
    /// PEM CA bundle for socket TLS verification.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Opt-in for credentials embedded in code.
    pub allow_insecure: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    credentials_from_env: bool,
}

impl ClientConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: SecretString::new(password.into().into_boxed_str()),
            protocol: Protocol::Socket,
            port: None,
            stream_port: None,
            tls: false,
            accept_invalid_certs: false,
            ca_cert_pem: None,
            allow_insecure: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            credentials_from_env: false,
        }
    }

    /// Apply `MIKROTIK_*` environment overrides.
    ///
    /// Expects `dotenvy::dotenv()` to have been called by the application
    /// entry point if a `.env` file is in use.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let vars: HashMap<String, String> = [
            env_vars::HOST,
            env_vars::USER,
            env_vars::PASS,
            env_vars::PORT,
            env_vars::PROTOCOL,
            env_vars::PORT_APISSL,
        ]
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| ((*name).to_string(), v)))
        .collect();
        self.with_overrides(&vars)
    }

    /// Override from an explicit variable map. Used by
    /// [`with_env_overrides`](Self::with_env_overrides) and by tests.
    #[must_use]
    pub fn with_overrides(mut self, vars: &HashMap<String, String>) -> Self {
        if let Some(host) = vars.get(env_vars::HOST) {
            self.host = host.clone();
        }
        if let Some(user) = vars.get(env_vars::USER) {
            self.username = user.clone();
        }
        if let Some(pass) = vars.get(env_vars::PASS) {
            self.password = SecretString::new(pass.clone().into_boxed_str());
        }
        if let Some(port) = vars.get(env_vars::PORT) {
            match port.parse() {
                Ok(port) => self.port = Some(port),
                Err(_) => tracing::warn!("Ignoring unparseable {}={}", env_vars::PORT, port),
            }
        }
        if let Some(protocol) = vars.get(env_vars::PROTOCOL) {
            match protocol.parse() {
                Ok(protocol) => self.protocol = protocol,
                Err(e) => tracing::warn!("Ignoring {}: {}", env_vars::PROTOCOL, e),
            }
        }
        if let Some(port) = vars.get(env_vars::PORT_APISSL) {
            match port.parse() {
                Ok(port) => self.stream_port = Some(port),
                Err(_) => {
                    tracing::warn!("Ignoring unparseable {}={}", env_vars::PORT_APISSL, port);
                }
            }
        }
        self.credentials_from_env = env_vars::CORE.iter().all(|name| vars.contains_key(*name));
        self
    }

    /// Validate the configuration before any connection attempt.
    ///
    /// In-code credentials are refused unless `allow_insecure` is set; a
    /// complete set of core environment variables disables that gate.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("router host is required".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Config("username is required".to_string()));
        }
        let has_hardcoded_credentials =
            !self.password.expose_secret().is_empty() && !self.credentials_from_env;
        if has_hardcoded_credentials && !self.allow_insecure {
            return Err(Error::Config(
                "credentials are hardcoded; set allow_insecure or provide them via \
                 MIKROTIK_* environment variables"
                    .to_string(),
            ));
        }
        if self.tls && self.ca_cert_pem.is_none() && !self.accept_invalid_certs {
            return Err(Error::Config(
                "socket TLS requires a CA bundle or accept_invalid_certs".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective port for the binary API socket.
    #[must_use]
    pub fn socket_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls {
            defaults::API_TLS_PORT
        } else {
            defaults::API_PORT
        })
    }

    /// Effective port for the REST interface.
    #[must_use]
    pub fn rest_port(&self) -> u16 {
        self.port.unwrap_or(defaults::REST_PORT)
    }

    /// Port of the hybrid streaming side-channel, when configured.
    #[must_use]
    pub fn hybrid_stream_port(&self) -> Option<u16> {
        self.stream_port
    }

    /// Trust options for socket TLS.
    #[must_use]
    pub fn tls_options(&self) -> TlsOptions {
        if !self.tls {
            return TlsOptions::Disabled;
        }
        if let Some(pem) = &self.ca_cert_pem {
            return TlsOptions::CaBundle(pem.clone());
        }
        TlsOptions::AcceptInvalid
    }
}
