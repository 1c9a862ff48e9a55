// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Wire transports: binary API socket and REST over HTTPS

mod rest;
mod socket;
mod tls;

pub use rest::{RestConfig, RestTransport, RECOVERED_MARKER};
pub use socket::{SocketConfig, SocketEvent, SocketTransport};
pub use tls::TlsOptions;
