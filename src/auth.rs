// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! RouterOS authentication helpers
//!
//! Modern logins (6.43+) send the password in clear over the encrypted
//! channel. Pre-6.43 routers answer the bare `/login` with a hex challenge
//! in `ret`; the client replies with `00` followed by the MD5 of
//! `0x00 || password || challenge`.

use md5::compute as md5_compute;

use crate::error::{Error, Result};

/// Compute the legacy challenge response word value.
///
/// The challenge must be a non-empty hexadecimal string. The intermediate
/// buffer holding the password bytes is zeroed before returning.
pub fn legacy_response(password: &str, challenge_hex: &str) -> Result<String> {
    if challenge_hex.is_empty() {
        return Err(Error::Auth("empty login challenge".to_string()));
    }
    if !challenge_hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Auth(format!(
            "challenge is not hexadecimal: {challenge_hex:?}"
        )));
    }
    let challenge = hex::decode(challenge_hex)
        .map_err(|e| Error::Auth(format!("undecodable challenge: {e}")))?;

    let mut data = Vec::with_capacity(1 + password.len() + challenge.len());
    data.push(0u8);
    data.extend_from_slice(password.as_bytes());
    data.extend_from_slice(&challenge);
    let digest = md5_compute(&data);
    data.fill(0);

    let mut response = String::from("00");
    response.push_str(&hex::encode(digest.0));
    Ok(response)
}
