//! SASL handshake engine
//!
//! First use of a socket runs LIST -> AUTH -> STEP -> SelectBucket.
//! SCRAM-SHA1 is the preferred mechanism with PLAIN as the fallback when
//! the server only advertises that.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;

use crate::client::connection::{ConnState, Connection};
use crate::protocol::{Frame, Opcode, Status};
use crate::utils::crypto::{hmac_sha1, pbkdf2_hmac_sha1, sha1};
use crate::utils::error::{AuthError, McError};

/// Bucket credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Runs the full first-use handshake on a fresh connection, leaving it in
/// the `Ready` state. Any failure closes the socket.
pub(crate) fn authenticate(
    conn: &mut Connection,
    creds: &Credentials,
    bucket: &str,
) -> Result<(), McError> {
    let result = run_handshake(conn, creds, bucket);
    match result {
        Ok(()) => {
            conn.set_state(ConnState::Ready);
            Ok(())
        }
        Err(e) => {
            conn.set_state(ConnState::Closed);
            Err(e)
        }
    }
}

fn run_handshake(conn: &mut Connection, creds: &Credentials, bucket: &str) -> Result<(), McError> {
    let mechanisms = sasl_list(conn)?;
    conn.set_state(ConnState::SaslListed);

    if mechanisms.contains("SCRAM-SHA1") {
        scram_sha1(conn, creds)?;
    } else if mechanisms.contains("PLAIN") {
        plain(conn, creds)?;
    } else {
        return Err(AuthError::NoSupportedMechanism(mechanisms).into());
    }

    select_bucket(conn, creds, bucket)?;
    debug!(peer = conn.peer(), bucket, "handshake complete");
    Ok(())
}

/// Lists the server's SASL mechanisms (space- or newline-separated).
fn sasl_list(conn: &mut Connection) -> Result<String, McError> {
    let response = conn.roundtrip(&Frame::request(Opcode::SaslList))?;
    if !response.status().is_success() {
        return Err(AuthError::Rejected {
            mechanism: "LIST".to_string(),
            message: String::from_utf8_lossy(&response.value).into_owned(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&response.value).into_owned())
}

/// SASL PLAIN: `user \0 pass \0`.
fn plain(conn: &mut Connection, creds: &Credentials) -> Result<(), McError> {
    let mut payload = Vec::with_capacity(creds.username.len() + creds.password.len() + 2);
    payload.extend_from_slice(creds.username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(creds.password.as_bytes());
    payload.push(0);

    let request = Frame::request(Opcode::SaslAuth)
        .with_key("PLAIN")
        .with_value(payload);
    let response = conn.roundtrip(&request)?;
    if !response.status().is_success() {
        return Err(AuthError::Rejected {
            mechanism: "PLAIN".to_string(),
            message: String::from_utf8_lossy(&response.value).into_owned(),
        }
        .into());
    }
    conn.set_state(ConnState::SaslAuthed);
    Ok(())
}

fn scram_sha1(conn: &mut Connection, creds: &Credentials) -> Result<(), McError> {
    let scram = ScramSha1::new(&creds.username, &creds.password);

    let request = Frame::request(Opcode::SaslAuth)
        .with_key("SCRAM-SHA1")
        .with_value(scram.client_first_message());
    let response = conn.roundtrip(&request)?;
    if response.status() != Status::AUTH_CONTINUE {
        return Err(AuthError::Rejected {
            mechanism: "SCRAM-SHA1".to_string(),
            message: String::from_utf8_lossy(&response.value).into_owned(),
        }
        .into());
    }
    conn.set_state(ConnState::SaslAuthed);

    let challenge = String::from_utf8_lossy(&response.value).into_owned();
    let (client_final, server_signature) = scram.final_message(&challenge)?;

    let request = Frame::request(Opcode::SaslStep)
        .with_key("SCRAM-SHA1")
        .with_value(client_final);
    let response = conn.roundtrip(&request)?;
    if !response.status().is_success() {
        return Err(AuthError::Rejected {
            mechanism: "SCRAM-SHA1".to_string(),
            message: String::from_utf8_lossy(&response.value).into_owned(),
        }
        .into());
    }

    // The step response carries v=<base64(server signature)>; a mismatch
    // means the server never knew the password.
    let step_body = String::from_utf8_lossy(&response.value).into_owned();
    let verifier = scram_field(&step_body, 'v')
        .ok_or_else(|| AuthError::BadChallenge("step response has no v= field".to_string()))?;
    if verifier != server_signature {
        return Err(AuthError::BadServerSignature.into());
    }

    conn.set_state(ConnState::SaslStepped);
    Ok(())
}

/// Selects the bucket on an authenticated socket. Skipped when the bucket
/// name equals the username (SASL-per-bucket shortcut).
fn select_bucket(conn: &mut Connection, creds: &Credentials, bucket: &str) -> Result<(), McError> {
    if bucket == creds.username {
        return Ok(());
    }

    let request = Frame::request(Opcode::SelectBucket).with_key(bucket);
    let response = conn.roundtrip(&request)?;
    if !response.status().is_success() {
        return Err(AuthError::SelectBucketFailed {
            bucket: bucket.to_string(),
            message: String::from_utf8_lossy(&response.value).into_owned(),
        }
        .into());
    }
    Ok(())
}

/// Pure SCRAM-SHA1 computation, separated from socket I/O.
pub(crate) struct ScramSha1 {
    client_first_bare: String,
    password: String,
}

impl ScramSha1 {
    pub(crate) fn new(username: &str, password: &str) -> Self {
        Self::with_nonce(username, password, &generate_nonce())
    }

    /// Test seam: fixed nonce.
    pub(crate) fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        let client_first_bare = format!("n={},r={}", escape_username(username), nonce);
        Self {
            client_first_bare,
            password: password.to_string(),
        }
    }

    /// `client-first-message` including the GS2 header.
    pub(crate) fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Computes the client-final message for a server challenge, plus the
    /// base64 server signature the step response must echo.
    pub(crate) fn final_message(&self, challenge: &str) -> Result<(String, String), AuthError> {
        let server_nonce = scram_field(challenge, 'r')
            .ok_or_else(|| AuthError::BadChallenge(format!("missing r= in {challenge:?}")))?;
        let salt_b64 = scram_field(challenge, 's')
            .ok_or_else(|| AuthError::BadChallenge(format!("missing s= in {challenge:?}")))?;
        let iterations: u32 = scram_field(challenge, 'i')
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| AuthError::BadChallenge(format!("missing i= in {challenge:?}")))?;

        let salt = BASE64
            .decode(salt_b64.as_bytes())
            .map_err(|e| AuthError::BadChallenge(format!("bad salt: {e}")))?;

        let salted_password = pbkdf2_hmac_sha1(self.password.as_bytes(), &salt, iterations, 20);
        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = sha1(&client_key);

        let client_final_bare = format!("c=biws,r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, challenge, client_final_bare
        );

        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        let server_key = hmac_sha1(&salted_password, b"Server Key");
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes());

        Ok((
            format!("{client_final_bare},p={}", BASE64.encode(proof)),
            BASE64.encode(server_signature),
        ))
    }
}

/// SCRAM attribute escaping: `=` -> `=3D`, `,` -> `=2C`.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// base64 of a random 12-digit string.
fn generate_nonce() -> String {
    let digits: String = (0..12).map(|_| fastrand::digit(10)).collect();
    BASE64.encode(digits.as_bytes())
}

/// Extracts `<attr>=<value>` from a comma-separated SCRAM message.
fn scram_field(message: &str, attr: char) -> Option<String> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        (chars.next() == Some(attr) && chars.next() == Some('='))
            .then(|| part[2..].to_string())
    })
}
