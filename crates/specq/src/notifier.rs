//! Fire-and-forget webhook delivery.
//!
//! Filters by a declared event allow-list, runs on a spawned background
//! thread so the pipeline loop never blocks on webhook I/O, and swallows
//! every transport error — a notification must never abort a change.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNATURE_HEADER: &str = "X-Specq-Signature-256";

/// Static webhook delivery settings, cheap to clone onto a spawned thread.
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
    pub events: Vec<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub event: String,
    pub change_id: String,
    pub title: String,
    pub status: String,
    pub retry_count: u32,
}

/// Dispatches one webhook call in the background. A no-op when the
/// config has no URL or the event isn't in the allow-list.
pub fn notify(config: &NotifierConfig, payload: NotificationPayload) {
    let Some(url) = config.webhook_url.clone() else {
        return;
    };
    if !config.events.iter().any(|e| e == &payload.event) {
        return;
    }
    let secret = config.secret.clone();

    std::thread::spawn(move || {
        let _ = deliver(&url, &payload, secret.as_deref());
    });
}

fn deliver(url: &str, payload: &NotificationPayload, secret: Option<&str>) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    let client = reqwest::blocking::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let mut request = client.post(url).header("Content-Type", "application/json");

    if let Some(secret) = secret {
        request = request.header(SIGNATURE_HEADER, sign(secret, &body));
    }

    request.body(body).send()?;
    Ok(())
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
