//! Data source token extension
//!
//! A data source's JWS token is renewed by writing the record back with a
//! new nonce. The write must repeat the audience, subject and schema, which
//! are recovered from the current token's claims (read without signature
//! verification) and fall back to the record's own fields.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::json;
use token_lifecycle::{AuthenticatedClient, DownstreamRequest};
use tracing::{info, warn};

use crate::error::Error;

/// Result of a successful extension.
#[derive(Debug, Clone)]
pub struct Extension {
    pub nonce: String,
    /// `tokenExpiryTime` as reported by the API
    pub token_expiry: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DataSourceRecord {
    jws_token: Option<String>,
    audience: Option<String>,
    subject: Option<String>,
    schema_id: Option<String>,
    url: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Claims {
    aud: Option<String>,
    sub: Option<String>,
    #[serde(rename = "com.cisco.datasource.schema.uuid")]
    schema_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    token_expiry_time: Option<String>,
}

/// Extend the token of data source `id` to `lifetime_minutes` from now.
pub async fn extend(
    client: &mut AuthenticatedClient<'_>,
    id: &str,
    lifetime_minutes: u32,
) -> Result<Extension, Error> {
    let path = format!("/v1/dataSources/{id}");

    let response = client.call(&DownstreamRequest::get(&path)).await?;
    if !response.is_success() {
        return Err(Error::data_source(
            id,
            Some(response.status),
            format!("failed to retrieve data source: {}", response.body),
        ));
    }
    let record: DataSourceRecord = response.json().map_err(|e| {
        Error::data_source(id, Some(response.status), format!("invalid data source record: {e}"))
    })?;

    let claims = record
        .jws_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .and_then(|token| match decode_claims(token) {
            Ok(claims) => Some(claims),
            Err(reason) => {
                warn!(
                    data_source_id = id,
                    reason = %reason,
                    "could not decode data source token claims"
                );
                None
            }
        })
        .unwrap_or_default();

    let audience = non_empty(claims.aud).or(non_empty(record.audience));
    let schema_id = non_empty(claims.schema_uuid).or(non_empty(record.schema_id));
    let url = non_empty(record.url);
    let subject = non_empty(claims.sub)
        .or(non_empty(record.subject))
        .unwrap_or_else(|| "subject".to_string());

    let mut missing = Vec::new();
    if audience.is_none() {
        missing.push("audience");
    }
    if schema_id.is_none() {
        missing.push("schemaId");
    }
    if url.is_none() {
        missing.push("url");
    }
    if !missing.is_empty() {
        return Err(Error::data_source(
            id,
            None,
            format!("missing required fields: {}", missing.join(", ")),
        ));
    }

    let nonce = uuid::Uuid::new_v4().to_string();
    let update = json!({
        "audience": audience,
        "nonce": nonce,
        "schemaId": schema_id,
        "subject": subject,
        "url": url,
        "tokenLifetimeMinutes": lifetime_minutes,
        "status": record.status.unwrap_or_else(|| "active".to_string()),
    });

    let response = client.call(&DownstreamRequest::put(&path, update)).await?;
    if !response.is_success() {
        return Err(Error::data_source(
            id,
            Some(response.status),
            format!("failed to update data source: {}", response.body),
        ));
    }
    let token_expiry = response
        .json::<UpdateResponse>()
        .ok()
        .and_then(|r| r.token_expiry_time);

    info!(
        data_source_id = id,
        nonce = %nonce,
        token_expiry = token_expiry.as_deref().unwrap_or("unknown"),
        lifetime_minutes,
        "data source token extended"
    );
    Ok(Extension {
        nonce,
        token_expiry,
    })
}

/// Read the payload claims of a compact JWS without verifying it.
fn decode_claims(token: &str) -> Result<Claims, String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| "token is not a compact JWS".to_string())?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| format!("invalid base64 payload: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid claims JSON: {e}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
