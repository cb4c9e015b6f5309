//! Low-level upstream connection helpers shared by the session binder and
//! the filter rewriter's membership walks.

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings};
use std::time::Duration;

use crate::error::ProxyError;

/// Dials `address` and hands back a driven `Ldap` handle. The connection's
/// background I/O task is spawned via `ldap3::drive!`, as the upstream crate
/// expects; dropping the returned handle (and its clones) ends that task.
pub async fn dial(address: &str, timeout: Duration) -> Result<Ldap, ProxyError> {
    let url = format!("ldap://{address}");
    let (conn, ldap) = LdapConnAsync::with_settings(
        LdapConnSettings::new().set_conn_timeout(timeout),
        &url,
    )
    .await
    .map_err(|e| ProxyError::BackendUnavailable {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    ldap3::drive!(conn);
    Ok(ldap)
}

/// Extracts the raw RFC 4511 result code from an upstream error, where
/// possible. The upstream client represents a completed-but-unsuccessful
/// operation as an `LdapError` wrapping the operation's `LdapResult` (whose
/// `rc` field is the code); transport-level errors (`Io`, `Url`, ...) have no
/// associated code and yield `None`, which callers treat as
/// `BackendUnavailable` rather than a specific protocol error.
pub fn result_code(err: &ldap3::LdapError) -> Option<u32> {
    match err {
        ldap3::LdapError::LdapResult { result } => Some(result.rc),
        _ => None,
    }
}

/// Classifies an upstream client error as either a protocol-level failure
/// (the backend answered, just not successfully) or backend unavailability
/// (nothing usable came back at all), for callers that need to turn an
/// arbitrary `ldap3::LdapError` into a `ProxyError` without duplicating the
/// `result_code` dance.
pub fn classify_error(address: &str, err: ldap3::LdapError) -> ProxyError {
    match result_code(&err) {
        Some(rc) => ProxyError::BackendProtocol {
            code: crate::error::result_code_from_u32(rc),
            text: err.to_string(),
        },
        None => ProxyError::BackendUnavailable {
            address: address.to_string(),
            reason: err.to_string(),
        },
    }
}
