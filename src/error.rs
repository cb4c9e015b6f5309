//! Crate-wide error type.
//!
//! Every fallible core operation returns [`ProxyError`]. Variants line up with
//! the error kinds the proxy distinguishes: a `Config` error aborts startup,
//! the rest are caught at the dispatcher and turned into an LDAP result code
//! instead of tearing down the listener.

use ldap3_server::proto::LdapResultCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend {address} unavailable: {reason}")]
    BackendUnavailable { address: String, reason: String },

    #[error("backend returned error code {code:?}: {text}")]
    BackendProtocol { code: LdapResultCode, text: String },

    #[error("filter rewrite failed: {0}")]
    FilterRewrite(String),

    #[error("request abandoned")]
    Abandoned,

    #[error("paging control already present with a conflicting page size")]
    PagingMisuse,
}

impl ProxyError {
    /// Maps this error to the LDAP result code the dispatcher sends to the
    /// downstream client. `Abandoned` has no response: the caller must check
    /// for it and suppress the reply entirely.
    pub fn to_result_code(&self) -> LdapResultCode {
        match self {
            ProxyError::Config(_) => LdapResultCode::Other,
            ProxyError::BackendUnavailable { .. } => LdapResultCode::Unavailable,
            ProxyError::BackendProtocol { code, .. } => code.clone(),
            ProxyError::FilterRewrite(_) => LdapResultCode::UnwillingToPerform,
            ProxyError::Abandoned => LdapResultCode::Other,
            ProxyError::PagingMisuse => LdapResultCode::ProtocolError,
        }
    }
}

/// Translates a raw RFC 4511 result code, as returned by the upstream client
/// library (which represents it as a bare `u32`), into the downstream wire
/// library's typed `LdapResultCode`. Codes the proxy never otherwise produces
/// still round-trip correctly since the match is exhaustive over the standard
/// table and falls back to `Other`.
pub fn result_code_from_u32(rc: u32) -> LdapResultCode {
    match rc {
        0 => LdapResultCode::Success,
        1 => LdapResultCode::OperationsError,
        2 => LdapResultCode::ProtocolError,
        3 => LdapResultCode::TimeLimitExceeded,
        4 => LdapResultCode::SizeLimitExceeded,
        7 => LdapResultCode::AuthMethodNotSupported,
        8 => LdapResultCode::StrongerAuthRequired,
        11 => LdapResultCode::AdminLimitExceeded,
        12 => LdapResultCode::UnavailableCriticalExtension,
        13 => LdapResultCode::ConfidentialityRequired,
        16 => LdapResultCode::NoSuchAttribute,
        17 => LdapResultCode::UndefinedAttributeType,
        18 => LdapResultCode::InappropriateMatching,
        19 => LdapResultCode::ConstraintViolation,
        20 => LdapResultCode::AttributeOrValueExists,
        21 => LdapResultCode::InvalidAttributeSyntax,
        32 => LdapResultCode::NoSuchObject,
        34 => LdapResultCode::InvalidDNSyntax,
        48 => LdapResultCode::InappropriateAuthentication,
        49 => LdapResultCode::InvalidCredentials,
        50 => LdapResultCode::InsufficientAccessRights,
        51 => LdapResultCode::Busy,
        52 => LdapResultCode::Unavailable,
        53 => LdapResultCode::UnwillingToPerform,
        68 => LdapResultCode::EntryAlreadyExists,
        80 => LdapResultCode::Other,
        _ => LdapResultCode::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_code_falls_back_to_other() {
        assert!(matches!(result_code_from_u32(9999), LdapResultCode::Other));
    }

    #[test]
    fn invalid_credentials_round_trips() {
        assert!(matches!(
            result_code_from_u32(49),
            LdapResultCode::InvalidCredentials
        ));
    }

    #[test]
    fn filter_rewrite_maps_to_unwilling_to_perform() {
        let err = ProxyError::FilterRewrite("boom".into());
        assert!(matches!(
            err.to_result_code(),
            LdapResultCode::UnwillingToPerform
        ));
    }
}
