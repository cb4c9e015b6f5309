//! Per-client session state and the session binder.
//!
//! One [`ClientSession`] exists per accepted downstream connection. It pins
//! at most one upstream connection for the session's lifetime, dialed lazily
//! on first use and re-bound (never re-dialed) on every successful `Bind`.

use std::time::Duration;

use ldap3::Ldap;
use ldap3_server::proto::LdapResultCode;
use log::info;

use crate::error::{result_code_from_u32, ProxyError};
use crate::router::Router;
use crate::upstream;

/// State the protocol layer's per-connection context owns for the life of
/// one client.
#[derive(Default)]
pub struct ClientSession {
    pub authenticated_dn: String,
    upstream: Option<Ldap>,
    upstream_address: Option<String>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        !self.authenticated_dn.is_empty()
    }

    pub fn upstream_address(&self) -> &str {
        self.upstream_address.as_deref().unwrap_or("<unknown>")
    }
}

pub struct SessionBinder {
    router: Router,
    /// Shared by dial and bind round-trips: both use the same configured
    /// timeout value.
    timeout: Duration,
}

impl SessionBinder {
    pub fn new(router: Router, timeout: Duration) -> Self {
        SessionBinder { router, timeout }
    }

    /// Returns the session's existing upstream connection, or dials a new
    /// one (chosen by `Router::lookup(dn)`) and attaches it to the session.
    pub async fn get_upstream<'s>(
        &self,
        session: &'s mut ClientSession,
        dn: &str,
    ) -> Result<&'s mut Ldap, ProxyError> {
        if session.upstream.is_none() {
            let address = self.router.lookup(dn).to_string();
            let ldap = upstream::dial(&address, self.timeout).await?;
            session.upstream = Some(ldap);
            session.upstream_address = Some(address);
        }
        Ok(session.upstream.as_mut().expect("just inserted"))
    }

    /// Acquires the upstream, issues a simple bind, and updates session
    /// state on success.
    pub async fn bind(
        &self,
        session: &mut ClientSession,
        dn: &str,
        password: &str,
    ) -> Result<LdapResultCode, ProxyError> {
        let address = {
            // get_upstream may dial; surface dial failure as-is.
            self.get_upstream(session, dn).await?;
            session
                .upstream_address
                .clone()
                .unwrap_or_else(|| "<unknown>".to_string())
        };
        let ldap = session.upstream.as_mut().expect("dialed above");

        let bind = tokio::time::timeout(self.timeout, ldap.simple_bind(dn, password)).await;
        let result = match bind {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                session.upstream = None;
                session.upstream_address = None;
                return Err(ProxyError::BackendUnavailable {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                session.upstream = None;
                session.upstream_address = None;
                return Err(ProxyError::BackendUnavailable {
                    address,
                    reason: "bind timed out".to_string(),
                });
            }
        };

        if result.rc == 0 {
            if session.is_bound() && session.authenticated_dn != dn {
                info!(
                    "switching authenticated user: {} -> {}",
                    session.authenticated_dn, dn
                );
            }
            session.authenticated_dn = dn.to_string();
            Ok(LdapResultCode::Success)
        } else {
            let code = result_code_from_u32(result.rc);
            session.upstream = None;
            session.upstream_address = None;
            Err(ProxyError::BackendProtocol {
                code,
                text: result.text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_anonymous() {
        let s = ClientSession::new();
        assert!(!s.is_bound());
        assert_eq!(s.authenticated_dn, "");
    }
}
