//! Backend selection by longest DN suffix match.

/// An immutable routing table built once at startup.
///
/// Entries are kept sorted by descending suffix length so that lookup always
/// prefers the most specific match, rather than depending on whatever order
/// the configuration happened to list backends in.
#[derive(Debug, Clone)]
pub struct Router {
    // (lowercased suffix, address), longest suffix first.
    entries: Vec<(String, String)>,
    default_backend: String,
}

impl Router {
    pub fn new(additional: Vec<(String, String)>, default_backend: String) -> Self {
        let mut entries: Vec<(String, String)> = additional
            .into_iter()
            .map(|(suffix, addr)| (suffix.to_lowercase(), addr))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Router {
            entries,
            default_backend,
        }
    }

    /// Chooses an upstream address for `dn` by longest case-insensitive
    /// suffix match, falling back to the configured default backend.
    pub fn lookup(&self, dn: &str) -> &str {
        let dn_lower = dn.to_lowercase();
        for (suffix, address) in &self.entries {
            if dn_lower.ends_with(suffix.as_str()) {
                return address;
            }
        }
        &self.default_backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(
            vec![
                ("dc=corp,dc=com".to_string(), "ldap-b:389".to_string()),
                (
                    "ou=eng,dc=corp,dc=com".to_string(),
                    "ldap-c:389".to_string(),
                ),
            ],
            "ldap-a:389".to_string(),
        )
    }

    #[test]
    fn falls_back_to_default_when_nothing_matches() {
        let r = router();
        assert_eq!(r.lookup("dc=example,dc=com"), "ldap-a:389");
    }

    #[test]
    fn matches_case_insensitively() {
        let r = router();
        assert_eq!(r.lookup("UID=Bob,OU=P,DC=CORP,DC=COM"), "ldap-b:389");
    }

    #[test]
    fn longest_suffix_wins_regardless_of_configuration_order() {
        let r = router();
        assert_eq!(
            r.lookup("uid=alice,ou=eng,dc=corp,dc=com"),
            "ldap-c:389"
        );
    }

    #[test]
    fn empty_table_always_returns_default() {
        let r = Router::new(vec![], "only:389".to_string());
        assert_eq!(r.lookup("dc=anything"), "only:389");
    }
}
