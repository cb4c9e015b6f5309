//! The Paged Results (RFC 2696) search driver.
//!
//! Expressed as an explicit cookie-driven loop rather than wrapping the
//! upstream client's own `adapters::PagedResults` convenience type: the
//! dispatcher needs to observe each page as it arrives (to stream entries
//! downstream as they're fetched) and needs precise control over the
//! abandon-on-early-termination behavior, which the adapter does not
//! expose.

use ldap3::{controls::PagedResults, Ldap, Scope, SearchEntry, SearchOptions};

use crate::error::ProxyError;
use crate::upstream;

/// Drives one paged search against `address`. Each call to [`next_page`]
/// issues one `Search` request carrying the current cookie and returns the
/// page's entries; [`PagedSearch`] is exhausted once a page comes back with
/// an empty cookie (or the backend ignores paging entirely, in which case
/// the first page is also the last).
pub struct PagedSearch {
    base: String,
    scope: Scope,
    filter: String,
    attrs: Vec<String>,
    page_size: i32,
    time_limit: i32,
    address: String,
    cookie: Vec<u8>,
    done: bool,
}

impl PagedSearch {
    /// `time_limit` is the RFC 4511 `TimeLimit` sent with every page request
    /// (seconds, 0 = no limit); the caller is responsible for computing it as
    /// `min(configured, requested)` before constructing the driver.
    pub fn new(
        address: impl Into<String>,
        base: impl Into<String>,
        scope: Scope,
        filter: impl Into<String>,
        attrs: Vec<String>,
        page_size: i32,
        time_limit: i32,
    ) -> Result<Self, ProxyError> {
        if page_size <= 0 {
            return Err(ProxyError::PagingMisuse);
        }
        Ok(PagedSearch {
            base: base.into(),
            scope,
            filter: filter.into(),
            attrs,
            page_size,
            time_limit,
            address: address.into(),
            cookie: Vec::new(),
            done: false,
        })
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetches the next page, or `None` once the search is exhausted.
    pub async fn next_page(&mut self, ldap: &mut Ldap) -> Result<Option<Vec<SearchEntry>>, ProxyError> {
        if self.done {
            return Ok(None);
        }

        let attrs: Vec<&str> = self.attrs.iter().map(String::as_str).collect();
        let ctrl = PagedResults {
            size: self.page_size,
            cookie: self.cookie.clone(),
        };
        let (raw_entries, res) = ldap
            .with_controls(vec![ctrl.into()])
            .with_search_options(SearchOptions::new().timelimit(self.time_limit))
            .search(&self.base, self.scope, &self.filter, &attrs)
            .await
            .map_err(|e| upstream::classify_error(&self.address, e))?
            .success()
            .map_err(|e| upstream::classify_error(&self.address, e))?;

        match find_paged_results_control(&res) {
            Some(next) if !next.cookie.is_empty() => {
                self.cookie = next.cookie;
            }
            // Empty cookie, or the backend never echoed the control back at
            // all: either way there is nothing left to page through.
            _ => self.done = true,
        }

        Ok(Some(
            raw_entries.into_iter().map(SearchEntry::construct).collect(),
        ))
    }

    /// Releases server-side paging state without fetching further results:
    /// a client that abandons or disconnects mid-page issues one final
    /// request with `page_size = 0` carrying the last cookie, rather than
    /// leaving the backend holding a cursor nobody will resume.
    pub async fn abandon(&mut self, ldap: &mut Ldap) {
        if self.done || self.cookie.is_empty() {
            self.done = true;
            return;
        }
        let attrs: Vec<&str> = self.attrs.iter().map(String::as_str).collect();
        let ctrl = PagedResults {
            size: 0,
            cookie: std::mem::take(&mut self.cookie),
        };
        // Best-effort: the client is going away regardless of the outcome.
        let _ = ldap
            .with_controls(vec![ctrl.into()])
            .search(&self.base, self.scope, &self.filter, &attrs)
            .await;
        self.done = true;
    }
}

fn find_paged_results_control(res: &ldap3::result::LdapResult) -> Option<PagedResults> {
    use ldap3::controls::types::ControlType;
    use ldap3::controls::Control;

    res.ctrls.iter().find_map(|ctrl| match ctrl {
        Control(Some(ControlType::PagedResults), raw) => Some(raw.parse::<PagedResults>()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_page_size() {
        assert!(
            PagedSearch::new("h:389", "dc=x", Scope::Subtree, "(objectclass=*)", vec![], 0, 10)
                .is_err()
        );
        assert!(
            PagedSearch::new("h:389", "dc=x", Scope::Subtree, "(objectclass=*)", vec![], -1, 10)
                .is_err()
        );
    }

    #[test]
    fn accepts_positive_page_size() {
        let s =
            PagedSearch::new("h:389", "dc=x", Scope::Subtree, "(objectclass=*)", vec![], 50, 10)
                .unwrap();
        assert!(!s.is_done());
    }
}
