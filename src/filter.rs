//! Filter tree, RFC 4515 rendering, and the transitive-membership rewrite.
//!
//! This is the largest component: it owns both the recursive filter
//! conversion/rendering and the two graph walks
//! (`collect_member_dn`/`collect_memberof_dn`) that expand AD's
//! `LDAP_MATCHING_RULE_IN_CHAIN` extensible match into a flat disjunction the
//! backend can answer without any special support.

use std::collections::HashSet;

use ldap3::{Ldap, Scope, SearchEntry};
use log::warn;

use crate::error::ProxyError;

/// OID of Active Directory's `LDAP_MATCHING_RULE_IN_CHAIN`.
pub const IN_CHAIN_OID: &str = "1.2.840.113556.1.4.1941";

/// An owned, lifetime-free filter tree.
///
/// Converted from `ldap3_server::proto::LdapFilter` at the dispatcher
/// boundary; this is the one seam where the downstream wire crate's exact
/// shape is trusted (see DESIGN.md).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    Substring(String, Substrings),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Present(String),
    ApproxMatch(String, String),
    Extensible(ExtensibleMatch),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Substrings {
    pub initial: Option<String>,
    pub any: Vec<String>,
    pub final_: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensibleMatch {
    pub matching_rule: Option<String>,
    pub ftype: Option<String>,
    pub match_value: String,
    pub dn_attributes: bool,
}

impl From<&ldap3_server::proto::LdapFilter> for Filter {
    fn from(f: &ldap3_server::proto::LdapFilter) -> Self {
        use ldap3_server::proto::LdapFilter as W;
        match f {
            W::And(children) => Filter::And(children.iter().map(Filter::from).collect()),
            W::Or(children) => Filter::Or(children.iter().map(Filter::from).collect()),
            W::Not(child) => Filter::Not(Box::new(Filter::from(child.as_ref()))),
            W::Equality(attr, value) => Filter::Equality(attr.clone(), value.clone()),
            W::Substring(attr, sub) => Filter::Substring(
                attr.clone(),
                Substrings {
                    initial: sub.initial.clone(),
                    any: sub.any.clone(),
                    final_: sub.final_.clone(),
                },
            ),
            W::GreaterOrEqual(attr, value) => Filter::GreaterOrEqual(attr.clone(), value.clone()),
            W::LessOrEqual(attr, value) => Filter::LessOrEqual(attr.clone(), value.clone()),
            W::Present(attr) => Filter::Present(attr.clone()),
            W::Approx(attr, value) => Filter::ApproxMatch(attr.clone(), value.clone()),
            // The downstream crate's extensible-match variant is reconstructed
            // here from its RFC 4511 components (matching rule OID, attribute
            // type, match value, dn-attributes flag); field names follow the
            // crate's documented shape.
            W::Extensible(ext) => Filter::Extensible(ExtensibleMatch {
                matching_rule: ext.matching_rule.clone(),
                ftype: ext.ftype.clone(),
                match_value: ext.match_value.clone(),
                dn_attributes: ext.dn_attributes,
            }),
        }
    }
}

fn escape_value(v: &str) -> String {
    v.replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

impl Filter {
    /// Renders this tree as an RFC 4515 textual filter.
    pub fn to_filter_string(&self) -> String {
        match self {
            Filter::And(children) => render_set(children, '&'),
            Filter::Or(children) => render_set(children, '|'),
            Filter::Not(child) => format!("(!{})", child.to_filter_string()),
            Filter::Equality(attr, value) => format!("({attr}={})", escape_value(value)),
            Filter::GreaterOrEqual(attr, value) => format!("({attr}>={})", escape_value(value)),
            Filter::LessOrEqual(attr, value) => format!("({attr}<={})", escape_value(value)),
            Filter::ApproxMatch(attr, value) => format!("({attr}~={})", escape_value(value)),
            Filter::Present(attr) => format!("({attr}=*)", attr = attr),
            Filter::Substring(attr, sub) => {
                let mut s = String::new();
                if let Some(i) = &sub.initial {
                    s.push_str(&escape_value(i));
                }
                s.push('*');
                for a in &sub.any {
                    s.push_str(&escape_value(a));
                    s.push('*');
                }
                if let Some(f) = &sub.final_ {
                    s.push_str(&escape_value(f));
                }
                format!("({attr}={s})")
            }
            Filter::Extensible(ext) => {
                let mut s = String::from("(");
                if let Some(t) = &ext.ftype {
                    s.push_str(t);
                }
                if ext.dn_attributes {
                    s.push_str(":dn");
                }
                if let Some(rule) = &ext.matching_rule {
                    s.push(':');
                    s.push_str(rule);
                }
                s.push_str(":=");
                s.push_str(&escape_value(&ext.match_value));
                s.push(')');
                s
            }
        }
    }
}

fn render_set(children: &[Filter], op: char) -> String {
    let mut s = String::new();
    s.push('(');
    s.push(op);
    for c in children {
        s.push_str(&c.to_filter_string());
    }
    s.push(')');
    s
}

/// Walks `filter`, rewriting any `LDAP_MATCHING_RULE_IN_CHAIN` extensible
/// match nodes found anywhere in the tree into a flat OR-of-equality filter,
/// and renders the result. All other nodes are emitted verbatim.
///
/// If no rewrite applies anywhere in the tree, this is equivalent to
/// `filter.to_filter_string()`.
pub async fn rewrite(filter: &Filter, upstream: &mut Ldap) -> Result<String, ProxyError> {
    match rewrite_node(filter, upstream).await? {
        Some(s) => Ok(s),
        None => Ok(filter.to_filter_string()),
    }
}

/// Returns `Some(rendered)` if `node` contained a rewrite anywhere, `None` if
/// it should be rendered verbatim by the caller.
#[async_recursion::async_recursion]
async fn rewrite_node(node: &Filter, upstream: &mut Ldap) -> Result<Option<String>, ProxyError> {
    match node {
        Filter::And(children) => rewrite_children(children, '&', upstream).await,
        Filter::Or(children) => rewrite_children(children, '|', upstream).await,
        Filter::Not(child) => Ok(rewrite_node(child, upstream)
            .await?
            .map(|s| format!("(!{s})"))),
        Filter::Extensible(ext) if ext.matching_rule.as_deref() == Some(IN_CHAIN_OID) => {
            rewrite_in_chain(ext, upstream).await
        }
        _ => Ok(None),
    }
}

async fn rewrite_children(
    children: &[Filter],
    op: char,
    upstream: &mut Ldap,
) -> Result<Option<String>, ProxyError> {
    let mut rendered = Vec::with_capacity(children.len());
    let mut any_rewritten = false;
    for child in children {
        match rewrite_node(child, upstream).await? {
            Some(s) => {
                any_rewritten = true;
                rendered.push(s);
            }
            None => rendered.push(child.to_filter_string()),
        }
    }
    if !any_rewritten {
        return Ok(None);
    }
    let mut s = String::new();
    s.push('(');
    s.push(op);
    for r in rendered {
        s.push_str(&r);
    }
    s.push(')');
    Ok(Some(s))
}

/// Expands a single `(attr:1.2.840.113556.1.4.1941:=value)` node.
///
/// - `memberOf` walks downward (`collect_member_dn`): groups transitively
///   contained in `value`.
/// - `member`/`uniqueMember` walk upward (`collect_memberof_dn`): groups that
///   transitively contain `value`.
///
/// If the walk yields an empty set the original extensible-match node is
/// re-rendered verbatim rather than an always-false filter; downstream
/// treats an empty rewrite as "leave the filter alone", which degrades a
/// zero-hit transitive match back to the (possibly unsupported) original
/// extensible-match semantics on the backend, rather than silently
/// correcting it to an always-false filter.
async fn rewrite_in_chain(
    ext: &ExtensibleMatch,
    upstream: &mut Ldap,
) -> Result<Option<String>, ProxyError> {
    let attr = match &ext.ftype {
        Some(a) => a.clone(),
        None => return Ok(None),
    };
    let target = ext.match_value.clone();

    let members = if attr.eq_ignore_ascii_case("memberOf") {
        collect_member_dn(upstream, &target).await?
    } else if attr.eq_ignore_ascii_case("member") || attr.eq_ignore_ascii_case("uniqueMember") {
        collect_memberof_dn(upstream, &target).await?
    } else {
        return Ok(None);
    };

    if members.is_empty() {
        return Ok(None);
    }

    let mut s = String::from("(|");
    for dn in &members {
        s.push('(');
        s.push_str(&attr);
        s.push('=');
        s.push_str(&escape_value(dn));
        s.push(')');
    }
    s.push(')');
    Ok(Some(s))
}

/// Downward walk: starting at `group_dn`, finds every group transitively
/// contained in it. Inserts the *parent* DN (not the member DNs) into the
/// result set whenever a group has members, matching AD's ancestor-matching
/// semantics for `LDAP_MATCHING_RULE_IN_CHAIN`.
pub async fn collect_member_dn(
    upstream: &mut Ldap,
    group_dn: &str,
) -> Result<HashSet<String>, ProxyError> {
    let mut seen = HashSet::new();
    collect_member_dn_inner(upstream, group_dn, &mut seen).await?;
    Ok(seen)
}

#[async_recursion::async_recursion]
async fn collect_member_dn_inner(
    upstream: &mut Ldap,
    dn: &str,
    seen: &mut HashSet<String>,
) -> Result<(), ProxyError> {
    if seen.contains(dn) {
        warn!("cycle detected while walking group membership at {dn}, stopping descent");
        return Ok(());
    }

    let entries = match search_base(
        upstream,
        dn,
        "(|(objectclass=groupOfNames)(objectclass=groupOfUniqueNames))",
        &["member", "uniqueMember"],
    )
    .await
    {
        Ok(entries) => entries,
        Err(e) if is_no_such_object(&e) => return Ok(()),
        Err(e) => return Err(ProxyError::FilterRewrite(e.to_string())),
    };

    for entry in entries {
        let members = attr_values_ci(&entry, "member");
        let unique_members = attr_values_ci(&entry, "uniqueMember");

        if !members.is_empty() || !unique_members.is_empty() {
            seen.insert(dn.to_string());
        }

        for member in members.iter().chain(unique_members.iter()) {
            collect_member_dn_inner(upstream, member, seen).await?;
        }
    }
    Ok(())
}

/// Upward walk: starting at `user_dn`, finds every group that transitively
/// contains it via `memberOf` back-references. Unconditionally inserts the
/// starting DN (it is always a candidate ancestor group once it is reached).
pub async fn collect_memberof_dn(
    upstream: &mut Ldap,
    user_dn: &str,
) -> Result<HashSet<String>, ProxyError> {
    let mut seen = HashSet::new();
    collect_memberof_dn_inner(upstream, user_dn, &mut seen).await?;
    Ok(seen)
}

#[async_recursion::async_recursion]
async fn collect_memberof_dn_inner(
    upstream: &mut Ldap,
    dn: &str,
    seen: &mut HashSet<String>,
) -> Result<(), ProxyError> {
    if seen.contains(dn) {
        warn!("cycle detected while walking memberOf ancestry at {dn}, stopping ascent");
        return Ok(());
    }
    seen.insert(dn.to_string());

    let entries = match search_base(upstream, dn, "(objectclass=*)", &["memberOf"]).await {
        Ok(entries) => entries,
        Err(e) if is_no_such_object(&e) => return Ok(()),
        Err(e) => return Err(ProxyError::FilterRewrite(e.to_string())),
    };

    for entry in entries {
        for parent in attr_values_ci(&entry, "memberOf") {
            collect_memberof_dn_inner(upstream, &parent, seen).await?;
        }
    }
    Ok(())
}

async fn search_base(
    upstream: &mut Ldap,
    base: &str,
    filter: &str,
    attrs: &[&str],
) -> Result<Vec<SearchEntry>, ldap3::LdapError> {
    let (entries, _res) = upstream
        .search(base, Scope::Base, filter, attrs)
        .await?
        .success()?;
    Ok(entries.into_iter().map(SearchEntry::construct).collect())
}

/// Case-insensitive attribute lookup: the walk treats `member`/`memberOf`
/// matching as case-insensitive, since directory servers vary in the case
/// they return schema attribute names in.
fn attr_values_ci(entry: &SearchEntry, name: &str) -> Vec<String> {
    for (k, v) in &entry.attrs {
        if k.eq_ignore_ascii_case(name) {
            return v.clone();
        }
    }
    Vec::new()
}

/// `NoSuchObject` during a transitive walk means "this branch ends here" and
/// must not propagate; any other backend error does propagate.
fn is_no_such_object(err: &ldap3::LdapError) -> bool {
    matches!(crate::upstream::result_code(err), Some(32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(attr: &str, value: &str) -> Filter {
        Filter::Extensible(ExtensibleMatch {
            matching_rule: Some(IN_CHAIN_OID.to_string()),
            ftype: Some(attr.to_string()),
            match_value: value.to_string(),
            dn_attributes: false,
        })
    }

    #[test]
    fn equality_renders_rfc4515() {
        let f = Filter::Equality("cn".to_string(), "alice".to_string());
        assert_eq!(f.to_filter_string(), "(cn=alice)");
    }

    #[test]
    fn and_of_equalities_renders_rfc4515() {
        let f = Filter::And(vec![
            Filter::Equality("cn".to_string(), "alice".to_string()),
            Filter::Present("mail".to_string()),
        ]);
        assert_eq!(f.to_filter_string(), "(&(cn=alice)(mail=*))");
    }

    #[test]
    fn extensible_match_renders_with_rule_and_type() {
        let f = ext("memberOf", "cn=g1,dc=ex,dc=com");
        assert_eq!(
            f.to_filter_string(),
            format!("(memberOf:{IN_CHAIN_OID}:=cn=g1,dc=ex,dc=com)")
        );
    }

    #[test]
    fn values_with_special_characters_are_escaped() {
        let f = Filter::Equality("cn".to_string(), "a(b)*c\\d".to_string());
        assert_eq!(f.to_filter_string(), "(cn=a\\28b\\29\\2ac\\5cd)");
    }
}
