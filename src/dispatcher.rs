//! Per-connection message loop: frames LDAP messages, routes each operation
//! to the session binder, filter rewriter, or paged search driver, and
//! writes replies back.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use ldap3::{Ldap, Scope, SearchEntry};
use ldap3_server::proto::{
    LdapMsg, LdapOp, LdapPartialAttribute, LdapResult, LdapResultCode, LdapSearchResultEntry,
};
use ldap3_server::simple::{DisconnectionNotice, SearchRequest, ServerOps};
use ldap3_server::LdapCodec;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite};

use crate::error::ProxyError;
use crate::filter::Filter;
use crate::paging::PagedSearch;
use crate::session::{ClientSession, SessionBinder};

/// Upstream page size for every search the proxy issues: paging is an
/// internal transport-chunking detail, never re-exposed as an RFC 2696
/// control to the downstream client.
const UPSTREAM_PAGE_SIZE: i32 = 500;

/// Messages larger than this are rejected by the framing layer, before they
/// ever reach the dispatcher.
const MAX_REQUEST_SIZE: usize = 5 * 1024 * 1024;

/// Wraps the wire codec with a size cap on inbound frames. `LdapCodec` has no
/// built-in limit of its own, so without this a single client could hold the
/// connection's read buffer open indefinitely on an oversized message.
struct BoundedLdapCodec(LdapCodec);

impl Decoder for BoundedLdapCodec {
    type Item = <LdapCodec as Decoder>::Item;
    type Error = <LdapCodec as Decoder>::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() > MAX_REQUEST_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request exceeds the {MAX_REQUEST_SIZE}-byte limit"),
            )
            .into());
        }
        self.0.decode(src)
    }
}

pub async fn handle_connection(socket: TcpStream, binder: Arc<SessionBinder>, timeout: Duration) {
    let (r, w) = tokio::io::split(socket);
    let mut reqs = FramedRead::new(r, BoundedLdapCodec(LdapCodec));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        let mut resp = FramedWrite::new(w, LdapCodec);
        while let Some(msg) = rx.recv().await {
            if resp.send(msg).await.is_err() {
                break;
            }
            if resp.flush().await.is_err() {
                break;
            }
        }
    });

    let session = Arc::new(Mutex::new(ClientSession::new()));
    // Each in-flight Search carries its own abandon signal: `run_search`
    // races it against each page round-trip rather than being killed
    // outright, so it still gets a chance to run the page_size=0 abandon
    // search before exiting.
    let mut active: HashMap<i32, (Arc<Notify>, tokio::task::JoinHandle<()>)> = HashMap::new();

    while let Some(frame) = reqs.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed request, closing connection: {e}");
                let _ = tx.send(DisconnectionNotice::gen(
                    LdapResultCode::ProtocolError,
                    "malformed request",
                ));
                break;
            }
        };

        if let LdapOp::AbandonRequest(target) = &msg.op {
            if let Some((notify, _)) = active.get(target) {
                notify.notify_one();
                info!("abandoned in-flight request {target}");
            }
            continue;
        }

        let msgid = msg.msgid;

        // Write ops and the search TimeLimit live only on the raw `LdapOp`;
        // `ServerOps::try_from` folds everything it doesn't recognize into a
        // single uninformative `Err(())`, so pull what's needed out first.
        let mut requested_time_limit: i32 = 0;
        let mut early_reply: Option<LdapMsg> = None;
        let mut is_bind = false;
        match &msg.op {
            LdapOp::SearchRequest(req) => requested_time_limit = req.timelimit,
            LdapOp::BindRequest(_) => is_bind = true,
            LdapOp::AddRequest(_) => {
                early_reply = Some(unsupported_write(msgid, LdapOp::AddResponse))
            }
            LdapOp::DelRequest(_) => {
                early_reply = Some(unsupported_write(msgid, LdapOp::DelResponse))
            }
            LdapOp::ModifyRequest(_) => {
                early_reply = Some(unsupported_write(msgid, LdapOp::ModifyResponse))
            }
            LdapOp::ModifyDNRequest(_) => {
                early_reply = Some(unsupported_write(msgid, LdapOp::ModifyDNResponse))
            }
            LdapOp::CompareRequest(_) => {
                early_reply = Some(unsupported_write(msgid, LdapOp::CompareResponse))
            }
            _ => {}
        }

        if let Some(reply) = early_reply {
            if tx.send(reply).is_err() {
                break;
            }
            continue;
        }

        active.retain(|_, (_, h)| !h.is_finished());

        match ServerOps::try_from(msg) {
            Ok(ServerOps::SimpleBind(sbr)) => {
                let reply = {
                    let mut guard = session.lock().await;
                    match binder.bind(&mut guard, &sbr.dn, &sbr.pw).await {
                        Ok(_) => sbr.gen_success(),
                        Err(ProxyError::BackendProtocol { code, text }) => {
                            sbr.gen_error(code, text)
                        }
                        Err(e) => sbr.gen_error(e.to_result_code(), e.to_string()),
                    }
                };
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(ServerOps::Unbind(_)) => {
                info!("client sent Unbind, closing connection");
                break;
            }
            Ok(ServerOps::Whoami(wr)) => {
                // Not part of this proxy's supported surface; refuse rather
                // than invent a reply the upstream was never asked for.
                let reply = wr.gen_error(
                    LdapResultCode::UnwillingToPerform,
                    "Operation not implemented by server".to_string(),
                );
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(ServerOps::Search(sr)) => {
                let binder = binder.clone();
                let session = session.clone();
                let tx = tx.clone();
                let notify = Arc::new(Notify::new());
                let task_notify = notify.clone();
                let handle = tokio::spawn(async move {
                    run_search(binder, session, sr, requested_time_limit, timeout, tx, task_notify)
                        .await;
                });
                active.insert(msgid, (notify, handle));
            }
            Err(_) if is_bind => {
                // An authentication choice other than simple bind: refuse
                // without ever touching the upstream, connection stays open.
                let reply = reply_with(
                    msgid,
                    LdapOp::BindResponse,
                    LdapResultCode::UnwillingToPerform,
                    "Authentication choice not supported",
                );
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Err(_) => {
                // A genuinely unrecognized op code (e.g. an extended
                // request): there is no grounded way to compose a typed
                // reply without knowing which response variant pairs with
                // it, so the connection closes with a diagnostic instead of
                // guessing at one.
                let _ = tx.send(DisconnectionNotice::gen(
                    LdapResultCode::UnwillingToPerform,
                    "Operation not implemented by server",
                ));
                break;
            }
        }
    }

    for (_, (_, handle)) in active {
        handle.abort();
    }
    drop(tx);
    let _ = writer.await;
}

/// Builds an `LdapMsg` wrapping a bare `LdapResult` under the given response
/// op, with no matched DN and no referrals.
fn reply_with(
    msgid: i32,
    op: fn(LdapResult) -> LdapOp,
    code: LdapResultCode,
    message: impl Into<String>,
) -> LdapMsg {
    LdapMsg {
        msgid,
        op: op(LdapResult {
            code,
            matcheddn: String::new(),
            message: message.into(),
            referral: Vec::new(),
        }),
        ctrl: Vec::new(),
    }
}

fn unsupported_write(msgid: i32, op: fn(LdapResult) -> LdapOp) -> LdapMsg {
    reply_with(
        msgid,
        op,
        LdapResultCode::InsufficientAccessRights,
        "write operations are not supported by this proxy",
    )
}

async fn run_search(
    binder: Arc<SessionBinder>,
    session: Arc<Mutex<ClientSession>>,
    sr: SearchRequest,
    requested_time_limit: i32,
    timeout: Duration,
    tx: mpsc::UnboundedSender<ldap3_server::proto::LdapMsg>,
    abandoned: Arc<Notify>,
) {
    let dn = session.lock().await.authenticated_dn.clone();

    let (mut ldap, upstream_address) = {
        let mut guard = session.lock().await;
        match binder.get_upstream(&mut guard, &dn).await {
            Ok(handle) => {
                let ldap = handle.clone();
                (ldap, guard.upstream_address().to_string())
            }
            Err(e) => {
                warn!("could not acquire upstream for search: {e}");
                let _ = tx.send(sr.gen_error(e.to_result_code(), e.to_string()));
                return;
            }
        }
    };

    let rewritten = match rewrite_filter(&sr.filter, &mut ldap).await {
        Ok(s) => s,
        Err(e) => {
            warn!("filter rewrite failed: {e}");
            let _ = tx.send(sr.gen_error(e.to_result_code(), e.to_string()));
            return;
        }
    };

    let scope = to_ldap3_scope(sr.scope.clone());
    let mut attrs: Vec<String> = sr.attrs.clone();
    if attrs.is_empty() {
        attrs.push("*".to_string());
    }

    // The Go original takes the literal min(configured, requested): a
    // client-requested 0 (unlimited) always wins over a positive configured
    // bound. Kept as-is rather than special-cased, matching that behavior.
    let configured_time_limit = timeout.as_secs() as i32;
    let effective_time_limit = requested_time_limit.min(configured_time_limit);

    let mut driver = match PagedSearch::new(
        upstream_address,
        sr.base.clone(),
        scope,
        rewritten,
        attrs,
        UPSTREAM_PAGE_SIZE,
        effective_time_limit,
    ) {
        Ok(d) => d,
        Err(e) => {
            let _ = tx.send(sr.gen_error(e.to_result_code(), e.to_string()));
            return;
        }
    };

    loop {
        let page = tokio::select! {
            biased;
            _ = abandoned.notified() => {
                debug!("search abandoned by client, releasing paging cursor");
                driver.abandon(&mut ldap).await;
                // Abandoned: stop work, send no Done response.
                return;
            }
            page = tokio::time::timeout(timeout, driver.next_page(&mut ldap)) => page,
        };
        let page = match page {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                debug!("search round-trip failed: {e}");
                driver.abandon(&mut ldap).await;
                let _ = tx.send(sr.gen_error(e.to_result_code(), e.to_string()));
                return;
            }
            Err(_) => {
                driver.abandon(&mut ldap).await;
                let _ = tx.send(
                    sr.gen_error(LdapResultCode::TimeLimitExceeded, "search timed out".into()),
                );
                return;
            }
        };

        match page {
            Some(entries) => {
                for entry in entries {
                    if tx.send(sr.gen_result_entry(to_wire_entry(entry))).is_err() {
                        driver.abandon(&mut ldap).await;
                        return;
                    }
                }
            }
            None => break,
        }
    }

    let _ = tx.send(sr.gen_success());
}

async fn rewrite_filter(
    filter: &ldap3_server::proto::LdapFilter,
    ldap: &mut Ldap,
) -> Result<String, ProxyError> {
    let tree = Filter::from(filter);
    crate::filter::rewrite(&tree, ldap).await
}

fn to_wire_entry(entry: SearchEntry) -> LdapSearchResultEntry {
    LdapSearchResultEntry {
        dn: entry.dn,
        attributes: entry
            .attrs
            .into_iter()
            .map(|(atype, vals)| LdapPartialAttribute { atype, vals })
            .collect(),
    }
}

fn to_ldap3_scope(scope: ldap3_server::LdapSearchScope) -> Scope {
    use ldap3_server::LdapSearchScope as W;
    match scope {
        W::Base => Scope::Base,
        W::OneLevel => Scope::OneLevel,
        W::Subtree => Scope::Subtree,
    }
}
