//! Websocket ledger client.
//!
//! Speaks the ledger's JSON-RPC websocket API: a request/response map
//! keyed by request id, plus the subscription streams (`ledger` closes
//! and this host's account transactions) that feed the typed event
//! channel. Transactions are signed server-side by the trusted node the
//! agent is pointed at, so no transaction serialization happens here.
//!
//! Lease protocol messages ride in transaction memos: the memo type
//! names the action (`evnAcquireLease`, `evnExtendLease`, ...) and the
//! memo data carries a hex-encoded JSON payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::uri;
use super::{
    AccountTx, AcquireEvent, AcquirePayload, Candidate, EventSender, ExtendEvent, HeartbeatVote,
    HookConfig, HostRegistration, LedgerClient, LedgerError, LedgerEvent, LedgerResult,
    SubmissionRef, TerminateEvent, TxKind, UriToken,
};

/// Offset between the ledger epoch (2000-01-01) and the unix epoch.
const LEDGER_EPOCH_OFFSET: u64 = 946_684_800;

/// Base fee in drops before any uplift.
const BASE_FEE_DROPS: u64 = 12;

/// How long a request waits for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a submission waits for validation before reporting
/// [`LedgerError::TookTooLong`].
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(20);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Convert a ledger close time to unix seconds.
#[must_use]
pub fn ledger_time_to_unix(ledger_time: u64) -> u64 {
    ledger_time + LEDGER_EPOCH_OFFSET
}

/// Parse a ledger amount: either a drops string or an issued-currency
/// object with a decimal `value`.
#[must_use]
pub fn parse_amount(amount: &Value) -> f64 {
    match amount {
        Value::String(drops) => drops.parse::<f64>().unwrap_or(0.0) / 1_000_000.0,
        Value::Object(obj) => obj
            .get("value")
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

fn memo_of(tx: &Value) -> Option<(String, Value)> {
    let memo = tx.get("Memos")?.as_array()?.first()?.get("Memo")?;
    let memo_type = memo.get("MemoType").and_then(Value::as_str)?;
    let memo_data = memo.get("MemoData").and_then(Value::as_str).unwrap_or("");
    let kind = String::from_utf8(hex::decode(memo_type).ok()?).ok()?;
    let data = hex::decode(memo_data)
        .ok()
        .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok())
        .unwrap_or(Value::Null);
    Some((kind, data))
}

fn build_memo(kind: &str, data: &Value) -> Value {
    json!([{
        "Memo": {
            "MemoType": hex::encode_upper(kind.as_bytes()),
            "MemoData": hex::encode_upper(data.to_string().as_bytes()),
        }
    }])
}

/// Classify one validated transaction on this host's account.
fn classify(tx: &Value, host_account: &str) -> Option<LedgerEvent> {
    let (kind, data) = memo_of(tx)?;
    let account = tx.get("Account").and_then(Value::as_str).unwrap_or_default();
    let tx_hash = tx.get("hash").and_then(Value::as_str).unwrap_or_default();
    let ledger_index = tx.get("ledger_index").and_then(Value::as_u64).unwrap_or(0);

    match kind.as_str() {
        "evnAcquireLease" => {
            let token_id = tx
                .get("URITokenID")
                .and_then(Value::as_str)
                .or_else(|| data.get("token_id").and_then(Value::as_str))?
                .to_string();
            let payload: AcquirePayload =
                serde_json::from_value(data.clone()).unwrap_or_default();
            Some(LedgerEvent::Acquire(AcquireEvent {
                tenant: account.to_string(),
                host: tx
                    .get("Destination")
                    .and_then(Value::as_str)
                    .unwrap_or(host_account)
                    .to_string(),
                tx_hash: tx_hash.to_string(),
                token_id,
                amount: parse_amount(tx.get("Amount").unwrap_or(&Value::Null)),
                ledger_index,
                payload,
            }))
        }
        "evnExtendLease" => Some(LedgerEvent::Extend(ExtendEvent {
            tenant: account.to_string(),
            host: tx
                .get("Destination")
                .and_then(Value::as_str)
                .unwrap_or(host_account)
                .to_string(),
            tx_hash: tx_hash.to_string(),
            token_id: data.get("token_id").and_then(Value::as_str)?.to_string(),
            amount: parse_amount(tx.get("Amount").unwrap_or(&Value::Null)),
            ledger_index,
        })),
        "evnTerminateLease" => Some(LedgerEvent::Terminate(TerminateEvent {
            tenant: account.to_string(),
            tx_hash: tx_hash.to_string(),
            token_id: data.get("token_id").and_then(Value::as_str)?.to_string(),
        })),
        "evnHostRegistered" => Some(LedgerEvent::HostRegistered),
        _ => None,
    }
}

/// Classify one historical transaction for catch-up.
fn classify_history(tx: &Value) -> AccountTx {
    let tx_hash = tx
        .get("hash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let ledger_index = tx.get("ledger_index").and_then(Value::as_u64).unwrap_or(0);
    let amount = parse_amount(tx.get("Amount").unwrap_or(&Value::Null));

    let (kind, tenant, token_id, ref_tx_hash) = match memo_of(tx) {
        Some((memo_kind, data)) => {
            let token_id = tx
                .get("URITokenID")
                .and_then(Value::as_str)
                .or_else(|| data.get("token_id").and_then(Value::as_str))
                .map(str::to_string);
            let ref_tx = data
                .get("ref_tx_hash")
                .and_then(Value::as_str)
                .map(str::to_string);
            let account = tx
                .get("Account")
                .and_then(Value::as_str)
                .map(str::to_string);
            let destination = tx
                .get("Destination")
                .and_then(Value::as_str)
                .map(str::to_string);
            let kind = match memo_kind.as_str() {
                "evnAcquireLease" => TxKind::Acquire,
                "evnExtendLease" => TxKind::Extend,
                "evnTerminateLease" => TxKind::Terminate,
                "evnAcquireSuccess" => TxKind::AcquireSuccess,
                "evnAcquireError" => TxKind::AcquireError,
                "evnExtendSuccess" => TxKind::ExtendSuccess,
                "evnExtendError" => TxKind::ExtendError,
                "evnRefund" => TxKind::Refund,
                _ => TxKind::Other,
            };
            // Tenant side of the exchange: sender for requests, the
            // destination for host responses.
            let tenant = match kind {
                TxKind::Acquire | TxKind::Extend | TxKind::Terminate => account,
                _ => destination,
            };
            (kind, tenant, token_id, ref_tx)
        }
        None => (TxKind::Other, None, None, None),
    };

    AccountTx {
        tx_hash,
        ledger_index,
        kind,
        tenant,
        token_id,
        amount,
        ref_tx_hash,
    }
}

struct Pending {
    map: StdMutex<HashMap<u64, oneshot::Sender<Value>>>,
}

/// The production websocket client.
pub struct WsLedgerClient {
    account: String,
    secret: String,
    governor: String,
    sink: Mutex<Option<WsSink>>,
    pending: Arc<Pending>,
    req_seq: AtomicU64,
    fee_uplift: AtomicU64,
    events: EventSender,
}

impl WsLedgerClient {
    /// Client for `account`, submitting through the node's server-side
    /// signing with `secret`, reporting events on `events`.
    #[must_use]
    pub fn new(account: &str, secret: &str, governor: &str, events: EventSender) -> Self {
        Self {
            account: account.to_string(),
            secret: secret.to_string(),
            governor: governor.to_string(),
            sink: Mutex::new(None),
            pending: Arc::new(Pending {
                map: StdMutex::new(HashMap::new()),
            }),
            req_seq: AtomicU64::new(1),
            fee_uplift: AtomicU64::new(0),
            events: events.clone(),
        }
    }

    /// Connect to the first reachable server and subscribe to the
    /// ledger stream and this account's transactions.
    ///
    /// # Errors
    ///
    /// Fails when no server accepts the connection.
    pub async fn connect(&self, servers: &[String]) -> LedgerResult<()> {
        let mut last_err = None;
        for server in servers {
            match connect_async(server.as_str()).await {
                Ok((stream, _)) => {
                    info!(server, "ledger connection established");
                    let (sink, source) = stream.split();
                    *self.sink.lock().await = Some(sink);
                    self.spawn_reader(source);
                    self.request(
                        "subscribe",
                        json!({
                            "streams": ["ledger"],
                            "accounts": [self.account],
                        }),
                    )
                    .await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(server, "ledger connection failed: {e}");
                    last_err = Some(e.to_string());
                }
            }
        }
        Err(LedgerError::Transport(
            last_err.unwrap_or_else(|| "no ledger servers configured".to_string()),
        ))
    }

    fn spawn_reader(&self, mut source: WsSource) {
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let account = self.account.clone();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let Ok(msg) = serde_json::from_str::<Value>(&text) else {
                    debug!("unparseable ledger message dropped");
                    continue;
                };

                if let Some(id) = msg.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending.map.lock().expect("pending poisoned").remove(&id) {
                        let _ = tx.send(msg);
                    }
                    continue;
                }

                match msg.get("type").and_then(Value::as_str) {
                    Some("ledgerClosed") => {
                        let ledger_index =
                            msg.get("ledger_index").and_then(Value::as_u64).unwrap_or(0);
                        let ledger_time = ledger_time_to_unix(
                            msg.get("ledger_time").and_then(Value::as_u64).unwrap_or(0),
                        );
                        let _ = events.send(LedgerEvent::Tick {
                            ledger_index,
                            ledger_time,
                        });
                    }
                    Some("transaction") => {
                        if msg.get("validated").and_then(Value::as_bool) != Some(true) {
                            continue;
                        }
                        if let Some(tx) = msg.get("transaction") {
                            if let Some(event) = classify(tx, &account) {
                                let _ = events.send(event);
                            }
                        }
                    }
                    Some("serverStatus") => {
                        if msg.get("server_status").and_then(Value::as_str) == Some("desynced") {
                            error!("ledger server desynced");
                            let _ = events.send(LedgerEvent::Desynced);
                        }
                    }
                    _ => {}
                }
            }
            error!("ledger connection closed");
            let _ = events.send(LedgerEvent::Disconnected);
        });
    }

    async fn request(&self, command: &str, mut params: Value) -> LedgerResult<Value> {
        let id = self.req_seq.fetch_add(1, Ordering::SeqCst);
        params["id"] = json!(id);
        params["command"] = json!(command);

        let (tx, rx) = oneshot::channel();
        self.pending
            .map
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);

        {
            let mut sink = self.sink.lock().await;
            let sink = sink.as_mut().ok_or(LedgerError::Disconnected)?;
            sink.send(Message::Text(params.to_string()))
                .await
                .map_err(|e| LedgerError::Transport(e.to_string()))?;
        }

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.map.lock().expect("pending poisoned").remove(&id);
                LedgerError::TookTooLong
            })?
            .map_err(|_| LedgerError::Disconnected)?;

        if reply.get("status").and_then(Value::as_str) == Some("error") {
            return Err(LedgerError::Submission(
                reply
                    .get("error_message")
                    .or_else(|| reply.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown ledger error")
                    .to_string(),
            ));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Submit one transaction through server-side signing and wait for
    /// the preliminary result.
    async fn submit(&self, mut tx_json: Value, sref: &SubmissionRef) -> LedgerResult<()> {
        let fee = BASE_FEE_DROPS + self.fee_uplift.load(Ordering::Relaxed);
        tx_json["Account"] = json!(self.account);
        tx_json["Fee"] = json!(fee.to_string());

        let result = tokio::time::timeout(
            SUBMIT_TIMEOUT,
            self.request("submit", json!({ "secret": self.secret, "tx_json": tx_json })),
        )
        .await
        .map_err(|_| LedgerError::TookTooLong)??;

        if let Some(hash) = result
            .pointer("/tx_json/hash")
            .and_then(Value::as_str)
        {
            sref.record(hash);
        }

        match result.get("engine_result").and_then(Value::as_str) {
            Some(code) if code.starts_with("tes") => Ok(()),
            Some(code) if code == "tecHOOK_REJECTED" => {
                // The hook names the rejected candidate in its return
                // string when a heartbeat vote is refused.
                let detail = result
                    .get("engine_result_message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if let Some(candidate_id) = detail.strip_prefix("vote rejected: ") {
                    Err(LedgerError::VoteRejected {
                        candidate_id: candidate_id.to_string(),
                    })
                } else {
                    Err(LedgerError::Submission(detail.to_string()))
                }
            }
            Some(code) => Err(LedgerError::Submission(code.to_string())),
            None => Err(LedgerError::TookTooLong),
        }
    }

    async fn host_tokens(&self) -> LedgerResult<Vec<UriToken>> {
        let result = self
            .request(
                "account_objects",
                json!({ "account": self.account, "type": "uri_token" }),
            )
            .await?;
        let objects = result
            .get("account_objects")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(objects
            .iter()
            .filter_map(|obj| {
                Some(UriToken {
                    token_id: obj.get("index").and_then(Value::as_str)?.to_string(),
                    owner: obj
                        .get("Owner")
                        .and_then(Value::as_str)
                        .unwrap_or(&self.account)
                        .to_string(),
                    uri: obj.get("URI").and_then(Value::as_str)?.to_string(),
                    has_sell_offer: obj.get("Amount").is_some(),
                })
            })
            .filter(|token| uri::decode(&token.uri).is_ok())
            .collect())
    }

    async fn hook_state(&self, key: &str) -> LedgerResult<Value> {
        self.request(
            "ledger_entry",
            json!({
                "hook_state": {
                    "account": self.governor,
                    "key": key,
                    "namespace_id": "0000000000000000000000000000000000000000000000000000000000000000",
                }
            }),
        )
        .await
    }
}

#[async_trait]
impl LedgerClient for WsLedgerClient {
    async fn host_registration(&self) -> LedgerResult<HostRegistration> {
        let state = self.hook_state(&format!("host:{}", self.account)).await?;
        serde_json::from_value(state.get("data").cloned().unwrap_or(Value::Null))
            .map_err(|e| LedgerError::Protocol(format!("registration state: {e}")))
    }

    async fn hook_config(&self) -> LedgerResult<HookConfig> {
        let state = self.hook_state("config").await?;
        serde_json::from_value(state.get("data").cloned().unwrap_or(Value::Null))
            .map_err(|e| LedgerError::Protocol(format!("hook config: {e}")))
    }

    async fn moment(&self, timestamp: Option<u64>) -> LedgerResult<u64> {
        let config = self.hook_config().await?;
        let t = match timestamp {
            Some(t) => t,
            None => chrono::Utc::now().timestamp().unsigned_abs(),
        };
        Ok(t / config.moment_size.max(1))
    }

    async fn moment_start_time(&self) -> LedgerResult<u64> {
        let config = self.hook_config().await?;
        let size = config.moment_size.max(1);
        let now = chrono::Utc::now().timestamp().unsigned_abs();
        Ok(now / size * size)
    }

    async fn lease_token(&self, token_id: &str) -> LedgerResult<Option<UriToken>> {
        let result = self
            .request("ledger_entry", json!({ "index": token_id }))
            .await;
        match result {
            Ok(entry) => {
                let node = entry.get("node").cloned().unwrap_or(Value::Null);
                Ok(Some(UriToken {
                    token_id: token_id.to_string(),
                    owner: node
                        .get("Owner")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    uri: node
                        .get("URI")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    has_sell_offer: node.get("Amount").is_some(),
                }))
            }
            Err(LedgerError::Submission(msg)) if msg.contains("entryNotFound") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lease_offers(&self) -> LedgerResult<Vec<UriToken>> {
        Ok(self
            .host_tokens()
            .await?
            .into_iter()
            .filter(|t| t.has_sell_offer)
            .collect())
    }

    async fn unoffered_leases(&self) -> LedgerResult<Vec<UriToken>> {
        Ok(self
            .host_tokens()
            .await?
            .into_iter()
            .filter(|t| !t.has_sell_offer)
            .collect())
    }

    async fn account_tx(&self, from_ledger: u64) -> LedgerResult<Vec<AccountTx>> {
        let result = self
            .request(
                "account_tx",
                json!({
                    "account": self.account,
                    "ledger_index_min": from_ledger,
                    "ledger_index_max": -1,
                    "forward": true,
                }),
            )
            .await?;
        let txs = result
            .get("transactions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(txs
            .iter()
            .filter(|entry| entry.get("validated").and_then(Value::as_bool) == Some(true))
            .filter_map(|entry| entry.get("tx").map(classify_history))
            .collect())
    }

    async fn tx_validated(&self, tx_hash: &str) -> LedgerResult<bool> {
        let result = self
            .request("tx", json!({ "transaction": tx_hash }))
            .await;
        match result {
            Ok(tx) => Ok(tx.get("validated").and_then(Value::as_bool) == Some(true)
                && tx
                    .pointer("/meta/TransactionResult")
                    .and_then(Value::as_str)
                    .is_some_and(|code| code.starts_with("tes"))),
            Err(LedgerError::Submission(msg)) if msg.contains("txnNotFound") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn governance_candidates(&self) -> LedgerResult<Vec<Candidate>> {
        let state = self.hook_state("candidates").await?;
        let entries = state
            .pointer("/data/candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(entries
            .iter()
            .filter_map(|entry| {
                Some(Candidate {
                    candidate_id: entry.get("id").and_then(Value::as_str)?.to_string(),
                    index: entry.get("index").and_then(Value::as_u64)?,
                })
            })
            .collect())
    }

    fn set_fee_uplift(&self, drops: u64) {
        self.fee_uplift.store(drops, Ordering::Relaxed);
    }

    async fn update_reg_info(
        &self,
        active: u64,
        total: u64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let data = json!({ "active_instances": active, "total_instances": total });
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": self.governor,
                "Amount": "1",
                "Memos": build_memo("evnHostUpdateReg", &data),
            }),
            sref,
        )
        .await
    }

    async fn offer_lease(
        &self,
        lease_index: u32,
        amount: f64,
        tos_hash: &str,
        outbound_ip: Option<&str>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let lease_uri = uri::encode(&uri::LeaseUri {
            lease_index,
            lease_amount: amount,
            outbound_ip: outbound_ip.map(str::to_string),
        });
        self.submit(
            json!({
                "TransactionType": "URITokenCreateSellOffer",
                "URI": lease_uri,
                "Amount": { "currency": "EVR", "issuer": self.governor, "value": amount.to_string() },
                "Memos": build_memo("evnOfferLease", &json!({ "tos_hash": tos_hash })),
            }),
            sref,
        )
        .await
    }

    async fn offer_minted_lease(
        &self,
        lease_index: u32,
        amount: f64,
        tos_hash: &str,
        outbound_ip: Option<&str>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let lease_uri = uri::encode(&uri::LeaseUri {
            lease_index,
            lease_amount: amount,
            outbound_ip: outbound_ip.map(str::to_string),
        });
        self.submit(
            json!({
                "TransactionType": "URITokenMint",
                "URI": lease_uri,
                "Amount": { "currency": "EVR", "issuer": self.governor, "value": amount.to_string() },
                "Memos": build_memo("evnOfferLease", &json!({ "tos_hash": tos_hash })),
            }),
            sref,
        )
        .await
    }

    async fn expire_lease(&self, token_id: &str, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit(
            json!({
                "TransactionType": "URITokenBurn",
                "URITokenID": token_id,
                "Memos": build_memo("evnExpireLease", &json!({ "token_id": token_id })),
            }),
            sref,
        )
        .await
    }

    async fn burn_lease(&self, token_id: &str, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit(
            json!({
                "TransactionType": "URITokenBurn",
                "URITokenID": token_id,
                "Memos": build_memo("evnBurnLease", &json!({ "token_id": token_id })),
            }),
            sref,
        )
        .await
    }

    async fn acquire_success(
        &self,
        acquire_tx_hash: &str,
        tenant: &str,
        instance_info: &Value,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let data = json!({ "ref_tx_hash": acquire_tx_hash, "instance": instance_info });
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": tenant,
                "Amount": "1",
                "Memos": build_memo("evnAcquireSuccess", &data),
            }),
            sref,
        )
        .await
    }

    async fn acquire_error(
        &self,
        acquire_tx_hash: &str,
        tenant: &str,
        amount: f64,
        reason: &str,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let data = json!({ "ref_tx_hash": acquire_tx_hash, "reason": reason });
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": tenant,
                "Amount": { "currency": "EVR", "issuer": self.governor, "value": amount.to_string() },
                "Memos": build_memo("evnAcquireError", &data),
            }),
            sref,
        )
        .await
    }

    async fn extend_success(
        &self,
        extend_tx_hash: &str,
        tenant: &str,
        expiry_moment: u64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let data = json!({ "ref_tx_hash": extend_tx_hash, "expiry_moment": expiry_moment });
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": tenant,
                "Amount": "1",
                "Memos": build_memo("evnExtendSuccess", &data),
            }),
            sref,
        )
        .await
    }

    async fn extend_error(
        &self,
        extend_tx_hash: &str,
        tenant: &str,
        reason: &str,
        amount: f64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let data = json!({ "ref_tx_hash": extend_tx_hash, "reason": reason });
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": tenant,
                "Amount": { "currency": "EVR", "issuer": self.governor, "value": amount.to_string() },
                "Memos": build_memo("evnExtendError", &data),
            }),
            sref,
        )
        .await
    }

    async fn refund_tenant(
        &self,
        origin_tx_hash: &str,
        tenant: &str,
        amount: f64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let data = json!({ "ref_tx_hash": origin_tx_hash });
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": tenant,
                "Amount": { "currency": "EVR", "issuer": self.governor, "value": amount.to_string() },
                "Memos": build_memo("evnRefund", &data),
            }),
            sref,
        )
        .await
    }

    async fn heartbeat(
        &self,
        vote: Option<&HeartbeatVote>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let data = match vote {
            Some(v) => json!({
                "candidate_id": v.candidate_id,
                "vote": v.vote,
            }),
            None => json!({}),
        };
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": self.governor,
                "Amount": "1",
                "Memos": build_memo("evnHeartbeat", &data),
            }),
            sref,
        )
        .await
    }

    async fn prepare_account(&self, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit(
            json!({
                "TransactionType": "TrustSet",
                "LimitAmount": { "currency": "EVR", "issuer": self.governor, "value": "99999999" },
            }),
            sref,
        )
        .await
    }

    async fn request_rebate(&self, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit(
            json!({
                "TransactionType": "Payment",
                "Destination": self.governor,
                "Amount": "1",
                "Memos": build_memo("evnRebateRequest", &json!({})),
            }),
            sref,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire_tx() -> Value {
        let payload = json!({
            "owner_pubkey": "edOWNER",
            "contract_id": "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b",
            "image": "hp.latest-ubt.20.04",
            "config": {},
        });
        json!({
            "Account": "rTENANT",
            "Destination": "rHOST",
            "Amount": { "currency": "EVR", "issuer": "rGOV", "value": "2" },
            "URITokenID": "T1",
            "hash": "ACQ1",
            "ledger_index": 82_000_001u64,
            "Memos": build_memo("evnAcquireLease", &payload),
        })
    }

    #[test]
    fn ledger_time_conversion() {
        assert_eq!(ledger_time_to_unix(0), 946_684_800);
    }

    #[test]
    fn amount_parsing_handles_both_forms() {
        assert!((parse_amount(&json!("1000000")) - 1.0).abs() < 1e-9);
        assert!(
            (parse_amount(&json!({ "currency": "EVR", "issuer": "r", "value": "2.5" })) - 2.5)
                .abs()
                < 1e-9
        );
        assert_eq!(parse_amount(&Value::Null), 0.0);
    }

    #[test]
    fn memo_roundtrip() {
        let tx = acquire_tx();
        let (kind, data) = memo_of(&tx).unwrap();
        assert_eq!(kind, "evnAcquireLease");
        assert_eq!(data["image"], "hp.latest-ubt.20.04");
    }

    #[test]
    fn acquire_transactions_classify() {
        let event = classify(&acquire_tx(), "rHOST").unwrap();
        let LedgerEvent::Acquire(acquire) = event else {
            panic!("expected acquire");
        };
        assert_eq!(acquire.tenant, "rTENANT");
        assert_eq!(acquire.host, "rHOST");
        assert_eq!(acquire.token_id, "T1");
        assert_eq!(acquire.tx_hash, "ACQ1");
        assert!((acquire.amount - 2.0).abs() < 1e-9);
        assert_eq!(acquire.payload.owner_pubkey, "edOWNER");
    }

    #[test]
    fn unrelated_transactions_do_not_classify() {
        let tx = json!({ "Account": "rX", "hash": "H", "ledger_index": 1u64 });
        assert!(classify(&tx, "rHOST").is_none());
    }

    #[test]
    fn history_classification_links_responses_to_requests() {
        let tx = json!({
            "Account": "rHOST",
            "Destination": "rTENANT",
            "Amount": { "currency": "EVR", "issuer": "rGOV", "value": "2" },
            "hash": "RESP1",
            "ledger_index": 82_000_002u64,
            "Memos": build_memo("evnAcquireError", &json!({ "ref_tx_hash": "ACQ1", "reason": "sashi_timeout" })),
        });
        let entry = classify_history(&tx);
        assert_eq!(entry.kind, TxKind::AcquireError);
        assert_eq!(entry.ref_tx_hash.as_deref(), Some("ACQ1"));
        assert_eq!(entry.tenant.as_deref(), Some("rTENANT"));
    }

    #[test]
    fn terminate_memo_requires_token_id() {
        let tx = json!({
            "Account": "rTENANT",
            "hash": "TERM1",
            "ledger_index": 5u64,
            "Memos": build_memo("evnTerminateLease", &json!({})),
        });
        assert!(classify(&tx, "rHOST").is_none());

        let tx = json!({
            "Account": "rTENANT",
            "hash": "TERM1",
            "ledger_index": 5u64,
            "Memos": build_memo("evnTerminateLease", &json!({ "token_id": "T1" })),
        });
        assert!(matches!(
            classify(&tx, "rHOST"),
            Some(LedgerEvent::Terminate(t)) if t.token_id == "T1"
        ));
    }
}
