//! IIFL order API client.
//!
//! The broker publishes two JSON shapes: order placement/modification uses
//! the rich `_ReqData { head, body }` envelope with an `AppSource`
//! discriminator, while status and trade lookups use a flatter
//! `head`/`body` pair. Field names and ordering are reproduced exactly as
//! published; the broker rejects reordered bodies.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{Exchange, OrderKind, OrderSide, OrderStatus, ProductKind, Validity};
use crate::session::{BrokerSession, CredentialVault};

use super::{
    BrokerAdapter, BrokerError, BrokerPosition, MarginSnapshot, OrderDiff, OrderSpec, PlaceAck,
    StatusReport,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const OS_NAME: &str = "WEB";
const APP_SOURCE: i32 = 58;

/// Millisecond-epoch timestamp in the broker's bracket encoding.
fn broker_timestamp() -> String {
    format!("/Date({})/", Utc::now().timestamp_millis())
}

/// HTTP client for the IIFL order API.
pub struct IiflClient {
    http: Client,
    base_url: String,
    vault: Arc<CredentialVault>,
    /// Internal order sequence the broker echoes back; unique per process.
    order_seq: AtomicI64,
}

// ---- Wire shapes: order request (rich envelope) ----------------------

#[derive(Serialize, Clone)]
struct RequestHead {
    #[serde(rename = "requestCode")]
    request_code: String,
    key: String,
    #[serde(rename = "appVer")]
    app_ver: String,
    #[serde(rename = "appName")]
    app_name: String,
    #[serde(rename = "osName")]
    os_name: String,
    #[serde(rename = "userId")]
    user_id: String,
    password: String,
}

#[derive(Serialize, Clone)]
struct OrderRequestBody {
    #[serde(rename = "ClientCode")]
    client_code: String,
    #[serde(rename = "OrderFor")]
    order_for: String,
    #[serde(rename = "Exchange")]
    exchange: String,
    #[serde(rename = "ExchangeType")]
    exchange_type: String,
    #[serde(rename = "Price")]
    price: f64,
    #[serde(rename = "OrderID")]
    order_id: i64,
    #[serde(rename = "OrderType")]
    order_type: String,
    #[serde(rename = "Qty")]
    qty: i64,
    #[serde(rename = "OrderDateTime")]
    order_date_time: String,
    #[serde(rename = "ScripCode")]
    scrip_code: i64,
    #[serde(rename = "AtMarket")]
    at_market: bool,
    #[serde(rename = "RemoteOrderID")]
    remote_order_id: String,
    #[serde(rename = "ExchOrderID")]
    exch_order_id: String,
    #[serde(rename = "DisQty")]
    dis_qty: i64,
    #[serde(rename = "IsStopLossOrder")]
    is_stop_loss_order: bool,
    #[serde(rename = "StopLossPrice")]
    stop_loss_price: f64,
    #[serde(rename = "IsVTD")]
    is_vtd: bool,
    #[serde(rename = "IOCOrder")]
    ioc_order: bool,
    #[serde(rename = "IsIntraday")]
    is_intraday: bool,
    #[serde(rename = "PublicIP")]
    public_ip: String,
    #[serde(rename = "AHPlaced")]
    ah_placed: String,
    #[serde(rename = "ValidTillDate")]
    valid_till_date: String,
    #[serde(rename = "iOrderValidity")]
    i_order_validity: i32,
    #[serde(rename = "OrderRequesterCode")]
    order_requester_code: String,
    #[serde(rename = "TradedQty")]
    traded_qty: i64,
}

#[derive(Serialize, Clone)]
struct OrderReqData {
    head: RequestHead,
    body: OrderRequestBody,
}

#[derive(Serialize, Clone)]
struct OrderRequestEnvelope {
    #[serde(rename = "_ReqData")]
    req_data: OrderReqData,
    #[serde(rename = "AppSource")]
    app_source: i32,
}

// ---- Wire shapes: status / positions / margin (flat envelope) --------

#[derive(Serialize, Clone)]
struct FlatRequest<B: Serialize + Clone> {
    head: RequestHead,
    body: B,
}

#[derive(Serialize, Clone)]
struct StatusRequestBody {
    #[serde(rename = "ClientCode")]
    client_code: String,
    #[serde(rename = "OrdStatusReqList")]
    ord_status_req_list: Vec<StatusRequestItem>,
}

#[derive(Serialize, Clone)]
struct StatusRequestItem {
    #[serde(rename = "Exch")]
    exch: String,
    #[serde(rename = "ExchType")]
    exch_type: String,
    #[serde(rename = "ScripCode")]
    scrip_code: i64,
    #[serde(rename = "RemoteOrderID")]
    remote_order_id: String,
}

#[derive(Serialize, Clone)]
struct ClientCodeBody {
    #[serde(rename = "ClientCode")]
    client_code: String,
}

// ---- Wire shapes: responses ------------------------------------------

#[derive(Deserialize)]
struct ResponseHead {
    status: String,
    #[serde(rename = "statusDescription", default)]
    status_description: String,
}

#[derive(Deserialize)]
struct ResponseEnvelope<B> {
    head: ResponseHead,
    body: Option<B>,
}

#[derive(Deserialize)]
struct OrderResponseBody {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "BrokerOrderID", default)]
    broker_order_id: Option<serde_json::Value>,
    #[serde(rename = "ExchOrderID", default)]
    exch_order_id: Option<serde_json::Value>,
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Deserialize)]
struct StatusResponseBody {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "OrdStatusResLst", default)]
    orders: Vec<StatusResponseItem>,
}

#[derive(Deserialize)]
struct StatusResponseItem {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "ExchOrderID", default)]
    exch_order_id: Option<serde_json::Value>,
    #[serde(rename = "OrderQty", default)]
    order_qty: i64,
    #[serde(rename = "TradedQty", default)]
    traded_qty: i64,
    #[serde(rename = "OrderRate", default)]
    order_rate: f64,
}

#[derive(Deserialize)]
struct PositionsResponseBody {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "NetPositionDetail", default)]
    positions: Vec<PositionItem>,
}

#[derive(Deserialize)]
struct PositionItem {
    #[serde(rename = "ScripName", default)]
    scrip_name: String,
    #[serde(rename = "Exch", default)]
    exch: String,
    #[serde(rename = "NetQty", default)]
    net_qty: i64,
    #[serde(rename = "LTP", default)]
    ltp: f64,
}

#[derive(Deserialize)]
struct MarginResponseBody {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "AvailableMargin", default)]
    available: f64,
    #[serde(rename = "UtilizedMargin", default)]
    utilized: f64,
}

/// Numbers and strings both show up in broker id fields.
fn id_string(value: &Option<serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() && s != "0" => Some(s.clone()),
        Some(serde_json::Value::Number(n)) if n.as_i64() != Some(0) => Some(n.to_string()),
        _ => None,
    }
}

/// Map the broker's order status text onto the canonical set.
fn canonical_status(text: &str) -> OrderStatus {
    let lower = text.to_lowercase();
    if lower.contains("fully executed") || lower == "executed" {
        OrderStatus::Filled
    } else if lower.contains("partial") {
        OrderStatus::PartiallyFilled
    } else if lower.contains("reject") {
        OrderStatus::Rejected
    } else if lower.contains("cancel") {
        OrderStatus::Cancelled
    } else if lower.contains("pending") || lower.contains("placed") || lower.contains("modif") {
        OrderStatus::Submitted
    } else {
        OrderStatus::Unknown
    }
}

/// Outcome of one HTTP round trip, before auth recovery.
enum WireOutcome<B> {
    Ok(B),
    /// HTTP 401 or head.status "1": session no longer accepted.
    AuthRejected(String),
}

fn head_for(request_code: &str, session: &BrokerSession) -> RequestHead {
    let creds = &session.credentials;
    RequestHead {
        request_code: request_code.to_string(),
        key: creds.api_key.clone(),
        app_ver: creds.app_version.clone(),
        app_name: creds.app_name.clone(),
        os_name: OS_NAME.to_string(),
        user_id: creds.user_id.clone(),
        password: creds.password.clone(),
    }
}

fn order_body_for(
    session: &BrokerSession,
    spec: &OrderSpec,
    order_for: &str,
    order_seq: i64,
    exch_order_id: &str,
) -> OrderRequestBody {
    let creds = &session.credentials;
    OrderRequestBody {
        client_code: creds.client_code.clone(),
        order_for: order_for.to_string(),
        exchange: spec.exchange.wire_code().to_string(),
        exchange_type: spec.segment.clone(),
        price: spec.limit_price.and_then(|p| p.to_f64()).unwrap_or(0.0),
        order_id: order_seq,
        order_type: spec.side.as_str().to_string(),
        qty: spec.quantity,
        order_date_time: broker_timestamp(),
        scrip_code: spec.scrip_code,
        at_market: spec.kind == OrderKind::Market,
        remote_order_id: spec.client_token.clone(),
        exch_order_id: exch_order_id.to_string(),
        dis_qty: 0,
        is_stop_loss_order: spec.kind.has_trigger(),
        stop_loss_price: spec.trigger_price.and_then(|p| p.to_f64()).unwrap_or(0.0),
        is_vtd: spec.validity == Validity::GoodTillDate,
        ioc_order: spec.validity == Validity::Ioc,
        is_intraday: spec.product == ProductKind::Intraday,
        public_ip: creds.public_ip.clone(),
        ah_placed: "N".to_string(),
        valid_till_date: broker_timestamp(),
        i_order_validity: spec.validity.wire_code(),
        order_requester_code: creds.client_code.clone(),
        traded_qty: 0,
    }
}

impl IiflClient {
    pub fn new(base_url: &str, vault: Arc<CredentialVault>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            vault,
            order_seq: AtomicI64::new(1),
        })
    }

    /// POST one envelope and classify the response. No retry here.
    async fn post_once<Req: Serialize, Body: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        session: &BrokerSession,
        request: &Req,
    ) -> Result<WireOutcome<Body>, BrokerError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &session.credentials.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BrokerError::Timeout
                } else {
                    BrokerError::Transient(format!("network error: {e}"))
                }
            })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => {
                return Ok(WireOutcome::AuthRejected("HTTP 401".to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(BrokerError::Transient("HTTP 429".to_string()))
            }
            s if s.is_server_error() => return Err(BrokerError::Transient(format!("HTTP {s}"))),
            s if s.is_client_error() => {
                let body = response.text().await.unwrap_or_default();
                return Err(BrokerError::Permanent(format!("HTTP {s}: {body}")));
            }
            _ => {}
        }

        let envelope: ResponseEnvelope<Body> = response
            .json()
            .await
            .map_err(|e| BrokerError::Transient(format!("malformed response: {e}")))?;

        match envelope.head.status.as_str() {
            "0" => envelope
                .body
                .map(WireOutcome::Ok)
                .ok_or_else(|| BrokerError::Transient("response body missing".to_string())),
            "1" => Ok(WireOutcome::AuthRejected(envelope.head.status_description)),
            other => Err(BrokerError::Permanent(format!(
                "broker status {other}: {}",
                envelope.head.status_description
            ))),
        }
    }

    /// POST with the single allowed auth recovery: on rejection, refresh
    /// the session through the vault and replay once.
    async fn post_with_reauth<Body, Req>(
        &self,
        path: &str,
        session: &BrokerSession,
        build: impl Fn(&BrokerSession) -> Req,
    ) -> Result<Body, BrokerError>
    where
        Body: serde::de::DeserializeOwned,
        Req: Serialize,
    {
        let request = build(session);
        match self.post_once(path, session, &request).await? {
            WireOutcome::Ok(body) => Ok(body),
            WireOutcome::AuthRejected(reason) => {
                warn!(account = %session.account_id, %reason, "session rejected, re-authenticating");
                let fresh = self
                    .vault
                    .reauthenticate(&session.account_id)
                    .await
                    .map_err(|e| match e {
                        crate::session::VaultError::InvalidCredentials(_) => {
                            BrokerError::InvalidCredentials
                        }
                        crate::session::VaultError::AuthTransient(msg) => {
                            BrokerError::Transient(msg)
                        }
                    })?;
                let request = build(&fresh);
                match self.post_once(path, &fresh, &request).await? {
                    WireOutcome::Ok(body) => Ok(body),
                    WireOutcome::AuthRejected(_) => Err(BrokerError::InvalidCredentials),
                }
            }
        }
    }
}

#[async_trait]
impl BrokerAdapter for IiflClient {
    async fn place(
        &self,
        session: &BrokerSession,
        spec: &OrderSpec,
    ) -> Result<PlaceAck, BrokerError> {
        let order_seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        debug!(
            account = %session.account_id,
            scrip_code = spec.scrip_code,
            side = spec.side.as_str(),
            qty = spec.quantity,
            token = %spec.client_token,
            "placing order"
        );

        let body: OrderResponseBody = self
            .post_with_reauth("OrderRequest", session, |s| OrderRequestEnvelope {
                req_data: OrderReqData {
                    head: head_for("IIFLMarRQOrdReq", s),
                    body: order_body_for(s, spec, "P", order_seq, "0"),
                },
                app_source: APP_SOURCE,
            })
            .await?;

        if body.status == 0 {
            Ok(PlaceAck {
                broker_order_id: id_string(&body.broker_order_id)
                    .ok_or_else(|| BrokerError::Transient("missing broker order id".to_string()))?,
                exchange_order_id: id_string(&body.exch_order_id),
                status: OrderStatus::Submitted,
                message: Some(body.message),
            })
        } else {
            // Definitive RMS rejection: a canonical outcome, not an error.
            Ok(PlaceAck {
                broker_order_id: id_string(&body.broker_order_id).unwrap_or_default(),
                exchange_order_id: None,
                status: OrderStatus::Rejected,
                message: Some(body.message),
            })
        }
    }

    async fn status(
        &self,
        session: &BrokerSession,
        scrip_code: i64,
        exchange: Exchange,
        client_token: &str,
    ) -> Result<StatusReport, BrokerError> {
        let body: StatusResponseBody = self
            .post_with_reauth("OrderStatus", session, |s| FlatRequest {
                head: head_for("IIFLMarRQOrdStatus", s),
                body: StatusRequestBody {
                    client_code: s.credentials.client_code.clone(),
                    ord_status_req_list: vec![StatusRequestItem {
                        exch: exchange.wire_code().to_string(),
                        exch_type: "C".to_string(),
                        scrip_code,
                        remote_order_id: client_token.to_string(),
                    }],
                },
            })
            .await?;

        if body.status != 0 {
            return Err(BrokerError::Permanent(format!(
                "status lookup failed with broker status {}",
                body.status
            )));
        }
        let item = body
            .orders
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::Permanent("order not known to broker".to_string()))?;

        let mut status = canonical_status(&item.status);
        if status == OrderStatus::PartiallyFilled
            && item.order_qty > 0
            && item.traded_qty >= item.order_qty
        {
            status = OrderStatus::Filled;
        }
        Ok(StatusReport {
            status,
            exchange_order_id: id_string(&item.exch_order_id),
            filled_quantity: item.traded_qty,
            average_price: Decimal::try_from(item.order_rate).ok(),
            message: Some(item.status),
        })
    }

    async fn modify(
        &self,
        session: &BrokerSession,
        broker_order_id: &str,
        diff: &OrderDiff,
    ) -> Result<OrderStatus, BrokerError> {
        // Modification reuses the placement envelope with OrderFor = "M";
        // the broker identifies the resting order by ExchOrderID.
        let order_seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        let spec = OrderSpec {
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code: 0,
            side: OrderSide::Buy,
            kind: if diff.limit_price.is_some() {
                OrderKind::Limit
            } else {
                OrderKind::Market
            },
            quantity: diff.quantity.unwrap_or(0),
            limit_price: diff.limit_price,
            trigger_price: diff.trigger_price,
            product: ProductKind::Intraday,
            validity: Validity::Day,
            client_token: String::new(),
        };
        let body: OrderResponseBody = self
            .post_with_reauth("OrderRequest", session, |s| OrderRequestEnvelope {
                req_data: OrderReqData {
                    head: head_for("IIFLMarRQOrdReq", s),
                    body: order_body_for(s, &spec, "M", order_seq, broker_order_id),
                },
                app_source: APP_SOURCE,
            })
            .await?;
        Ok(if body.status == 0 {
            OrderStatus::Submitted
        } else {
            OrderStatus::Rejected
        })
    }

    async fn cancel(
        &self,
        session: &BrokerSession,
        broker_order_id: &str,
    ) -> Result<OrderStatus, BrokerError> {
        let order_seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        let spec = OrderSpec {
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code: 0,
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            quantity: 0,
            limit_price: None,
            trigger_price: None,
            product: ProductKind::Intraday,
            validity: Validity::Day,
            client_token: String::new(),
        };
        let body: OrderResponseBody = self
            .post_with_reauth("OrderRequest", session, |s| OrderRequestEnvelope {
                req_data: OrderReqData {
                    head: head_for("IIFLMarRQOrdReq", s),
                    body: order_body_for(s, &spec, "C", order_seq, broker_order_id),
                },
                app_source: APP_SOURCE,
            })
            .await?;
        Ok(if body.status == 0 {
            OrderStatus::Cancelled
        } else {
            OrderStatus::Rejected
        })
    }

    async fn positions(
        &self,
        session: &BrokerSession,
    ) -> Result<Vec<BrokerPosition>, BrokerError> {
        let body: PositionsResponseBody = self
            .post_with_reauth("NetPosition", session, |s| FlatRequest {
                head: head_for("IIFLMarRQNetPosition", s),
                body: ClientCodeBody {
                    client_code: s.credentials.client_code.clone(),
                },
            })
            .await?;
        if body.status != 0 {
            return Err(BrokerError::Permanent(format!(
                "positions lookup failed with broker status {}",
                body.status
            )));
        }
        Ok(body
            .positions
            .into_iter()
            .filter_map(|p| {
                Some(BrokerPosition {
                    symbol: p.scrip_name,
                    exchange: match p.exch.as_str() {
                        "N" => Exchange::Nse,
                        "B" => Exchange::Bse,
                        "M" => Exchange::Mcx,
                        _ => return None,
                    },
                    quantity: p.net_qty,
                    mark: Decimal::try_from(p.ltp).ok()?,
                })
            })
            .collect())
    }

    async fn margin(&self, session: &BrokerSession) -> Result<MarginSnapshot, BrokerError> {
        let body: MarginResponseBody = self
            .post_with_reauth("Margin", session, |s| FlatRequest {
                head: head_for("IIFLMarRQMargin", s),
                body: ClientCodeBody {
                    client_code: s.credentials.client_code.clone(),
                },
            })
            .await?;
        if body.status != 0 {
            return Err(BrokerError::Permanent(format!(
                "margin lookup failed with broker status {}",
                body.status
            )));
        }
        Ok(MarginSnapshot {
            available: Decimal::try_from(body.available)
                .map_err(|e| BrokerError::Permanent(format!("bad margin value: {e}")))?,
            utilized: Decimal::try_from(body.utilized).unwrap_or(Decimal::ZERO),
        })
    }

    async fn ping(&self) -> Result<Duration, BrokerError> {
        let start = Instant::now();
        self.http.get(&self.base_url).send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout
            } else {
                BrokerError::Transient(format!("ping failed: {e}"))
            }
        })?;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BrokerCredentials;

    fn test_session() -> BrokerSession {
        BrokerSession {
            account_id: "C123".to_string(),
            credentials: BrokerCredentials {
                client_code: "C123".to_string(),
                user_id: "user".to_string(),
                password: "pass".to_string(),
                api_key: "key".to_string(),
                app_name: "copyrelay".to_string(),
                app_version: "1.0.0".to_string(),
                public_ip: "203.0.113.7".to_string(),
            },
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(8),
        }
    }

    #[test]
    fn timestamp_is_bracket_encoded_epoch() {
        let ts = broker_timestamp();
        assert!(ts.starts_with("/Date("));
        assert!(ts.ends_with(")/"));
        let millis: i64 = ts["/Date(".len()..ts.len() - 2].parse().unwrap();
        assert!(millis > 1_600_000_000_000);
    }

    #[test]
    fn canonical_status_mapping() {
        assert_eq!(canonical_status("Fully Executed"), OrderStatus::Filled);
        assert_eq!(
            canonical_status("Partially Executed"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(canonical_status("Rejected By RMS"), OrderStatus::Rejected);
        assert_eq!(canonical_status("Cancelled"), OrderStatus::Cancelled);
        assert_eq!(canonical_status("Pending"), OrderStatus::Submitted);
        assert_eq!(canonical_status("Modified"), OrderStatus::Submitted);
        assert_eq!(canonical_status("???"), OrderStatus::Unknown);
    }

    #[test]
    fn id_string_handles_numbers_strings_and_zero() {
        assert_eq!(
            id_string(&Some(serde_json::json!(31379))),
            Some("31379".to_string())
        );
        assert_eq!(
            id_string(&Some(serde_json::json!("1100000000031379"))),
            Some("1100000000031379".to_string())
        );
        assert_eq!(id_string(&Some(serde_json::json!(0))), None);
        assert_eq!(id_string(&Some(serde_json::json!("0"))), None);
        assert_eq!(id_string(&Some(serde_json::json!(""))), None);
        assert_eq!(id_string(&None), None);
    }

    #[test]
    fn order_envelope_serializes_in_published_field_order() {
        let session = test_session();
        let spec = OrderSpec {
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code: 2885,
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            quantity: 10,
            limit_price: None,
            trigger_price: None,
            product: ProductKind::Intraday,
            validity: Validity::Day,
            client_token: "tok-1".to_string(),
        };

        let envelope = OrderRequestEnvelope {
            req_data: OrderReqData {
                head: head_for("IIFLMarRQOrdReq", &session),
                body: order_body_for(&session, &spec, "P", 1, "0"),
            },
            app_source: APP_SOURCE,
        };

        let json = serde_json::to_string(&envelope).unwrap();
        // Envelope wrapper and discriminator.
        assert!(json.starts_with(r#"{"_ReqData":{"head":{"requestCode":"IIFLMarRQOrdReq""#));
        assert!(json.ends_with(r#""AppSource":58}"#));
        // Body fields appear in the published order.
        let client_pos = json.find(r#""ClientCode""#).unwrap();
        let order_for_pos = json.find(r#""OrderFor""#).unwrap();
        let scrip_pos = json.find(r#""ScripCode""#).unwrap();
        let remote_pos = json.find(r#""RemoteOrderID""#).unwrap();
        let traded_pos = json.find(r#""TradedQty""#).unwrap();
        assert!(client_pos < order_for_pos);
        assert!(order_for_pos < scrip_pos);
        assert!(scrip_pos < remote_pos);
        assert!(remote_pos < traded_pos);
        // The idempotency token rides in RemoteOrderID.
        assert!(json.contains(r#""RemoteOrderID":"tok-1""#));
        // Market order: zero price, AtMarket set.
        assert!(json.contains(r#""Price":0.0"#));
        assert!(json.contains(r#""AtMarket":true"#));
    }

    #[test]
    fn limit_order_carries_price_and_validity() {
        let session = test_session();
        let spec = OrderSpec {
            exchange: Exchange::Bse,
            segment: "C".to_string(),
            scrip_code: 500325,
            side: OrderSide::Sell,
            kind: OrderKind::Limit,
            quantity: 5,
            limit_price: Some(rust_decimal_macros::dec!(2500.50)),
            trigger_price: None,
            product: ProductKind::Delivery,
            validity: Validity::Ioc,
            client_token: "tok-2".to_string(),
        };
        let body = order_body_for(&session, &spec, "P", 7, "0");
        assert_eq!(body.exchange, "B");
        assert_eq!(body.order_type, "SELL");
        assert!(!body.at_market);
        assert!((body.price - 2500.50).abs() < f64::EPSILON);
        assert!(body.ioc_order);
        assert!(!body.is_intraday);
        assert_eq!(body.i_order_validity, 3);
    }
}
