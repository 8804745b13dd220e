//! Message routing core.
//!
//! Every inbound message, whether it arrived over HTTP, a socket frame, or
//! the broker consumer, passes through [`Router::route`]. Classification is
//! a pure function over the message; dispatch then pushes to client sockets,
//! publishes to the broker, or defers to the HTTP fallback queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::broker::{BrokerTransport, routing_key_for};
use crate::clients::ClientRegistry;
use crate::domain_types::{ClientId, CorrelationId, MissionId};
use crate::error::{BrokerError, RouterError};
use crate::fallback::{FallbackEntry, FallbackQueues};
use crate::message::{MISSION_CONTROL, Message, MessageType, RECIPIENT_POSTOFFICE, RECIPIENT_USER};
use crate::mission_index::MissionIndex;

/// Where a message entered the process. Determines where an RPC response
/// goes and which token accompanies fallback deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOrigin {
    Http,
    Client(ClientId),
    Broker,
    /// Synthesized inside this process (e.g. the disconnect pause).
    Internal,
}

/// What the router did with a message.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Handed off for asynchronous delivery (broker or fallback queue).
    Accepted,
    /// Pushed toward this many client sockets (live or offline-queued).
    DeliveredToClients(usize),
    /// Synchronous RPC completed; the response belongs to the caller.
    RpcResponse(Box<Message>),
    /// Unroutable; logged and discarded.
    Dropped,
}

/// Resolved delivery target of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Statistics frames: unicast, mission fan-out, or broadcast; never the
    /// broker.
    Statistics,
    ToClient(ClientId),
    ToMission(MissionId),
    ToAllClients,
    ToService(String),
    Drop,
}

/// Classifies a message against this broker's own id. Rules are evaluated
/// in a fixed order; the first match wins.
#[must_use]
pub fn classify(message: &Message, self_id: &str) -> Disposition {
    // Statistics are high-volume and must never transit the broker.
    if message.kind == MessageType::Statistics {
        return Disposition::Statistics;
    }

    let recipient = message.recipient_tag();

    // User chat addressed at mission control is a service message even
    // though a client id may ride along.
    if message.kind == MessageType::UserMessage && recipient == Some(MISSION_CONTROL) {
        return Disposition::ToService(MISSION_CONTROL.to_string());
    }

    if let Some(client_id) = message.addressed_client() {
        let to_self =
            recipient == Some(self_id) || recipient == Some(RECIPIENT_POSTOFFICE);
        if to_self || recipient == Some(RECIPIENT_USER) {
            return Disposition::ToClient(client_id);
        }
    }

    if recipient == Some(RECIPIENT_USER) {
        if let Some(mission_id) = message.addressed_mission() {
            return Disposition::ToMission(mission_id);
        }
        return Disposition::ToAllClients;
    }

    match recipient {
        Some(service) => Disposition::ToService(service.to_string()),
        None => Disposition::Drop,
    }
}

/// Central routing policy.
pub struct Router {
    self_id: String,
    clients: Arc<ClientRegistry>,
    missions: Arc<MissionIndex>,
    broker: Arc<dyn BrokerTransport>,
    fallback: Arc<FallbackQueues>,
    next_id: AtomicU64,
}

impl Router {
    #[must_use]
    pub fn new(
        self_id: String,
        clients: Arc<ClientRegistry>,
        missions: Arc<MissionIndex>,
        broker: Arc<dyn BrokerTransport>,
        fallback: Arc<FallbackQueues>,
    ) -> Self {
        Self {
            self_id,
            clients,
            missions,
            broker,
            fallback,
            next_id: AtomicU64::new(1),
        }
    }

    /// Routes one message. Per-message failures are contained: the worst
    /// outcome for the process is a logged drop.
    pub async fn route(
        &self,
        mut message: Message,
        origin: MessageOrigin,
    ) -> Result<RouteOutcome, RouterError> {
        if message.id.is_none() {
            message.id = Some(self.next_id.fetch_add(1, Ordering::Relaxed));
        }
        let disposition = classify(&message, &self.self_id);
        debug!(
            id = message.id,
            kind = %message.kind,
            ?disposition,
            "routing message"
        );

        match disposition {
            Disposition::Statistics => Ok(self.dispatch_statistics(message)),
            Disposition::ToClient(client_id) => {
                self.clients.send_to_client(&client_id, message);
                Ok(RouteOutcome::DeliveredToClients(1))
            }
            Disposition::ToMission(mission_id) => {
                Ok(RouteOutcome::DeliveredToClients(
                    self.fan_out_mission(&mission_id, &message),
                ))
            }
            Disposition::ToAllClients => {
                let (delivered, _failed) = self.clients.broadcast(&message);
                Ok(RouteOutcome::DeliveredToClients(delivered))
            }
            Disposition::ToService(service) => {
                self.dispatch_service(service, message, origin).await
            }
            Disposition::Drop => {
                warn!(id = message.id, kind = %message.kind, "unroutable message dropped");
                Ok(RouteOutcome::Dropped)
            }
        }
    }

    /// Delivers a message to every client of a mission. An unknown mission
    /// is logged and the call is a no-op.
    pub fn fan_out_mission(&self, mission_id: &MissionId, message: &Message) -> usize {
        let members = self.missions.clients_of(mission_id);
        if members.is_empty() {
            warn!(mission = %mission_id, "no clients mapped to mission");
            return 0;
        }
        for client_id in &members {
            self.clients.send_to_client(client_id, message.clone());
        }
        members.len()
    }

    fn dispatch_statistics(&self, message: Message) -> RouteOutcome {
        if let Some(client_id) = message.addressed_client() {
            self.clients.send_to_client(&client_id, message);
            return RouteOutcome::DeliveredToClients(1);
        }
        if let Some(mission_id) = message.addressed_mission() {
            return RouteOutcome::DeliveredToClients(
                self.fan_out_mission(&mission_id, &message),
            );
        }
        let (delivered, _failed) = self.clients.broadcast(&message);
        RouteOutcome::DeliveredToClients(delivered)
    }

    async fn dispatch_service(
        &self,
        service: String,
        mut message: Message,
        origin: MessageOrigin,
    ) -> Result<RouteOutcome, RouterError> {
        // A self-addressed service message is either a late RPC reply or a
        // routing mistake; publishing it would loop through the exchange.
        if service == self.self_id || service == RECIPIENT_POSTOFFICE {
            let message_id = message.id;
            if let Some(correlation_id) = message.correlation_id.clone() {
                if self.broker.complete_reply(&correlation_id, message) {
                    return Ok(RouteOutcome::Accepted);
                }
            }
            warn!(id = message_id, "self-addressed message with no waiter dropped");
            return Ok(RouteOutcome::Dropped);
        }

        if !self.broker.is_connected() {
            self.defer_to_fallback(&service, message, &origin);
            return Ok(RouteOutcome::Accepted);
        }

        if message.requires_sync() && message.reply_to.is_none() {
            return self.dispatch_rpc(&service, message, origin).await;
        }

        let routing_key = routing_key_for(&service);

        // Published messages on the sync path must carry a correlation id,
        // even when the sender is orchestrating its own reply queue.
        if message.requires_sync() && message.correlation_id.is_none() {
            message.correlation_id = Some(CorrelationId::generate().to_string());
        }

        match self.broker.publish(&routing_key, &message).await {
            Ok(()) => Ok(RouteOutcome::Accepted),
            Err(err) => {
                warn!(%err, %service, "publish failed, deferring to HTTP fallback");
                self.defer_to_fallback(&service, message, &origin);
                Ok(RouteOutcome::Accepted)
            }
        }
    }

    async fn dispatch_rpc(
        &self,
        service: &str,
        message: Message,
        origin: MessageOrigin,
    ) -> Result<RouteOutcome, RouterError> {
        let routing_key = routing_key_for(service);
        match self.broker.request(&routing_key, message.clone()).await {
            Ok(response) => match origin {
                MessageOrigin::Client(client_id) => {
                    self.clients.send_to_client(&client_id, response);
                    Ok(RouteOutcome::DeliveredToClients(1))
                }
                MessageOrigin::Http | MessageOrigin::Internal => {
                    Ok(RouteOutcome::RpcResponse(Box::new(response)))
                }
                MessageOrigin::Broker => {
                    match message.sender.as_deref() {
                        Some(sender) => {
                            self.broker
                                .publish(&routing_key_for(sender), &response)
                                .await?;
                            Ok(RouteOutcome::Accepted)
                        }
                        None => {
                            warn!("RPC response with no return address dropped");
                            Ok(RouteOutcome::Dropped)
                        }
                    }
                }
            },
            Err(BrokerError::ReplyTimeout { timeout_ms }) => {
                Err(RouterError::RpcTimeout { timeout_ms })
            }
            Err(BrokerError::NotConnected | BrokerError::Publish(_)) => {
                self.defer_to_fallback(service, message, &origin);
                Ok(RouteOutcome::Accepted)
            }
            Err(err) => Err(RouterError::Broker(err)),
        }
    }

    fn defer_to_fallback(&self, service: &str, message: Message, origin: &MessageOrigin) {
        let token = match origin {
            MessageOrigin::Client(client_id) => self.clients.token_of(client_id),
            _ => None,
        };
        self.fallback
            .enqueue(service, FallbackEntry { message, token });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockBroker;

    fn parse(json: &str) -> Message {
        serde_json::from_str(json).unwrap()
    }

    /// Consumes the `CONNECTION_CONFIRMED` frame a fresh connection gets.
    async fn expect_confirmation(conn: &mut crate::clients::Connection) {
        let frame = conn.outbound.recv().await.unwrap();
        assert_eq!(frame.kind, MessageType::ConnectionConfirmed);
    }

    fn test_router(
        connected: bool,
    ) -> (
        Router,
        Arc<ClientRegistry>,
        Arc<MissionIndex>,
        Arc<FallbackQueues>,
        Arc<MockBroker>,
    ) {
        let clients = Arc::new(ClientRegistry::new(100));
        let missions = Arc::new(MissionIndex::new());
        let fallback = Arc::new(FallbackQueues::new());
        let broker = Arc::new(MockBroker::new(connected));
        let router = Router::new(
            "PostOffice".to_string(),
            Arc::clone(&clients),
            Arc::clone(&missions),
            broker.clone() as Arc<dyn BrokerTransport>,
            Arc::clone(&fallback),
        );
        (router, clients, missions, fallback, broker)
    }

    #[test]
    fn statistics_classify_ahead_of_everything() {
        let msg = parse(r#"{"type":"agentStatistics","recipient":"Brain","clientId":"C1"}"#);
        assert_eq!(classify(&msg, "PostOffice"), Disposition::Statistics);
    }

    #[test]
    fn user_message_to_mission_control_is_service_bound() {
        let msg =
            parse(r#"{"type":"userMessage","recipient":"MissionControl","clientId":"C1"}"#);
        assert_eq!(
            classify(&msg, "PostOffice"),
            Disposition::ToService("MissionControl".to_string())
        );
    }

    #[test]
    fn client_addressed_self_messages_go_to_client() {
        let msg = parse(r#"{"type":"RESPONSE","recipient":"PostOffice","clientId":"C1"}"#);
        assert_eq!(
            classify(&msg, "po-7"),
            Disposition::ToClient(ClientId::canonicalize("C1").unwrap())
        );

        let msg = parse(r#"{"type":"RESPONSE","recipient":"po-7","content":{"clientId":"C2"}}"#);
        assert_eq!(
            classify(&msg, "po-7"),
            Disposition::ToClient(ClientId::canonicalize("C2").unwrap())
        );
    }

    #[test]
    fn user_recipient_with_client_id_unicasts() {
        let msg = parse(r#"{"type":"USER_MESSAGE","recipient":"user","clientId":"C1"}"#);
        assert_eq!(
            classify(&msg, "PostOffice"),
            Disposition::ToClient(ClientId::canonicalize("C1").unwrap())
        );
    }

    #[test]
    fn user_recipient_with_mission_fans_out() {
        let msg = parse(r#"{"type":"USER_MESSAGE","recipient":"user","missionId":"M1"}"#);
        assert_eq!(
            classify(&msg, "PostOffice"),
            Disposition::ToMission(MissionId::try_new("M1".to_string()).unwrap())
        );
    }

    #[test]
    fn bare_user_recipient_broadcasts() {
        let msg = parse(r#"{"type":"USER_MESSAGE","recipient":"user"}"#);
        assert_eq!(classify(&msg, "PostOffice"), Disposition::ToAllClients);
    }

    #[test]
    fn named_recipient_is_service_bound() {
        let msg = parse(r#"{"type":"REQUEST","recipient":"Librarian"}"#);
        assert_eq!(
            classify(&msg, "PostOffice"),
            Disposition::ToService("Librarian".to_string())
        );
    }

    #[test]
    fn empty_recipient_drops() {
        let msg = parse(r#"{"type":"WORK_PRODUCT","recipient":""}"#);
        assert_eq!(classify(&msg, "PostOffice"), Disposition::Drop);
        let msg = parse(r#"{"type":"WORK_PRODUCT"}"#);
        assert_eq!(classify(&msg, "PostOffice"), Disposition::Drop);
    }

    #[tokio::test]
    async fn statistics_unicast_to_named_client() {
        let (router, clients, _, _, _) = test_router(true);
        let mut conn = clients.connect(ClientId::canonicalize("C1").unwrap(), None);
        expect_confirmation(&mut conn).await;

        let msg = parse(
            r#"{"type":"STATISTICS","recipient":"user","clientId":"C1","content":{"missionId":"M1","stats":{"tasks":3}}}"#,
        );
        let input_content = msg.content.clone();
        router.route(msg, MessageOrigin::Http).await.unwrap();

        let received = conn.outbound.recv().await.unwrap();
        assert_eq!(received.content, input_content);
    }

    #[tokio::test]
    async fn statistics_without_client_target_reach_mission_members() {
        let (router, clients, missions, _, _) = test_router(true);
        let c1 = ClientId::canonicalize("C1").unwrap();
        let mut conn = clients.connect(c1.clone(), None);
        expect_confirmation(&mut conn).await;
        missions.associate(c1, MissionId::try_new("M1".to_string()).unwrap());

        let msg = parse(r#"{"type":"STATISTICS","recipient":"user","content":{"missionId":"M1"}}"#);
        router.route(msg, MessageOrigin::Http).await.unwrap();
        assert_eq!(
            conn.outbound.recv().await.unwrap().kind,
            MessageType::Statistics
        );
    }

    #[tokio::test]
    async fn mission_fan_out_reaches_all_members() {
        let (router, clients, missions, _, _) = test_router(true);
        let m1 = MissionId::try_new("M1".to_string()).unwrap();
        let c1 = ClientId::canonicalize("C1").unwrap();
        let c2 = ClientId::canonicalize("C2").unwrap();
        let c3 = ClientId::canonicalize("C3").unwrap();
        let mut conn1 = clients.connect(c1.clone(), None);
        let mut conn2 = clients.connect(c2.clone(), None);
        let mut conn3 = clients.connect(c3.clone(), None);
        expect_confirmation(&mut conn1).await;
        expect_confirmation(&mut conn2).await;
        expect_confirmation(&mut conn3).await;
        missions.associate(c1, m1.clone());
        missions.associate(c2, m1);

        let msg =
            parse(r#"{"type":"USER_MESSAGE","recipient":"user","missionId":"M1","content":"hi"}"#);
        let outcome = router.route(msg, MessageOrigin::Http).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::DeliveredToClients(2)));

        assert_eq!(conn1.outbound.recv().await.unwrap().content, "hi");
        assert_eq!(conn2.outbound.recv().await.unwrap().content, "hi");
        assert!(conn3.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn service_bound_publishes_when_broker_up() {
        let (router, _, _, fallback, broker) = test_router(true);
        let msg = parse(r#"{"type":"WORK_ITEM","recipient":"Librarian","content":{}}"#);
        router.route(msg, MessageOrigin::Http).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "message.Librarian");
        assert_eq!(fallback.total_depth(), 0);
    }

    #[tokio::test]
    async fn service_bound_defers_to_fallback_when_broker_down() {
        let (router, _, _, fallback, broker) = test_router(false);
        let msg = parse(r#"{"type":"REQUEST","recipient":"Librarian","content":{}}"#);
        let outcome = router.route(msg, MessageOrigin::Http).await.unwrap();

        assert!(matches!(outcome, RouteOutcome::Accepted));
        assert_eq!(fallback.depth("Librarian"), 1);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn sync_request_returns_rpc_response_to_http_origin() {
        let (router, _, _, _, broker) = test_router(true);
        let msg = parse(r#"{"type":"REQUEST","recipient":"Brain","content":{}}"#);
        let outcome = router.route(msg, MessageOrigin::Http).await.unwrap();

        let RouteOutcome::RpcResponse(response) = outcome else {
            panic!("expected RPC response");
        };
        assert_eq!(response.kind, MessageType::Response);

        let published = broker.published();
        assert_eq!(published[0].0, "message.Brain");
    }

    #[tokio::test]
    async fn sync_request_from_client_replies_to_its_socket() {
        let (router, clients, _, _, _) = test_router(true);
        let c1 = ClientId::canonicalize("C1").unwrap();
        let mut conn = clients.connect(c1.clone(), None);
        expect_confirmation(&mut conn).await;

        let msg = parse(r#"{"type":"REQUEST","recipient":"Brain","content":{}}"#);
        router.route(msg, MessageOrigin::Client(c1)).await.unwrap();

        assert_eq!(
            conn.outbound.recv().await.unwrap().kind,
            MessageType::Response
        );
    }

    #[tokio::test]
    async fn caller_supplied_reply_to_skips_local_waiter() {
        let (router, _, _, _, broker) = test_router(true);
        let msg = parse(
            r#"{"type":"REQUEST","sender":"Engineer","recipient":"Brain","replyTo":"engineer.replies","correlationId":"corr-1","content":{}}"#,
        );
        router.route(msg, MessageOrigin::Broker).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.reply_to.as_deref(), Some("engineer.replies"));
        assert_eq!(published[0].1.correlation_id.as_deref(), Some("corr-1"));
    }

    #[tokio::test]
    async fn messages_get_monotone_local_ids() {
        let (router, _, _, _, broker) = test_router(true);
        for _ in 0..3 {
            let msg = parse(r#"{"type":"NOTE","recipient":"Librarian"}"#);
            router.route(msg, MessageOrigin::Http).await.unwrap();
        }
        let published = broker.published();
        let ids: Vec<u64> = published.iter().map(|(_, m)| m.id.unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
