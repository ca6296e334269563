//! Integration tests for the full settlement pipeline.
//!
//! Command → EventStore (+ outbox) → OutboxPump → StreamBroker → StreamConsumer
//!
//! Verifies:
//! - Optimistic concurrency lets exactly one concurrent writer win
//! - The pump survives broker outages without losing messages
//! - Each bank only ever receives its own events
//! - A nacked event is reclaimed by a competing consumer and cannot be
//!   finalized twice
//! - The read projection converges when fed through the same pipeline

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value as JsonValue;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use instapay_core::{AccountId, AggregateId, BankId, DomainError, ExpectedVersion};
    use instapay_events::EventEnvelope;
    use instapay_transactions::{
        CompleteTransaction, ConfirmTransaction, EventKind, FailTransaction, StartTransaction,
        Transaction, TransactionCommand, TransactionEvent, TransactionId, TransactionStatus,
        projection_destination,
    };

    use crate::broker::{BrokerError, InMemoryStreamBroker, MessageId, StreamBroker, StreamMessage};
    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::consumer::{BatchHandler, ConsumeError, ConsumerConfig, StreamConsumer};
    use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, UncommittedEvent};
    use crate::outbox::{Backoff, OutboxPump, PumpConfig};
    use crate::projections::TransactionProjection;
    use crate::read_model::InMemoryReadModelStore;
    use crate::workers::ProjectionHandler;

    type Dispatcher = CommandDispatcher<Arc<InMemoryEventStore>>;

    fn pump_config() -> PumpConfig {
        PumpConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)))
    }

    fn consumer_config(group: &str, consumer: &str) -> ConsumerConfig {
        ConsumerConfig::new(group, consumer)
            .with_block(Duration::from_millis(20))
            .with_max_pending_age(Duration::from_millis(50))
    }

    fn setup() -> (Arc<InMemoryEventStore>, Arc<InMemoryStreamBroker>, Dispatcher) {
        let store = Arc::new(InMemoryEventStore::new());
        let broker = Arc::new(InMemoryStreamBroker::new());
        let dispatcher = CommandDispatcher::new(store.clone()).with_fan_out(projection_destination());
        (store, broker, dispatcher)
    }

    async fn drain_outbox<B: StreamBroker>(store: &Arc<InMemoryEventStore>, broker: B) -> usize {
        let pump = OutboxPump::new(store.clone(), broker, pump_config());
        let cancel = CancellationToken::new();
        let mut total = 0;
        loop {
            let n = pump.pump_once(&cancel).await.unwrap();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    async fn dispatch(d: &Dispatcher, cmd: TransactionCommand) -> Result<(), DispatchError> {
        let id = cmd.transaction_id();
        d.dispatch(id.0, "transaction", cmd, |id| Transaction::empty(TransactionId(id)))
            .await
            .map(|_| ())
    }

    async fn status(d: &Dispatcher, id: TransactionId) -> TransactionStatus {
        d.load(id.0, |id| Transaction::empty(TransactionId(id)))
            .await
            .unwrap()
            .status()
    }

    fn start(id: TransactionId, sender_bank: BankId, receiver_bank: BankId) -> TransactionCommand {
        TransactionCommand::Start(StartTransaction {
            transaction_id: id,
            issuer_bank: sender_bank,
            sender: AccountId::new(),
            sender_bank,
            receiver: AccountId::new(),
            receiver_bank,
            amount: 1_000,
            description: "rent".to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn confirm(id: TransactionId, issuer: BankId) -> TransactionCommand {
        TransactionCommand::Confirm(ConfirmTransaction {
            transaction_id: id,
            issuer_bank: issuer,
            occurred_at: Utc::now(),
        })
    }

    fn decode(msg: &StreamMessage) -> TransactionEvent {
        let env: EventEnvelope<JsonValue> = serde_json::from_str(&msg.payload).unwrap();
        env.decode::<TransactionEvent>().unwrap().into_payload()
    }

    #[tokio::test]
    async fn concurrent_appends_have_exactly_one_winner() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = AggregateId::new();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let ev = UncommittedEvent {
                    event_id: Uuid::now_v7(),
                    aggregate_id: id,
                    aggregate_type: "transaction".to_string(),
                    event_type: "transaction.started".to_string(),
                    event_version: 1,
                    occurred_at: Utc::now(),
                    payload: serde_json::json!({}),
                    publish_to: vec!["s".to_string()],
                };
                store.append(id, ExpectedVersion::Exact(0), vec![ev]).await
            }));
        }

        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => won += 1,
                Err(EventStoreError::Concurrency(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(store.load(id).await.unwrap().len(), 1);
        assert_eq!(store.unpublished_count().unwrap(), 1);
    }

    struct FlakyBroker {
        inner: InMemoryStreamBroker,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl StreamBroker for FlakyBroker {
        async fn publish(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BrokerError::Connection("broker down".to_string()));
            }
            self.inner.publish(stream, payload).await
        }

        async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
            self.inner.ensure_group(stream, group).await
        }

        async fn claim_stale(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            count: usize,
        ) -> Result<Vec<StreamMessage>, BrokerError> {
            self.inner.claim_stale(stream, group, consumer, min_idle, count).await
        }

        async fn read_new(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            block: Duration,
        ) -> Result<Vec<StreamMessage>, BrokerError> {
            self.inner.read_new(stream, group, consumer, count, block).await
        }

        async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<(), BrokerError> {
            self.inner.ack(stream, group, ids).await
        }
    }

    #[tokio::test]
    async fn pump_retries_through_a_broker_outage() {
        let (store, _, dispatcher) = setup();
        let broker = Arc::new(FlakyBroker {
            inner: InMemoryStreamBroker::new(),
            failures_left: AtomicUsize::new(3),
        });
        let (sender_bank, receiver_bank) = (BankId::new(), BankId::new());
        let id = TransactionId::new(AggregateId::new());
        dispatch(&dispatcher, start(id, sender_bank, receiver_bank)).await.unwrap();

        let published = drain_outbox(&store, broker.clone()).await;
        assert_eq!(published, 2);
        assert_eq!(store.unpublished_count().unwrap(), 0);
        assert_eq!(broker.failures_left.load(Ordering::SeqCst), 0);

        let started = EventKind::Started.destination(receiver_bank).stream_key();
        assert_eq!(broker.inner.stream_len(&started).unwrap(), 1);
        assert_eq!(
            broker
                .inner
                .stream_len(&projection_destination().stream_key())
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn pump_run_publishes_when_woken() {
        let (store, broker, _) = setup();
        let pump = OutboxPump::new(
            store.clone(),
            broker.clone(),
            pump_config().with_poll_interval(Duration::from_secs(60)),
        );
        let dispatcher = CommandDispatcher::new(store.clone()).with_outbox_waker(pump.waker());
        let cancel = CancellationToken::new();
        let runner = {
            let cancel = cancel.clone();
            tokio::spawn(async move { pump.run(&cancel).await })
        };

        let (sender_bank, receiver_bank) = (BankId::new(), BankId::new());
        let id = TransactionId::new(AggregateId::new());
        dispatch(&dispatcher, start(id, sender_bank, receiver_bank)).await.unwrap();

        let started = EventKind::Started.destination(receiver_bank).stream_key();
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.stream_len(&started).unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("woken pump should publish well before its poll interval");

        cancel.cancel();
        let result = runner.await.unwrap();
        assert!(matches!(result, Err(crate::outbox::OutboxError::Cancelled)));
    }

    #[tokio::test]
    async fn full_lifecycle_then_terminal_rejections() {
        let (store, broker, dispatcher) = setup();
        let (sender_bank, receiver_bank) = (BankId::new(), BankId::new());
        let id = TransactionId::new(AggregateId::new());

        dispatch(&dispatcher, start(id, sender_bank, receiver_bank)).await.unwrap();
        dispatch(&dispatcher, confirm(id, receiver_bank)).await.unwrap();
        dispatch(
            &dispatcher,
            TransactionCommand::Complete(CompleteTransaction {
                transaction_id: id,
                issuer_bank: sender_bank,
                occurred_at: Utc::now(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status(&dispatcher, id).await, TransactionStatus::Completed);

        let err = dispatch(&dispatcher, confirm(id, receiver_bank)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::StatusMismatch { .. })));
        let err = dispatch(
            &dispatcher,
            TransactionCommand::Fail(FailTransaction {
                transaction_id: id,
                issuer_bank: sender_bank,
                reason: "too late".to_string(),
                occurred_at: Utc::now(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::StatusMismatch { .. })));

        // Started + Confirmed + Completed, each to one bank plus the projection.
        assert_eq!(drain_outbox(&store, broker.clone()).await, 6);
        let to_sender = EventKind::Confirmed.destination(sender_bank).stream_key();
        let to_receiver = EventKind::Completed.destination(receiver_bank).stream_key();
        assert_eq!(broker.stream_len(&to_sender).unwrap(), 1);
        assert_eq!(broker.stream_len(&to_receiver).unwrap(), 1);
    }

    struct Collect {
        events: Vec<TransactionEvent>,
        want: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl BatchHandler for Collect {
        async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError> {
            self.events.extend(batch.iter().map(decode));
            if self.events.len() >= self.want {
                self.cancel.cancel();
            }
            Ok(vec![false; batch.len()])
        }
    }

    #[tokio::test]
    async fn each_bank_receives_exactly_its_own_started_events() {
        let (store, broker, dispatcher) = setup();
        let sender_bank = BankId::new();
        let banks: Vec<BankId> = (0..10).map(|_| BankId::new()).collect();

        let mut expected: HashMap<BankId, Vec<TransactionId>> = HashMap::new();
        for i in 0..100 {
            let receiver_bank = banks[i % banks.len()];
            let id = TransactionId::new(AggregateId::new());
            dispatch(&dispatcher, start(id, sender_bank, receiver_bank)).await.unwrap();
            expected.entry(receiver_bank).or_default().push(id);
        }
        assert_eq!(drain_outbox(&store, broker.clone()).await, 200);

        for bank in &banks {
            let stream = EventKind::Started.destination(*bank).stream_key();
            let cancel = CancellationToken::new();
            let mut handler = Collect {
                events: vec![],
                want: 10,
                cancel: cancel.clone(),
            };
            let consumer = StreamConsumer::new(broker.clone(), stream.clone(), consumer_config(&bank.to_string(), "c1"));
            let result = tokio::time::timeout(Duration::from_secs(5), consumer.run(&cancel, &mut handler))
                .await
                .expect("consumer should see its ten events");
            assert!(matches!(result, Err(ConsumeError::Cancelled)));

            let mut got: Vec<TransactionId> = handler
                .events
                .iter()
                .map(|ev| match ev {
                    TransactionEvent::Started(s) => {
                        assert_eq!(s.receiver_bank, *bank);
                        s.transaction_id
                    }
                    other => panic!("unexpected event on {stream}: {other:?}"),
                })
                .collect();
            let mut want = expected[bank].clone();
            got.sort_by_key(|id| id.0);
            want.sort_by_key(|id| id.0);
            assert_eq!(got, want);
            assert_eq!(broker.pending_count(&stream, &bank.to_string()).unwrap(), 0);
        }
    }

    struct NackOnce {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl BatchHandler for NackOnce {
        async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError> {
            self.cancel.cancel();
            Ok(vec![true; batch.len()])
        }
    }

    struct ConfirmOnDelivery {
        dispatcher: Arc<Dispatcher>,
        bank: BankId,
        confirmed: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl BatchHandler for ConfirmOnDelivery {
        async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError> {
            for msg in batch {
                let id = decode(msg).transaction_id();
                dispatch(&self.dispatcher, confirm(id, self.bank))
                    .await
                    .map_err(|e| ConsumeError::Handler(e.to_string()))?;
                self.confirmed += 1;
            }
            self.cancel.cancel();
            Ok(vec![false; batch.len()])
        }
    }

    #[tokio::test]
    async fn nacked_event_is_claimed_by_a_competing_consumer() {
        let (store, broker, dispatcher) = setup();
        let dispatcher = Arc::new(dispatcher);
        let (sender_bank, receiver_bank) = (BankId::new(), BankId::new());
        let id = TransactionId::new(AggregateId::new());
        dispatch(&dispatcher, start(id, sender_bank, receiver_bank)).await.unwrap();
        drain_outbox(&store, broker.clone()).await;

        let stream = EventKind::Started.destination(receiver_bank).stream_key();
        let group = receiver_bank.to_string();

        let cancel = CancellationToken::new();
        let first = StreamConsumer::new(broker.clone(), stream.clone(), consumer_config(&group, "c1"));
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            first.run(&cancel, &mut NackOnce { cancel: cancel.clone() }),
        )
        .await
        .expect("first consumer should stop after nacking");
        assert_eq!(broker.pending_count(&stream, &group).unwrap(), 1);

        let cancel = CancellationToken::new();
        let mut second_handler = ConfirmOnDelivery {
            dispatcher: dispatcher.clone(),
            bank: receiver_bank,
            confirmed: 0,
            cancel: cancel.clone(),
        };
        let second = StreamConsumer::new(broker.clone(), stream.clone(), consumer_config(&group, "c2"));
        let result = tokio::time::timeout(Duration::from_secs(5), second.run(&cancel, &mut second_handler))
            .await
            .expect("second consumer should claim the stale message");
        assert!(matches!(result, Err(ConsumeError::Cancelled)));
        assert_eq!(second_handler.confirmed, 1);
        assert_eq!(broker.pending_count(&stream, &group).unwrap(), 0);

        // A late duplicate Confirm cannot finalize the transaction twice.
        let err = dispatch(&dispatcher, confirm(id, receiver_bank)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::StatusMismatch { .. })));
        let tx = dispatcher
            .load(id.0, |id| Transaction::empty(TransactionId(id)))
            .await
            .unwrap();
        assert_eq!(tx.status(), TransactionStatus::Confirmed);
        assert_eq!(instapay_core::AggregateRoot::version(&tx), 2);
    }

    #[tokio::test]
    async fn projection_converges_through_the_pipeline() {
        let (store, broker, dispatcher) = setup();
        let (sender_bank, receiver_bank) = (BankId::new(), BankId::new());
        let id = TransactionId::new(AggregateId::new());
        dispatch(&dispatcher, start(id, sender_bank, receiver_bank)).await.unwrap();
        dispatch(&dispatcher, confirm(id, receiver_bank)).await.unwrap();
        dispatch(
            &dispatcher,
            TransactionCommand::Fail(FailTransaction {
                transaction_id: id,
                issuer_bank: sender_bank,
                reason: "insufficient funds".to_string(),
                occurred_at: Utc::now(),
            }),
        )
        .await
        .unwrap();
        drain_outbox(&store, broker.clone()).await;

        let projection = Arc::new(TransactionProjection::new(InMemoryReadModelStore::new()));
        let mut handler = ProjectionHandler::new(projection.clone());
        let consumer = StreamConsumer::new(
            broker.clone(),
            projection_destination().stream_key(),
            consumer_config("projection", "p1"),
        );
        let cancel = CancellationToken::new();
        let worker = {
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(&cancel, &mut handler).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(view) = projection.find(id) {
                    if view.status == TransactionStatus::Failed {
                        return view;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map(|view| {
            assert_eq!(view.version, 3);
            assert_eq!(view.reason_for_failing.as_deref(), Some("insufficient funds"));
        })
        .expect("projection should reach the failed state");

        cancel.cancel();
        let _ = worker.await.unwrap();

        // A rebuild from the log yields the same view.
        let rebuilt = TransactionProjection::new(InMemoryReadModelStore::new());
        assert_eq!(rebuilt.rebuild_from_store(store.as_ref()).await.unwrap(), 3);
        assert_eq!(rebuilt.find(id).unwrap(), projection.find(id).unwrap());
    }
}
