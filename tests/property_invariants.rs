//! Property tests for the ordering, lifecycle and loss-visibility
//! invariants.

use proptest::prelude::*;

use caravel::domain::models::{
    AgentCommand, AgentCommandKind, AppId, DeploymentId, DeploymentStatus, Event, EventFilter,
    ServerId,
};
use caravel::services::{CommandQueue, EventFabric, TokenStore};

fn any_status() -> impl Strategy<Value = DeploymentStatus> {
    prop_oneof![
        Just(DeploymentStatus::Pending),
        Just(DeploymentStatus::Running),
        Just(DeploymentStatus::Success),
        Just(DeploymentStatus::Failed),
        Just(DeploymentStatus::Cancelled),
    ]
}

proptest! {
    /// Terminal deployment statuses admit no outgoing transition.
    #[test]
    fn prop_deployment_status_is_forward_only(from in any_status(), to in any_status()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
        // And nothing ever transitions back to pending.
        prop_assert!(!from.can_transition_to(DeploymentStatus::Pending));
    }

    /// Commands drain in enqueue order regardless of how the drains are
    /// interleaved with the enqueues.
    #[test]
    fn prop_command_queue_is_fifo(
        payloads in proptest::collection::vec("[a-z0-9]{1,12}", 1..40),
        drain_points in proptest::collection::vec(any::<bool>(), 1..40),
    ) {
        let queue = CommandQueue::new();
        let server = ServerId::new();

        let mut delivered: Vec<String> = Vec::new();
        let mut drains = drain_points.iter().cycle();
        for payload in &payloads {
            queue.enqueue(
                server,
                AgentCommand::with_payload(AgentCommandKind::UpdateAgent, payload.clone()),
            );
            if *drains.next().unwrap() {
                delivered.extend(queue.drain(server).into_iter().map(|c| c.payload));
            }
        }
        delivered.extend(queue.drain(server).into_iter().map(|c| c.payload));

        // Every command is delivered exactly once, in order.
        prop_assert_eq!(delivered, payloads);
        // And nothing can be delivered twice.
        prop_assert!(queue.drain(server).is_empty());
    }

    /// A validated token never validates again, no matter how many other
    /// tokens are outstanding.
    #[test]
    fn prop_tokens_are_single_use(extra in 0usize..16) {
        let store = TokenStore::new(std::time::Duration::from_secs(300));
        for _ in 0..extra {
            store.issue();
        }
        let token = store.issue();
        prop_assert!(store.validate(&token));
        prop_assert!(!store.validate(&token));
        prop_assert!(!store.validate(&token));
    }

    /// Overflowing a subscriber surfaces the exact number of lost events
    /// on the next delivery; nothing is lost silently.
    #[test]
    fn prop_fabric_overflow_is_visible(capacity in 1usize..16, publishes in 1usize..64) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let fabric = EventFabric::new();
            let app = AppId::new();
            let mut sub = fabric.subscribe_with_capacity(EventFilter::all().for_app(app), capacity);

            for i in 0..publishes {
                fabric.publish(&Event::deploy_log(app, DeploymentId::new(), format!("line-{i}")));
            }

            let expected_dropped = publishes.saturating_sub(capacity) as u64;
            let first = sub.next().await.unwrap();
            assert_eq!(first.dropped, expected_dropped);

            // Everything still buffered arrives exactly once, in order.
            let mut received = 1;
            while let Some(delivery) = sub.try_next() {
                assert_eq!(delivery.dropped, 0);
                received += 1;
            }
            assert_eq!(received, publishes.min(capacity));
        });
    }
}
