//! Alerts from several zones, enriched on separate threads, leave the
//! publisher in counter order.

use std::sync::Arc;
use std::time::Duration;

use attack_map::alert::{Destination, EnrichedAlert, RawEvent};
use attack_map::enrich::Enricher;
use attack_map::geo::NoGeoLookup;
use attack_map::publish::{Publisher, PublisherConfig};
use futures::StreamExt;
use pubsub::{Broker, LocalBroker};
use tokio_util::sync::CancellationToken;

const CHANNEL: &str = "attack-map-test";
const ZONES: usize = 4;
const EVENTS_PER_ZONE: usize = 1000;

fn event(zone: usize, i: usize) -> RawEvent {
    RawEvent::from_json(
        &serde_json::json!({
            "ClientIP": format!("10.{zone}.{}.{}", i / 256, i % 256),
            "ClientRequestHost": format!("zone-{zone}.example.com"),
        })
        .to_string(),
        &format!("zone-{zone}"),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_zones_publish_in_counter_order() {
    let total = ZONES * EVENTS_PER_ZONE;
    let broker = Arc::new(LocalBroker::with_capacity(total * 2));
    let mut subscription = broker.subscribe(CHANNEL).await.unwrap();

    let token = CancellationToken::new();
    let (publisher, publisher_task) = Publisher::spawn(
        broker.clone(),
        PublisherConfig {
            channel: CHANNEL.to_string(),
            queue_capacity: total,
            ..Default::default()
        },
        token.clone(),
    );
    let enricher = Enricher::new(Arc::new(NoGeoLookup), Destination::default());

    let zones: Vec<_> = (0..ZONES)
        .map(|zone| {
            let enricher = enricher.clone();
            let publisher = publisher.clone();
            std::thread::spawn(move || {
                for i in 0..EVENTS_PER_ZONE {
                    let queued =
                        enricher.enrich_with(&event(zone, i), |alert| publisher.submit(&alert));
                    assert!(queued);
                }
            })
        })
        .collect();
    for zone in zones {
        zone.join().unwrap();
    }
    drop(publisher);

    let mut counts = Vec::with_capacity(total);
    while counts.len() < total {
        let payload = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("alert not published in time")
            .expect("subscription ended")
            .unwrap();
        counts.push(EnrichedAlert::from_json(&payload).unwrap().event_count());
    }

    assert_eq!(counts, (1..=total as u64).collect::<Vec<_>>());

    tokio::time::timeout(Duration::from_secs(5), publisher_task)
        .await
        .unwrap()
        .unwrap();
}
