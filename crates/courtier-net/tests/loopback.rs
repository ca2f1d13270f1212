//! Server and client talking over a real socket on the loopback interface.

use courtier::{
    Broker, Command, CollectorConfig, GenerationCollector, Processable, ProcessingError,
    SerializationMode,
};
use courtier_net::{run_client, ClientConfig, NetConsumerConfig, NetworkedConsumer};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Doubler {
    value: f64,
}

impl Processable for Doubler {
    fn process(&mut self, _command: Command) -> Result<(), ProcessingError> {
        self.value *= 2.0;
        Ok(())
    }
}

fn net_config() -> NetConsumerConfig {
    NetConsumerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        serialization: SerializationMode::Binary,
        task_deadline: Duration::from_secs(10),
        get_timeout: Duration::from_millis(100),
    }
}

/// A full generation evaluated by one remote worker: every item comes back
/// evaluated with its payload processed, and the client sees the server
/// close as a clean end of session.
#[test]
fn generation_round_trips_through_a_remote_worker() {
    const ITEMS: usize = 10;

    let broker = Broker::with_defaults();
    let consumer = NetworkedConsumer::new(broker.clone(), net_config()).unwrap();
    let addr = consumer.local_addr();
    broker.enroll_consumer(Box::new(consumer)).unwrap();
    assert!(broker.needs_client());

    let client = thread::spawn(move || {
        run_client::<Doubler>(&ClientConfig {
            addr: addr.to_string(),
            mnemonic: "nc".into(),
            serialization: SerializationMode::Binary,
        })
    });

    let config = CollectorConfig {
        first_item_timeout: Some(Duration::from_secs(10)),
        wait_factor: 5,
        ..CollectorConfig::default()
    };
    let mut collector = GenerationCollector::new(&broker, config).unwrap();
    let payloads = (0..ITEMS)
        .map(|i| Doubler { value: i as f64 })
        .collect::<Vec<_>>();
    let generation = collector
        .run_generation(0, Command::Evaluate, payloads)
        .unwrap();

    assert_eq!(generation.slots.len(), ITEMS);
    for (index, slot) in generation.slots.iter().enumerate() {
        assert!(slot.evaluated);
        assert!(!slot.synthetic);
        assert_eq!(slot.payload.value, index as f64 * 2.0);
    }

    broker.shutdown();
    let stats = client.join().unwrap().unwrap();
    assert_eq!(stats.processed, ITEMS as u64);
    assert_eq!(stats.failed, 0);
}

/// Text mode works end to end as well; the format is a configuration knob,
/// not a code path fork.
#[test]
fn text_mode_round_trips() {
    let broker = Broker::with_defaults();
    let consumer = NetworkedConsumer::new(
        broker.clone(),
        NetConsumerConfig {
            serialization: SerializationMode::Text,
            ..net_config()
        },
    )
    .unwrap();
    let addr = consumer.local_addr();
    broker.enroll_consumer(Box::new(consumer)).unwrap();

    let client = thread::spawn(move || {
        run_client::<Doubler>(&ClientConfig {
            addr: addr.to_string(),
            mnemonic: "nc".into(),
            serialization: SerializationMode::Text,
        })
    });

    let config = CollectorConfig {
        first_item_timeout: Some(Duration::from_secs(10)),
        ..CollectorConfig::default()
    };
    let mut collector = GenerationCollector::new(&broker, config).unwrap();
    let generation = collector
        .run_generation(0, Command::Evaluate, vec![Doubler { value: 21.0 }])
        .unwrap();
    assert_eq!(generation.slots[0].payload.value, 42.0);

    broker.shutdown();
    client.join().unwrap().unwrap();
}
