//! Full-stack tests over the demo ECU: serialized channel, telemetry
//! sampling, map commit and ECU sync, and candidate generation from live
//! history.

use boostlab_core::cancel::CancelToken;
use boostlab_core::demo::DemoEcu;
use boostlab_core::maps::{MapId, MapStore, SyncState};
use boostlab_core::params::ParameterTable;
use boostlab_core::protocol::{CommunicationChannel, EcuChannel, Link, LinkConfig};
use boostlab_core::recommend::{KnockBiasScorer, RecommendationEngine};
use boostlab_core::telemetry::{Sampler, SamplerConfig};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct SharedEcu(Arc<Mutex<DemoEcu>>);

impl SharedEcu {
    fn new(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(DemoEcu::new(seed))))
    }
}

impl Read for SharedEcu {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().unwrap().read(buf)
    }
}

impl Write for SharedEcu {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl CommunicationChannel for SharedEcu {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.lock().unwrap().set_timeout(timeout)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().clear_input_buffer()
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.0.lock().unwrap().bytes_to_read()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spawn_channel(ecu: &SharedEcu) -> (EcuChannel, Arc<ParameterTable>) {
    init_tracing();
    let config = LinkConfig {
        frame_timeout: Duration::from_millis(200),
        ..LinkConfig::default()
    };
    let link = Link::from_channel(Box::new(ecu.clone()), config);
    let table = Arc::new(ParameterTable::builtin());
    let channel = EcuChannel::spawn(link, Arc::clone(&table));
    (channel, table)
}

#[test]
fn test_sampler_over_live_channel() {
    let ecu = SharedEcu::new(7);
    let (channel, table) = spawn_channel(&ecu);

    let mut sampler = Sampler::new(
        Box::new(channel.handle()),
        table,
        SamplerConfig {
            parameters: vec![
                "rpm".into(),
                "engine_load".into(),
                "map_kpa".into(),
                "afr".into(),
                "knock_retard".into(),
            ],
            ..SamplerConfig::default()
        },
    );

    for _ in 0..10 {
        let snapshot = sampler.cycle();
        assert!(snapshot.all_fresh(&["rpm", "engine_load", "map_kpa", "afr", "knock_retard"]));
        let rpm = snapshot.value("rpm").unwrap();
        assert!((850.0..=6800.0).contains(&rpm), "implausible rpm {rpm}");
    }
    assert_eq!(sampler.history_view().len(), 10);

    channel.shutdown();
}

#[test]
fn test_commit_then_sync_reaches_ecu() {
    let ecu = SharedEcu::new(7);
    let (channel, _table) = spawn_channel(&ecu);
    let handle = channel.handle();

    let mut store = MapStore::with_defaults();
    let mut txn = store.begin_write(MapId::BoostTarget).unwrap();
    txn.set_cell(5, 4, 170.0);
    let version = store.commit(txn, Some(&handle)).unwrap();
    assert_eq!(version, 2);

    // A healthy link means the commit itself carried the cell over
    assert_eq!(store.sync_state(MapId::BoostTarget), SyncState::Synced);

    channel.shutdown();
    assert_eq!(
        ecu.0.lock().unwrap().map_cell(MapId::BoostTarget, 5, 4),
        Some(170.0)
    );
}

#[test]
fn test_failed_sync_resumes_after_recovery() {
    let ecu = SharedEcu::new(7);
    let (channel, _table) = spawn_channel(&ecu);
    let handle = channel.handle();

    // Swallow enough responses to exhaust the channel's transient retries
    {
        let mut guard = ecu.0.lock().unwrap();
        for _ in 0..4 {
            guard.drop_next_response();
        }
    }

    let mut store = MapStore::with_defaults();
    let mut txn = store.begin_write(MapId::IgnitionTiming).unwrap();
    txn.set_cell(3, 2, 18.0);
    store.commit(txn, Some(&handle)).unwrap();
    assert!(
        matches!(
            store.sync_state(MapId::IgnitionTiming),
            SyncState::Pending { .. }
        ),
        "cell should stay pending after a dead push"
    );

    let remaining = store.retry_sync(MapId::IgnitionTiming, &handle).unwrap();
    assert_eq!(remaining, 0);

    channel.shutdown();
    assert_eq!(
        ecu.0.lock().unwrap().map_cell(MapId::IgnitionTiming, 3, 2),
        Some(18.0)
    );
}

#[test]
fn test_candidate_generation_from_live_history() {
    let ecu = SharedEcu::new(7);
    let (channel, table) = spawn_channel(&ecu);

    let mut sampler = Sampler::new(
        Box::new(channel.handle()),
        table,
        SamplerConfig {
            parameters: vec![
                "rpm".into(),
                "engine_load".into(),
                "map_kpa".into(),
                "afr".into(),
                "knock_retard".into(),
            ],
            ..SamplerConfig::default()
        },
    );
    for _ in 0..200 {
        sampler.cycle();
    }

    let store = MapStore::with_defaults();
    let engine = RecommendationEngine::default();
    let candidate = engine
        .suggest(
            &sampler.history_view(),
            &store,
            MapId::IgnitionTiming,
            &KnockBiasScorer::default(),
            &CancelToken::new(),
        )
        .expect("suggestion over live history should not fail");

    // Every offered delta must clear the envelope when staged
    if !candidate.is_empty() {
        let mut store = store;
        let txn = candidate.to_transaction(&store).unwrap();
        store.commit(txn, None).expect("validated candidate must commit");
    }

    channel.shutdown();
}
