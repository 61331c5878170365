use ratekeeper::{
    BucketManager, ConsistencyMode, InMemoryDurableStore, InMemoryKeyValue, LimitSpec,
    LimiterConfig, ManualClock, MemorySink, StartingAllowance,
};

/// Fixed starting instant for deterministic clocks.
pub const T0: i64 = 1_700_000_000;

pub type TestManager = BucketManager<InMemoryKeyValue, InMemoryDurableStore, MemorySink>;

/// Everything a scenario needs, with handles onto each collaborator.
pub struct Harness {
    pub manager: TestManager,
    pub kv: InMemoryKeyValue,
    pub durable: InMemoryDurableStore,
    pub clock: ManualClock,
    pub sink: MemorySink,
}

/// `search` (100 / 60s / +10) and `export` (same limits, persistent).
pub fn scenario_config(mode: ConsistencyMode, allowance: StartingAllowance) -> LimiterConfig {
    LimiterConfig::builder()
        .limit("search", LimitSpec::new(100, 60, 10, false).expect("valid limits"))
        .limit("export", LimitSpec::new(100, 60, 10, true).expect("valid limits"))
        .consistency(mode)
        .starting_allowance(allowance)
        .build()
        .expect("valid config")
}

pub fn harness_with(config: LimiterConfig) -> Harness {
    let kv = InMemoryKeyValue::new();
    harness_on(kv, config)
}

/// Harness over an existing store, as a second service instance would see it.
pub fn harness_on(kv: InMemoryKeyValue, config: LimiterConfig) -> Harness {
    let durable = InMemoryDurableStore::new();
    let clock = ManualClock::new(T0);
    let sink = MemorySink::new();
    let manager = BucketManager::new(kv.clone(), config)
        .with_durable(durable.clone())
        .with_sink(sink.clone())
        .with_clock(clock.clone());
    Harness { manager, kv, durable, clock, sink }
}

pub fn harness(mode: ConsistencyMode) -> Harness {
    harness_with(scenario_config(mode, StartingAllowance::Capacity))
}

pub const BOTH_MODES: [ConsistencyMode; 2] = [ConsistencyMode::Atomic, ConsistencyMode::MultiStep];
