//! Number generation: segment lookup, reset check, advance, render.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::{SequenceConfig, SequenceField};
use crate::error::SequenceError;
use crate::handler::TokenHandlerRegistry;
use crate::segment::{FieldAccess, resolve_override, resolve_segment_value};
use crate::store::{CounterKey, CounterRecord, CounterStore};
use crate::token::tokenize;

/// A value written into a record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub field: String,
    pub value: String,
}

/// Stateless number generator.
///
/// Holds the handler registry and the clock; counters live in the store
/// passed to each call.
pub struct NumberGenerator {
    registry: TokenHandlerRegistry,
    clock: Arc<dyn Clock>,
}

impl Default for NumberGenerator {
    fn default() -> Self {
        Self::new(TokenHandlerRegistry::default())
    }
}

impl NumberGenerator {
    pub fn new(registry: TokenHandlerRegistry) -> Self {
        Self {
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &TokenHandlerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TokenHandlerRegistry {
        &mut self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Next number for `record` under `config`.
    pub fn generate<R, S>(&self, config: &SequenceConfig, record: &R, store: &S) -> Result<String, SequenceError>
    where
        R: FieldAccess + ?Sized,
        S: CounterStore + ?Sized,
    {
        config.validate()?;
        let segment = resolve_segment_value(record, config)?;
        self.generate_for_segment(config, segment.as_deref(), store)
    }

    /// Next number for an already resolved segment.
    pub fn generate_for_segment<S>(
        &self,
        config: &SequenceConfig,
        segment: Option<&str>,
        store: &S,
    ) -> Result<String, SequenceError>
    where
        S: CounterStore + ?Sized,
    {
        let now = self.clock.now();
        let mut attempt = 1;
        loop {
            let counter = fetch_counter(&self.registry, config, segment, store, now)?;
            let tokens = tokenize(&counter.pattern, counter.last_advanced_at);
            let reset = self.registry.requests_reset(&tokens, now)?;
            match store.advance(&counter, reset.then_some(config.initial_value), config.initial_value, now) {
                Ok(value) => return Ok(self.registry.render(&counter.pattern, &tokens, value, now)),
                Err(SequenceError::Conflict { .. }) if attempt < MAX_ADVANCE_ATTEMPTS => {
                    debug!(key = %config.key, segment = ?segment, attempt, "re-reading counter after conflict");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Render `pattern` for a given counter value without touching any store.
    pub fn preview(&self, pattern: &str, value: i64) -> String {
        let now = self.clock.now();
        let tokens = tokenize(pattern, now);
        self.registry.render(pattern, &tokens, value, now)
    }

    /// Fill every empty numbered field of `record`.
    ///
    /// Fields that already hold a value are left alone and no counter moves
    /// for them. A write-back failure happens after the counter advanced, so
    /// retrying the call burns another value.
    pub fn assign<R, S>(
        &self,
        record: &mut R,
        fields: &[SequenceField],
        store: &S,
    ) -> Result<Vec<Assignment>, SequenceError>
    where
        R: FieldAccess + ?Sized,
        S: CounterStore + ?Sized,
    {
        assign_with(record, fields, |config, segment| {
            self.generate_for_segment(config, segment, store)
        })
    }

    /// Start a unit of work against `store`.
    pub fn batch<'g, 's, S>(&'g self, store: &'s S) -> GenerationBatch<'g, 's, S>
    where
        S: CounterStore + ?Sized,
    {
        GenerationBatch {
            generator: self,
            store,
            pending: BTreeMap::new(),
        }
    }
}

/// Reads of a counter before a conflicting reset gives up.
const MAX_ADVANCE_ATTEMPTS: usize = 16;

/// Make sure the unsegmented counter exists, then return the requested one.
///
/// The pattern a new counter would get is checked first, so a pattern with an
/// invalid reset context never creates a record.
fn fetch_counter<S>(
    registry: &TokenHandlerRegistry,
    config: &SequenceConfig,
    segment: Option<&str>,
    store: &S,
    now: DateTime<Utc>,
) -> Result<CounterRecord, SequenceError>
where
    S: CounterStore + ?Sized,
{
    let pattern = resolve_override(config, segment)
        .map(|o| o.pattern.as_str())
        .unwrap_or(config.pattern.as_str());
    registry.validate(&tokenize(pattern, now))?;

    let unsegmented = store.get_or_create(
        &CounterKey::unsegmented(config.key.as_str()),
        &config.pattern,
        config.initial_value,
        now,
    )?;

    let Some(segment) = segment else {
        return Ok(unsegmented);
    };

    store.get_or_create(
        &CounterKey::new(config.key.as_str(), Some(segment)),
        pattern,
        config.initial_value,
        now,
    )
}

fn assign_with<R, F>(record: &mut R, fields: &[SequenceField], mut next: F) -> Result<Vec<Assignment>, SequenceError>
where
    R: FieldAccess + ?Sized,
    F: FnMut(&SequenceConfig, Option<&str>) -> Result<String, SequenceError>,
{
    let mut assigned = Vec::new();
    for field in fields {
        field.config.validate()?;
        if record.field(&field.field)?.is_some_and(|v| !v.is_empty()) {
            debug!(field = %field.field, "field already populated, skipping");
            continue;
        }
        let segment = resolve_segment_value(&*record, &field.config)?;
        let value = next(&field.config, segment.as_deref())?;
        record.set_field(&field.field, value.clone())?;
        assigned.push(Assignment {
            field: field.field.clone(),
            value,
        });
    }
    Ok(assigned)
}

/// A unit of work.
///
/// Counters are fetched once and advanced in memory, so repeated requests for
/// one (key, segment) see consecutive values before anything is persisted.
/// Nothing reaches the store's counter values until [`commit`](Self::commit);
/// dropping the batch discards its advances.
pub struct GenerationBatch<'g, 's, S: CounterStore + ?Sized> {
    generator: &'g NumberGenerator,
    store: &'s S,
    pending: BTreeMap<CounterKey, CounterRecord>,
}

impl<S: CounterStore + ?Sized> GenerationBatch<'_, '_, S> {
    pub fn generate<R>(&mut self, config: &SequenceConfig, record: &R) -> Result<String, SequenceError>
    where
        R: FieldAccess + ?Sized,
    {
        config.validate()?;
        let segment = resolve_segment_value(record, config)?;
        self.generate_for_segment(config, segment.as_deref())
    }

    pub fn generate_for_segment(&mut self, config: &SequenceConfig, segment: Option<&str>) -> Result<String, SequenceError> {
        let now = self.generator.now();
        let key = CounterKey::new(config.key.as_str(), segment);
        if !self.pending.contains_key(&key) {
            let counter = fetch_counter(&self.generator.registry, config, segment, self.store, now)?;
            self.pending.insert(key.clone(), counter);
        }
        let Some(counter) = self.pending.get_mut(&key) else {
            return Err(SequenceError::Storage(format!("counter {} vanished from batch", key.key)));
        };

        let registry = &self.generator.registry;
        let tokens = tokenize(&counter.pattern, counter.last_advanced_at);
        let reset = registry.requests_reset(&tokens, now)?;
        let value = counter.advance(reset.then_some(config.initial_value), config.initial_value, now)?;
        Ok(registry.render(&counter.pattern, &tokens, value, now))
    }

    pub fn assign<R>(&mut self, record: &mut R, fields: &[SequenceField]) -> Result<Vec<Assignment>, SequenceError>
    where
        R: FieldAccess + ?Sized,
    {
        assign_with(record, fields, |config, segment| self.generate_for_segment(config, segment))
    }

    /// Counters touched so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Persist every touched counter in one optimistic write.
    pub fn commit(self) -> Result<usize, SequenceError> {
        let records: Vec<CounterRecord> = self.pending.into_values().collect();
        self.store.save(&records)?;
        debug!(counters = records.len(), "committed batch");
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::segment::FieldMap;
    use crate::store::MemoryCounterStore;
    use chrono::{Duration, TimeZone};

    fn generator_at(y: i32, m: u32, d: u32) -> (NumberGenerator, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()));
        let generator = NumberGenerator::default().with_clock(clock.clone());
        (generator, clock)
    }

    #[test]
    fn test_plain_counter() {
        let (generator, _) = generator_at(2025, 1, 15);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("customer").with_pattern("KD-{#|6}");
        let record = FieldMap::new();
        let got: Vec<String> = (0..3)
            .map(|_| generator.generate(&config, &record, &store).unwrap())
            .collect();
        assert_eq!(got, vec!["KD-000001", "KD-000002", "KD-000003"]);
    }

    #[test]
    fn test_yearly_reset_scenario() {
        let (generator, clock) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("invoice").with_pattern("IV{Y}-{#|6|y}");
        let record = FieldMap::new();

        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "IV2025-000001");
        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "IV2025-000002");

        clock.set(Utc.with_ymd_and_hms(2026, 1, 2, 8, 0, 0).unwrap());
        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "IV2026-000001");
        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "IV2026-000002");
    }

    #[test]
    fn test_reset_returns_to_initial_value() {
        let (generator, clock) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("ticket")
            .with_pattern("T{#|4|d}")
            .with_initial_value(500);
        let record = FieldMap::new();

        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "T0501");
        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "T0502");
        clock.advance(Duration::days(1));
        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "T0501");
    }

    #[test]
    fn test_raised_initial_value_wins_over_stored() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let record = FieldMap::new();
        let config = SequenceConfig::new("order");
        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "1");

        let raised = config.with_initial_value(1000);
        assert_eq!(generator.generate(&raised, &record, &store).unwrap(), "1001");
    }

    #[test]
    fn test_invalid_reset_context_creates_no_record() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("bad").with_pattern("{#|4|x}");
        let err = generator.generate(&config, &FieldMap::new(), &store).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidResetContext(ref v) if v == "x"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_reset_context_creates_no_segment_records() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("doc")
            .with_pattern("{#|4|x}")
            .with_segment("{Kind}");
        let record = FieldMap::new().with("Kind", "OFFER");
        assert!(matches!(
            generator.generate(&config, &record, &store),
            Err(SequenceError::InvalidResetContext(_))
        ));

        let mut batch = generator.batch(&store);
        assert!(batch.generate(&config, &record).is_err());
        assert!(batch.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_valid_override_ignores_invalid_default_pattern() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("doc")
            .with_pattern("{#|4|x}")
            .with_segment("{Kind}")
            .with_override("OFFER", "AG-{#|3|y}");
        let offer = FieldMap::new().with("Kind", "OFFER");
        assert_eq!(generator.generate(&config, &offer, &store).unwrap(), "AG-001");

        let other = FieldMap::new().with("Kind", "ORDER");
        assert!(generator.generate(&config, &other, &store).is_err());
        assert!(store.get(&CounterKey::new("doc", Some("ORDER"))).unwrap().is_none());
    }

    #[test]
    fn test_reset_retried_after_old_period_advance() {
        let (generator, clock) = generator_at(2025, 12, 31);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("invoice").with_pattern("IV{Y}-{#|6|y}");
        for _ in 0..41 {
            generator.generate(&config, &FieldMap::new(), &store).unwrap();
        }

        // A stale 2025 read races an advance that still happened in 2025.
        let key = CounterKey::unsegmented("invoice");
        let stale = store.get(&key).unwrap().unwrap();
        store.advance(&stale, None, 0, clock.now()).unwrap();
        clock.set(Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
        assert!(matches!(
            store.advance(&stale, Some(0), 0, clock.now()),
            Err(SequenceError::Conflict { .. })
        ));

        assert_eq!(generator.generate(&config, &FieldMap::new(), &store).unwrap(), "IV2026-000001");
        assert_eq!(generator.generate(&config, &FieldMap::new(), &store).unwrap(), "IV2026-000002");
    }

    #[test]
    fn test_unknown_segment_field_mutates_nothing() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("doc").with_segment("{Kind}");
        let err = generator.generate(&config, &FieldMap::new(), &store).unwrap_err();
        assert!(matches!(err, SequenceError::UnknownField(ref f) if f == "Kind"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_key_rejected() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        assert!(matches!(
            generator.generate(&SequenceConfig::new(""), &FieldMap::new(), &store),
            Err(SequenceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_segmented_request_creates_unsegmented_counter() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("doc")
            .with_pattern("D-{#}")
            .with_segment("{Kind}")
            .with_override("OFFER", "AG-{#|3}");
        let record = FieldMap::new().with("Kind", "OFFER");

        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "AG-001");
        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].segment, None);
        assert_eq!(records[0].pattern, "D-{#}");
        assert_eq!(records[0].current_value, 0);
        assert_eq!(records[1].pattern, "AG-{#|3}");
    }

    #[test]
    fn test_pattern_fixed_at_creation() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let record = FieldMap::new();
        let config = SequenceConfig::new("k").with_pattern("A{#}");
        assert_eq!(generator.generate(&config, &record, &store).unwrap(), "A1");

        let changed = SequenceConfig::new("k").with_pattern("B{#}");
        assert_eq!(generator.generate(&changed, &record, &store).unwrap(), "A2");
    }

    #[test]
    fn test_preview() {
        let (generator, _) = generator_at(2025, 2, 3);
        assert_eq!(generator.preview("X{y}{m}{d}-{#|5}-{?}", 42), "X250203-00042-{?}");
    }

    #[test]
    fn test_assign_skips_populated_fields() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let fields = vec![
            SequenceField::new("number", SequenceConfig::new("invoice").with_pattern("IV-{#|3}")),
            SequenceField::new("ref", SequenceConfig::new("ref")),
        ];
        let mut record = FieldMap::new().with_empty("number").with("ref", "MANUAL-7");

        let assigned = generator.assign(&mut record, &fields, &store).unwrap();
        assert_eq!(
            assigned,
            vec![Assignment {
                field: "number".to_string(),
                value: "IV-001".to_string()
            }]
        );
        assert_eq!(record.get("number"), Some("IV-001"));
        assert_eq!(record.get("ref"), Some("MANUAL-7"));
        assert!(store.get(&CounterKey::unsegmented("ref")).unwrap().is_none());

        // Second pass: everything is populated now.
        assert!(generator.assign(&mut record, &fields, &store).unwrap().is_empty());
    }

    #[test]
    fn test_assign_empty_string_counts_as_empty() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let fields = vec![SequenceField::new("number", SequenceConfig::new("n"))];
        let mut record = FieldMap::new().with("number", "");
        generator.assign(&mut record, &fields, &store).unwrap();
        assert_eq!(record.get("number"), Some("1"));
    }

    #[test]
    fn test_batch_yields_consecutive_values_until_commit() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("invoice")
            .with_pattern("{#}")
            .with_initial_value(10);
        let record = FieldMap::new();

        let mut batch = generator.batch(&store);
        let values: Vec<String> = (0..5)
            .map(|_| batch.generate(&config, &record).unwrap())
            .collect();
        assert_eq!(values, vec!["11", "12", "13", "14", "15"]);
        assert_eq!(batch.len(), 1);

        let before = store.get(&CounterKey::unsegmented("invoice")).unwrap().unwrap();
        assert_eq!(before.current_value, 10);

        assert_eq!(batch.commit().unwrap(), 1);
        let after = store.get(&CounterKey::unsegmented("invoice")).unwrap().unwrap();
        assert_eq!(after.current_value, 15);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_dropped_batch_discards_values() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("k");
        {
            let mut batch = generator.batch(&store);
            batch.generate(&config, &FieldMap::new()).unwrap();
        }
        assert_eq!(generator.generate(&config, &FieldMap::new(), &store).unwrap(), "1");
    }

    #[test]
    fn test_batch_conflict_on_concurrent_advance() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let config = SequenceConfig::new("k");

        let mut batch = generator.batch(&store);
        assert_eq!(batch.generate(&config, &FieldMap::new()).unwrap(), "1");
        assert_eq!(generator.generate(&config, &FieldMap::new(), &store).unwrap(), "1");

        assert!(matches!(batch.commit(), Err(SequenceError::Conflict { .. })));
        let stored = store.get(&CounterKey::unsegmented("k")).unwrap().unwrap();
        assert_eq!(stored.current_value, 1);
    }

    #[test]
    fn test_batch_assign() {
        let (generator, _) = generator_at(2025, 6, 1);
        let store = MemoryCounterStore::new();
        let fields = vec![SequenceField::new(
            "number",
            SequenceConfig::new("order").with_segment("{Kind}"),
        )];
        let mut batch = generator.batch(&store);
        let mut a = FieldMap::new().with("Kind", "X").with_empty("number");
        let mut b = FieldMap::new().with("Kind", "X").with_empty("number");
        let mut c = FieldMap::new().with("Kind", "Y").with_empty("number");
        batch.assign(&mut a, &fields).unwrap();
        batch.assign(&mut b, &fields).unwrap();
        batch.assign(&mut c, &fields).unwrap();
        assert_eq!(batch.len(), 2);
        batch.commit().unwrap();

        assert_eq!(a.get("number"), Some("1"));
        assert_eq!(b.get("number"), Some("2"));
        assert_eq!(c.get("number"), Some("1"));
        assert_eq!(store.len(), 3);
    }
}
