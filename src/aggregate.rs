//! The per-key fold applied by a [`Processor`](crate::Processor).

/// Per-key state derived by folding input events.
///
/// The implementing type itself is the state. An absent key starts from
/// [`Default::default`].
///
/// # Contract
///
/// [`apply`](Aggregate::apply) must be a pure, deterministic, total
/// function: no I/O, no clocks, no randomness. Recovery relies on replaying
/// it from durable prior state producing identical results.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// The input event type.
    type Event: Send + Sync + 'static;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;
}

/// Fold `events` into `state` in order.
pub fn fold<'a, A, I>(state: A, events: I) -> A
where
    A: Aggregate,
    I: IntoIterator<Item = &'a A::Event>,
{
    events.into_iter().fold(state, A::apply)
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Aggregate;
    use serde::{Deserialize, Serialize};

    /// A simple counter aggregate used as a test fixture.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub value: u64,
    }

    /// Events applied to the `Counter` aggregate.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Incremented,
        Added { amount: u64 },
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn apply(mut self, event: &Self::Event) -> Self {
            match event {
                CounterEvent::Incremented => self.value += 1,
                CounterEvent::Added { amount } => self.value += amount,
            }
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::{Counter, CounterEvent};
    use super::*;

    #[test]
    fn apply_increment() {
        let counter = Counter::default().apply(&CounterEvent::Incremented);
        assert_eq!(counter.value, 1);
    }

    #[test]
    fn fold_applies_in_order() {
        let events = vec![
            CounterEvent::Incremented,
            CounterEvent::Added { amount: 5 },
            CounterEvent::Incremented,
        ];
        assert_eq!(fold(Counter::default(), &events).value, 7);
    }

    #[test]
    fn fold_is_deterministic_across_replays() {
        let events = vec![CounterEvent::Added { amount: 2 }, CounterEvent::Incremented];
        let first = fold(Counter::default(), &events);
        let second = fold(Counter::default(), &events);
        assert_eq!(first, second);
    }

    #[test]
    fn fold_resumes_from_prior_state() {
        let events = vec![CounterEvent::Incremented, CounterEvent::Incremented];
        let (head, tail) = events.split_at(1);
        let resumed = fold(fold(Counter::default(), head), tail);
        assert_eq!(resumed, fold(Counter::default(), &events));
    }

    #[test]
    fn event_serialization_is_adjacently_tagged() {
        let json = serde_json::to_string(&CounterEvent::Added { amount: 3 }).expect("serialize");
        assert_eq!(json, r#"{"type":"Added","data":{"amount":3}}"#);
    }
}
