//! Batched result fetching
//!
//! Results are pulled in key-ordered batches (`WHERE patient_id > last ORDER
//! BY patient_id LIMIT n`) instead of one streaming cursor, so a dropped
//! connection only costs the current batch. Transient failures are retried
//! with exponential backoff after asking the source to reconnect; anything
//! else surfaces immediately and ends the iteration.

use std::time::Duration;

use cohortql_query::{PatientId, Value};

use crate::error::FetchError;

pub type ResultRow = (PatientId, Vec<Option<Value>>);

/// A connection that can serve key-ordered batches and survive reconnects.
pub trait BatchSource {
    /// Up to `limit` rows with `patient_id` strictly greater than `after`,
    /// in ascending `patient_id` order.
    fn fetch_batch(
        &mut self,
        after: Option<PatientId>,
        limit: usize,
    ) -> Result<Vec<ResultRow>, FetchError>;

    /// Tear down and re-establish the connection after a transient failure.
    fn reconnect(&mut self) -> Result<(), FetchError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_sleep: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_sleep: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry `attempt` (1-based): `base * factor^(attempt - 1)`.
    fn sleep_for(&self, attempt: u32) -> Duration {
        self.base_sleep
            .mul_f64(self.backoff_factor.powi(attempt as i32 - 1))
    }
}

pub fn fetch_in_batches<S: BatchSource>(
    source: S,
    batch_size: usize,
    policy: RetryPolicy,
) -> Batches<S> {
    Batches::with_sleeper(source, batch_size, policy, Box::new(std::thread::sleep))
}

pub struct Batches<S> {
    source: S,
    batch_size: usize,
    policy: RetryPolicy,
    sleeper: Box<dyn FnMut(Duration)>,
    buffer: std::vec::IntoIter<ResultRow>,
    last_key: Option<PatientId>,
    exhausted: bool,
    failed: bool,
}

impl<S: BatchSource> Batches<S> {
    /// Injectable sleeper, so tests can assert the backoff schedule without
    /// actually waiting.
    pub fn with_sleeper(
        source: S,
        batch_size: usize,
        policy: RetryPolicy,
        sleeper: Box<dyn FnMut(Duration)>,
    ) -> Self {
        Self {
            source,
            batch_size,
            policy,
            sleeper,
            buffer: Vec::new().into_iter(),
            last_key: None,
            exhausted: false,
            failed: false,
        }
    }

    fn next_batch(&mut self) -> Result<Vec<ResultRow>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.source.fetch_batch(self.last_key, self.batch_size) {
                Ok(rows) => return Ok(rows),
                Err(error) if error.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let sleep = self.policy.sleep_for(attempt);
                    log::warn!(
                        "transient fetch failure (attempt {attempt} of {}), retrying in {sleep:?}: {error}",
                        self.policy.max_retries
                    );
                    (self.sleeper)(sleep);
                    self.source.reconnect()?;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl<S: BatchSource> Iterator for Batches<S> {
    type Item = Result<ResultRow, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(row) = self.buffer.next() {
                return Some(Ok(row));
            }
            if self.exhausted {
                return None;
            }
            match self.next_batch() {
                Ok(rows) => {
                    // A short batch means the table is drained; a full one
                    // needs a follow-up query to find out.
                    if rows.len() < self.batch_size {
                        self.exhausted = true;
                    }
                    self.last_key = rows.last().map(|(id, _)| *id);
                    self.buffer = rows.into_iter();
                }
                Err(error) => {
                    self.failed = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use rstest::rstest;

    /// Serves `rows` rows, failing the first `failures` fetch calls.
    struct FakeSource {
        rows: Vec<ResultRow>,
        failures: u32,
        fatal: bool,
        fetches: u32,
        reconnects: u32,
    }

    impl FakeSource {
        fn new(count: i64) -> Self {
            Self {
                rows: (1..=count).map(|id| (id, vec![Some(Value::Int(id))])).collect(),
                failures: 0,
                fatal: false,
                fetches: 0,
                reconnects: 0,
            }
        }
    }

    impl BatchSource for FakeSource {
        fn fetch_batch(
            &mut self,
            after: Option<PatientId>,
            limit: usize,
        ) -> Result<Vec<ResultRow>, FetchError> {
            self.fetches += 1;
            if self.failures > 0 {
                self.failures -= 1;
                if self.fatal {
                    return Err(FetchError::Fatal { message: "boom".to_string() });
                }
                return Err(FetchError::Transient { message: "gone away".to_string() });
            }
            let start = after.unwrap_or(0);
            Ok(self
                .rows
                .iter()
                .filter(|(id, _)| *id > start)
                .take(limit)
                .cloned()
                .collect())
        }

        fn reconnect(&mut self) -> Result<(), FetchError> {
            self.reconnects += 1;
            Ok(())
        }
    }

    fn collect_with_recorder(
        source: FakeSource,
        batch_size: usize,
        policy: RetryPolicy,
    ) -> (Vec<Result<ResultRow, FetchError>>, Vec<Duration>, Rc<RefCell<FakeSource>>) {
        // Wrap so the test can inspect call counts afterwards.
        let source = Rc::new(RefCell::new(source));
        let sleeps = Rc::new(RefCell::new(Vec::new()));
        let sleeps_handle = Rc::clone(&sleeps);
        struct Shared(Rc<RefCell<FakeSource>>);
        impl BatchSource for Shared {
            fn fetch_batch(
                &mut self,
                after: Option<PatientId>,
                limit: usize,
            ) -> Result<Vec<ResultRow>, FetchError> {
                self.0.borrow_mut().fetch_batch(after, limit)
            }
            fn reconnect(&mut self) -> Result<(), FetchError> {
                self.0.borrow_mut().reconnect()
            }
        }
        let rows: Vec<_> = Batches::with_sleeper(
            Shared(Rc::clone(&source)),
            batch_size,
            policy,
            Box::new(move |d| sleeps_handle.borrow_mut().push(d)),
        )
        .collect();
        let recorded = sleeps.borrow().clone();
        (rows, recorded, source)
    }

    #[rstest]
    #[case(20, 5, 5)] // 4 full batches, then one query to learn there are no more
    #[case(20, 6, 4)] // a short final batch ends iteration immediately
    #[case(0, 10, 1)]
    #[case(9, 1, 10)]
    fn batch_count_depends_on_the_final_batch_shape(
        #[case] rows: i64,
        #[case] batch_size: usize,
        #[case] expected_fetches: u32,
    ) {
        let (collected, sleeps, source) =
            collect_with_recorder(FakeSource::new(rows), batch_size, RetryPolicy::default());
        assert_eq!(collected.len() as i64, rows);
        assert!(collected.iter().all(Result::is_ok));
        assert!(sleeps.is_empty());
        assert_eq!(source.borrow().fetches, expected_fetches);
    }

    #[test]
    fn rows_arrive_in_key_order_exactly_once() {
        let (collected, _, _) =
            collect_with_recorder(FakeSource::new(7), 3, RetryPolicy::default());
        let ids: Vec<PatientId> = collected.into_iter().map(|r| r.unwrap().0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn transient_failures_back_off_exponentially_and_reconnect() {
        let mut source = FakeSource::new(4);
        source.failures = 2;
        let policy = RetryPolicy {
            max_retries: 3,
            base_sleep: Duration::from_secs(10),
            backoff_factor: 2.0,
        };
        let (collected, sleeps, source) = collect_with_recorder(source, 10, policy);
        assert_eq!(collected.len(), 4);
        assert!(collected.iter().all(Result::is_ok));
        assert_eq!(sleeps, vec![Duration::from_secs(10), Duration::from_secs(20)]);
        assert_eq!(source.borrow().reconnects, 2);
    }

    #[test]
    fn retries_exhaust_into_the_final_error() {
        let mut source = FakeSource::new(4);
        source.failures = 10;
        let policy = RetryPolicy {
            max_retries: 3,
            base_sleep: Duration::from_secs(10),
            backoff_factor: 2.0,
        };
        let (collected, sleeps, source) = collect_with_recorder(source, 10, policy);
        assert_eq!(collected.len(), 1);
        assert!(matches!(collected[0], Err(FetchError::Transient { .. })));
        // 10s, 20s, 40s, then the fourth failure is final.
        assert_eq!(
            sleeps,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40)
            ]
        );
        assert_eq!(source.borrow().fetches, 4);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut source = FakeSource::new(4);
        source.failures = 1;
        source.fatal = true;
        let (collected, sleeps, source) =
            collect_with_recorder(source, 10, RetryPolicy::default());
        assert_eq!(collected.len(), 1);
        assert!(matches!(collected[0], Err(FetchError::Fatal { .. })));
        assert!(sleeps.is_empty());
        assert_eq!(source.borrow().fetches, 1);
    }
}
