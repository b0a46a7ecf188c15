use crate::error::CounterError;
use crate::storage::{Datastore, Transaction};
use std::future::Future;
use tracing::warn;

/// Attempts per unit of work, the first one included.
pub const MAX_TRANSACTION_ATTEMPTS: usize = 5;

enum Attempt<T> {
    Committed(T),
    Conflicted(CounterError),
}

/// Runs `work` in a fresh transaction and commits it, retrying from scratch
/// when the commit reports a conflict.
///
/// `work` may run more than once, so it must only read and stage writes
/// through the handle it is given. A failure inside `work`, or a commit
/// failure other than a conflict, rolls the attempt back and is returned
/// without retrying. After [`MAX_TRANSACTION_ATTEMPTS`] conflicting commits
/// the last conflict is returned.
pub async fn run_in_transaction<D, F, Fut, T>(datastore: &D, work: F) -> Result<T, CounterError>
where
    D: Datastore,
    F: FnMut(D::Transaction) -> Fut,
    Fut: Future<Output = Result<T, CounterError>>,
{
    run_in_transaction_with_attempts(datastore, MAX_TRANSACTION_ATTEMPTS, work).await
}

pub async fn run_in_transaction_with_attempts<D, F, Fut, T>(
    datastore: &D,
    max_attempts: usize,
    mut work: F,
) -> Result<T, CounterError>
where
    D: Datastore,
    F: FnMut(D::Transaction) -> Fut,
    Fut: Future<Output = Result<T, CounterError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match attempt_once(datastore, &mut work).await? {
            Attempt::Committed(value) => return Ok(value),
            Attempt::Conflicted(err) if attempt >= max_attempts => {
                warn!(attempt, error = %err, "transaction retry budget exhausted");
                return Err(err);
            }
            Attempt::Conflicted(err) => {
                warn!(attempt, max_attempts, error = %err, "transaction conflict, retrying");
                attempt += 1;
            }
        }
    }
}

async fn attempt_once<D, F, Fut, T>(datastore: &D, work: &mut F) -> Result<Attempt<T>, CounterError>
where
    D: Datastore,
    F: FnMut(D::Transaction) -> Fut,
    Fut: Future<Output = Result<T, CounterError>>,
{
    let tx = datastore.transaction();
    tx.begin().await?;

    let value = match work(tx.clone()).await {
        Ok(value) => value,
        Err(err) => {
            rollback_after_failure(&tx).await;
            return Err(err);
        }
    };

    match tx.commit().await {
        Ok(()) => Ok(Attempt::Committed(value)),
        Err(err) if err.is_conflict() => Ok(Attempt::Conflicted(err)),
        Err(err) => {
            rollback_after_failure(&tx).await;
            Err(err)
        }
    }
}

async fn rollback_after_failure<X: Transaction>(tx: &X) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "rollback after failed transaction attempt also failed");
    }
}
