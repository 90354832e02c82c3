use crate::errors::*;
use futures::future::{join_all, BoxFuture};

/// Upper bound on concurrently running operations in one batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Runs `f` over every item. `f` returns `Ok(true)` when the pass should
/// stop.
///
/// Monotonic runs go one item at a time and halt on the first stop or error.
/// Otherwise items run in slow-start batches of 1, 2, 4, ... (capped at
/// `MAX_BATCH_SIZE`), each batch finishing before the next starts; stops are
/// ignored and a batch with failures ends the run with those failures.
pub async fn run_for_all<'a, T, F>(items: &'a mut [T], f: F, monotonic: bool) -> Result<bool>
where
    F: Fn(usize, &'a mut T) -> BoxFuture<'a, Result<bool>>,
{
    if monotonic {
        for (i, item) in items.iter_mut().enumerate() {
            if f(i, item).await? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    slow_start(items, &f).await.map(|_| false)
}

/// Returns how many items ran, successfully or not.
async fn slow_start<'a, T, F>(items: &'a mut [T], f: &F) -> Result<usize>
where
    F: Fn(usize, &'a mut T) -> BoxFuture<'a, Result<bool>>,
{
    let mut rest = items;
    let mut started = 0;
    let mut batch = 1;
    while !rest.is_empty() {
        let size = batch.min(rest.len()).min(MAX_BATCH_SIZE);
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(size);
        rest = tail;
        let results = join_all(
            head.iter_mut()
                .enumerate()
                .map(|(j, item)| f(started + j, item)),
        )
        .await;
        started += size;
        aggregate(results.into_iter().filter_map(|r| r.err()).collect())?;
        batch = size * 2;
    }
    Ok(started)
}
