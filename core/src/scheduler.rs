use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Relative scheduling priority for a suspended scan/build. Not enforced by
/// this shim (there's no runtime here to schedule against) but threaded
/// through so a caller's executor can read it back out of the span.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    /// Background work, fine to fall behind.
    Low,
    /// Default.
    Normal,
    /// User is waiting on this.
    High,
}

/// Items processed between yield points when `yield_often` is false.
const CHUNK: usize = 64;

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Cooperative yielding for large scans (spec §5).
///
/// Deliberately executor-agnostic: it doesn't spawn anything and doesn't
/// assume tokio/async-std, since the engine itself doesn't choose a
/// runtime any more than it chooses a transport. A `YieldNow` future that
/// returns `Pending` exactly once gives any executor a chance to poll
/// other tasks between items; it's the same trick `Backend::poll` in the
/// teacher uses manual `Poll` plumbing for, just inverted.
pub struct Scheduler;

impl Scheduler {
    /// Runs `body` over every item in `iter`, yielding to the executor
    /// between items. Suspension only ever happens between items (never
    /// mid-item): `body` is awaited to completion before the next yield
    /// check. Stops and returns the error as soon as `body` fails.
    pub async fn for_each<I, F, Fut>(
        iter: I,
        mut body: F,
        priority: Priority,
        label: &str,
        yield_often: bool,
    ) -> anyhow::Result<()>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let span = tracing::debug_span!("scheduler_for_each", label = %label, priority = ?priority);
        let _enter = span.enter();
        for (i, item) in iter.into_iter().enumerate() {
            body(item).await?;
            if yield_often || i % CHUNK == CHUNK - 1 {
                yield_now().await;
            }
        }
        Ok(())
    }

    /// Like [`Self::for_each`] but collects `body`'s output for every item,
    /// in input order.
    pub async fn map<I, F, Fut, T>(
        iter: I,
        mut body: F,
        priority: Priority,
        label: &str,
        yield_often: bool,
    ) -> anyhow::Result<Vec<T>>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let span = tracing::debug_span!("scheduler_map", label = %label, priority = ?priority);
        let _enter = span.enter();
        let mut out = Vec::new();
        for (i, item) in iter.into_iter().enumerate() {
            out.push(body(item).await?);
            if yield_often || i % CHUNK == CHUNK - 1 {
                yield_now().await;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn for_each_visits_every_item_in_order() {
        let seen = std::cell::RefCell::new(Vec::new());
        block_on(Scheduler::for_each(
            0..200,
            |i: i32| {
                seen.borrow_mut().push(i);
                futures::future::ready(Ok(()))
            },
            Priority::Normal,
            "test",
            false,
        ))
        .unwrap();
        assert_eq!(seen.into_inner(), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn map_stops_on_first_error() {
        let result = block_on(Scheduler::map(
            0..10,
            |i: i32| async move {
                if i == 5 {
                    anyhow::bail!("boom")
                } else {
                    Ok(i)
                }
            },
            Priority::Normal,
            "test",
            true,
        ));
        assert!(result.is_err());
    }
}
