// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running one task per host and collecting every host's failure.

use crate::error_chain::InlineErrorChain;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Upper bound on hosts worked on at the same time.
pub const MAX_PARALLELISM: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Concurrency {
    #[default]
    Parallel,
    /// One host after another, on the caller's task.
    Serial,
}

#[derive(Debug)]
pub struct HostFailure<E> {
    /// Position of the host in the cluster's host list.
    pub index: usize,
    pub host: IpAddr,
    pub error: E,
}

/// One or more hosts failed. Failures are ordered by host position.
#[derive(Debug)]
pub struct FleetError<E> {
    pub total: usize,
    pub failures: Vec<HostFailure<E>>,
}

impl<E: std::error::Error + 'static> fmt::Display for FleetError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} hosts failed", self.failures.len(), self.total)?;
        for failure in &self.failures {
            write!(
                f,
                "\n  {}: {}",
                failure.host,
                InlineErrorChain::new(&failure.error)
            )?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FleetError<E> {}

/// Runs `task(index, host)` for every host and returns the outputs in host
/// order.
///
/// A failing host does not stop the others. Failures are sent over a
/// channel sized to the host count and drained once every task finished.
pub async fn for_each_host<T, E, F, Fut>(
    hosts: &[IpAddr],
    concurrency: Concurrency,
    task: F,
) -> Result<Vec<T>, FleetError<E>>
where
    F: Fn(usize, IpAddr) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let total = hosts.len();
    let (tx, mut rx) = mpsc::channel(total.max(1));
    let mut outputs = Vec::with_capacity(total);

    match concurrency {
        Concurrency::Serial => {
            for (index, &host) in hosts.iter().enumerate() {
                if let Some(output) =
                    run_one(index, host, task(index, host), &tx).await
                {
                    outputs.push(output);
                }
            }
        }
        Concurrency::Parallel => {
            let semaphore = Arc::new(Semaphore::new(MAX_PARALLELISM));
            let mut set = JoinSet::new();
            for (index, &host) in hosts.iter().enumerate() {
                let future = task(index, host);
                let tx = tx.clone();
                let semaphore = Arc::clone(&semaphore);
                set.spawn(async move {
                    // Held until the host is done.
                    let _permit = semaphore.acquire_owned().await.ok();
                    run_one(index, host, future, &tx).await
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Some(output)) => outputs.push(output),
                    Ok(None) => {}
                    Err(err) => std::panic::resume_unwind(err.into_panic()),
                }
            }
        }
    }
    drop(tx);

    let mut failures = Vec::new();
    while let Some(failure) = rx.recv().await {
        failures.push(failure);
    }
    if !failures.is_empty() {
        failures.sort_by_key(|failure: &HostFailure<E>| failure.index);
        return Err(FleetError { total, failures });
    }

    outputs.sort_by_key(|(index, _)| *index);
    Ok(outputs.into_iter().map(|(_, output)| output).collect())
}

async fn run_one<T, E, Fut>(
    index: usize,
    host: IpAddr,
    future: Fut,
    failures: &mpsc::Sender<HostFailure<E>>,
) -> Option<(usize, T)>
where
    Fut: Future<Output = Result<T, E>>,
{
    match future.await {
        Ok(output) => Some((index, output)),
        Err(error) => {
            // The channel holds one slot per host and the receiver outlives
            // every sender, so this neither blocks nor fails.
            let _ = failures.send(HostFailure { index, host, error }).await;
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("host {0} is broken")]
    struct Broken(usize);

    fn hosts(n: u8) -> Vec<IpAddr> {
        (1..=n).map(|i| IpAddr::from([10, 0, 0, i])).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn outputs_come_back_in_host_order() {
        let hosts = hosts(5);
        let outputs = for_each_host(&hosts, Concurrency::Parallel, |index, host| {
            async move {
                // Finish in reverse order.
                tokio::time::sleep(Duration::from_secs(10 - index as u64)).await;
                Ok::<_, Broken>(host)
            }
        })
        .await
        .unwrap();
        assert_eq!(outputs, hosts);
    }

    #[tokio::test]
    async fn every_failure_is_reported() {
        let hosts = hosts(4);
        let ran = Arc::new(AtomicUsize::new(0));
        for concurrency in [Concurrency::Parallel, Concurrency::Serial] {
            ran.store(0, Ordering::SeqCst);
            let err = for_each_host(&hosts, concurrency, |index, _| {
                let ran = Arc::clone(&ran);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    if index % 2 == 1 {
                        Err(Broken(index))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();

            assert_eq!(ran.load(Ordering::SeqCst), 4, "{concurrency:?}");
            assert_eq!(err.total, 4);
            let failed: Vec<_> = err.failures.iter().map(|f| f.index).collect();
            assert_eq!(failed, [1, 3]);
            let message = err.to_string();
            assert!(message.starts_with("2 of 4 hosts failed"), "{message}");
            assert!(message.contains("10.0.0.4: host 3 is broken"), "{message}");
        }
    }

    #[tokio::test]
    async fn no_hosts_is_not_an_error() {
        let outputs = for_each_host(&[], Concurrency::Parallel, |_, _| async {
            Ok::<(), Broken>(())
        })
        .await
        .unwrap();
        assert!(outputs.is_empty());
    }
}
