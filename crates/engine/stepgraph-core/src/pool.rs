//! Fixed pool of long-lived workers, one per device, driven in lock-step.
//!
//! [`WorkerPool::resume`] hands the same job to every worker and blocks until all of them
//! have reported back, so a device never begins step N+1 while another is still in step N.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::ids::DeviceIndex;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker thread for device {device}: {source}")]
    Spawn {
        device: DeviceIndex,
        #[source]
        source: io::Error,
    },
    #[error("worker for device {0} is no longer running")]
    Disconnected(DeviceIndex),
    #[error("worker pool has been finished")]
    Finished,
}

/// A worker panicked while running a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPanic {
    pub device: DeviceIndex,
    pub message: String,
}

enum Command<J> {
    Resume(Arc<J>),
    Finish,
}

struct Worker<J> {
    commands: Sender<Command<J>>,
    handle: Option<JoinHandle<()>>,
}

type Report<R> = (DeviceIndex, Result<R, WorkerPanic>);

pub struct WorkerPool<J, R> {
    workers: Vec<Worker<J>>,
    reports: Receiver<Report<R>>,
    finished: bool,
}

impl<J, R> WorkerPool<J, R>
where
    J: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Spawn one worker per device. `init_core` runs once on each worker thread before it
    /// waits for jobs; `execute_core` runs for every resumed job.
    pub fn start<I, E>(devices: usize, init_core: I, execute_core: E) -> Result<Self, PoolError>
    where
        I: Fn(DeviceIndex) + Send + Sync + 'static,
        E: Fn(DeviceIndex, &J) -> R + Send + Sync + 'static,
    {
        let init_core = Arc::new(init_core);
        let execute_core = Arc::new(execute_core);
        let (report_tx, reports) = mpsc::channel();
        let mut pool = WorkerPool {
            workers: Vec::with_capacity(devices),
            reports,
            finished: false,
        };

        for device in 0..devices {
            let (commands, command_rx) = mpsc::channel::<Command<J>>();
            let report_tx = report_tx.clone();
            let init_core = Arc::clone(&init_core);
            let execute_core = Arc::clone(&execute_core);
            let handle = thread::Builder::new()
                .name(format!("stepgraph-device-{device}"))
                .spawn(move || {
                    init_core(device);
                    while let Ok(Command::Resume(job)) = command_rx.recv() {
                        let run = AssertUnwindSafe(|| execute_core(device, &job));
                        let result = panic::catch_unwind(run).map_err(|payload| WorkerPanic {
                            device,
                            message: panic_message(payload.as_ref()),
                        });
                        if report_tx.send((device, result)).is_err() {
                            break;
                        }
                    }
                    log::debug!("worker for device {device} stopped");
                })
                .map_err(|source| PoolError::Spawn { device, source })?;
            pool.workers.push(Worker {
                commands,
                handle: Some(handle),
            });
        }
        log::debug!("started {devices} worker(s)");
        Ok(pool)
    }

    pub fn device_count(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` on every worker and wait for all of them. Results are ordered by device.
    pub fn resume(&self, job: J) -> Result<Vec<Result<R, WorkerPanic>>, PoolError> {
        if self.finished {
            return Err(PoolError::Finished);
        }
        let job = Arc::new(job);
        for (device, worker) in self.workers.iter().enumerate() {
            worker
                .commands
                .send(Command::Resume(Arc::clone(&job)))
                .map_err(|_| PoolError::Disconnected(device))?;
        }

        let mut results: Vec<Option<Result<R, WorkerPanic>>> =
            (0..self.workers.len()).map(|_| None).collect();
        for _ in 0..self.workers.len() {
            let Ok((device, result)) = self.reports.recv() else {
                let missing = results.iter().position(Option::is_none).unwrap_or(0);
                return Err(PoolError::Disconnected(missing));
            };
            results[device] = Some(result);
        }
        Ok(results.into_iter().flatten().collect())
    }
}

impl<J, R> WorkerPool<J, R> {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stop every worker and join its thread.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Finish);
        }
        for (device, worker) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    log::warn!("worker for device {device} exited with a panic");
                }
            }
        }
        log::debug!("worker pool finished");
    }
}

impl<J, R> Drop for WorkerPool<J, R> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn it_should_run_every_device_and_order_results() {
        let inits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&inits);
        let mut pool = WorkerPool::start(
            3,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |device, job: &u64| device as u64 * 10 + job,
        )
        .unwrap();

        let results = pool.resume(1).unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), 3);
        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![1, 11, 21]);

        pool.finish();
        assert!(matches!(pool.resume(2), Err(PoolError::Finished)));
    }

    #[test]
    fn it_should_catch_worker_panics() {
        let pool = WorkerPool::start(
            2,
            |_| {},
            |device, _job: &()| {
                if device == 1 {
                    panic!("boom on {device}");
                }
                device
            },
        )
        .unwrap();

        let results = pool.resume(()).unwrap();
        assert_eq!(results[0], Ok(0));
        assert_eq!(
            results[1],
            Err(WorkerPanic {
                device: 1,
                message: "boom on 1".into()
            })
        );
        // the panicking worker is still alive for the next job
        assert_eq!(pool.resume(()).unwrap().len(), 2);
    }
}
