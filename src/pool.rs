//! A fixed set of stay-open processes sharing the load round-robin.

use crate::config::StayOpenConfig;
use crate::error::ExifToolError;
use crate::stay_open::StayOpen;
use log::debug;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Several [`StayOpen`] processes used side by side.
///
/// Each request goes to the next process in turn. Picking the process is
/// the only step done under the pool's lock; the request itself runs on the
/// chosen process only, so as many requests run at once as there are
/// processes.
///
/// A process that dies is not replaced: requests routed to it fail with
/// [`ExifToolError::Stopped`] and it is up to the caller to retry.
///
/// # Example
/// ```no_run
/// # use exiftool_stayopen::{Pool, ExifToolError};
/// # use std::sync::Arc;
/// # use std::thread;
/// # fn main() -> Result<(), ExifToolError> {
/// let pool = Arc::new(Pool::new("exiftool", &["-json"], 4)?);
/// let handles: Vec<_> = ["a.jpg", "b.jpg", "c.jpg"]
///     .into_iter()
///     .map(|file| {
///         let pool = Arc::clone(&pool);
///         thread::spawn(move || pool.extract(file))
///     })
///     .collect();
/// for handle in handles {
///     let record = handle.join().unwrap()?;
///     println!("{}", String::from_utf8_lossy(&record));
/// }
/// pool.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Pool {
    workers: Vec<StayOpen>,
    cursor: Mutex<Cursor>,
}

#[derive(Debug)]
struct Cursor {
    next: usize,
    stopped: bool,
}

/// Snapshot of how a pool's processes are doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub worker_count: usize,
    /// Processes that can still take requests.
    pub running: usize,
    /// Responses delivered by each process, in pool order.
    pub requests_served: Vec<usize>,
}

impl PoolStats {
    pub fn total_requests_served(&self) -> usize {
        self.requests_served.iter().sum()
    }
}

impl Pool {
    /// Starts `size` processes of `executable`, each sending `default_args`
    /// ahead of every request.
    ///
    /// Either every process starts or none is left running.
    pub fn new(
        executable: impl AsRef<Path>,
        default_args: &[&str],
        size: usize,
    ) -> Result<Self, ExifToolError> {
        Self::with_config(StayOpenConfig::new(executable, default_args), size)
    }

    pub fn with_config(config: StayOpenConfig, size: usize) -> Result<Self, ExifToolError> {
        if size == 0 {
            return Err(ExifToolError::EmptyPool);
        }

        let workers = start_workers(size, |_| StayOpen::with_config(config.clone()))?;
        debug!(
            "Started a pool of {size} exiftool processes from {}",
            config.executable.display()
        );

        Ok(Self {
            workers,
            cursor: Mutex::new(Cursor {
                next: 0,
                stopped: false,
            }),
        })
    }

    /// Runs the default arguments against `file_path` on the next process.
    pub fn extract(&self, file_path: impl AsRef<Path>) -> Result<Vec<u8>, ExifToolError> {
        self.extract_with_options(file_path, &[])
    }

    /// Runs `exiftool {default_args...} {extra_args...} {file_path}` on the
    /// next process. See [`StayOpen::extract_with_options`].
    pub fn extract_with_options(
        &self,
        file_path: impl AsRef<Path>,
        extra_args: &[&str],
    ) -> Result<Vec<u8>, ExifToolError> {
        let worker = self.next_worker()?;
        worker.extract_with_options(file_path, extra_args)
    }

    /// Stops every process, in pool order.
    ///
    /// Requests already handed to a process finish first; anything arriving
    /// after this returns [`ExifToolError::Stopped`]. Calling `stop` again
    /// does nothing.
    pub fn stop(&self) {
        let mut cursor = self.lock();
        if cursor.stopped {
            return;
        }
        cursor.stopped = true;
        for worker in &self.workers {
            worker.stop();
        }
        debug!("Stopped a pool of {} exiftool processes", self.workers.len());
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            worker_count: self.workers.len(),
            running: self.workers.iter().filter(|w| w.is_running()).count(),
            requests_served: self.workers.iter().map(StayOpen::requests_served).collect(),
        }
    }

    fn next_worker(&self) -> Result<&StayOpen, ExifToolError> {
        let mut cursor = self.lock();
        if cursor.stopped {
            return Err(ExifToolError::Stopped);
        }
        let index = cursor.next;
        cursor.next = (index + 1) % self.workers.len();
        Ok(&self.workers[index])
    }

    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Calls `start` for each index in `0..size`. When one fails, the workers
/// already started are stopped before the error is returned.
fn start_workers(
    size: usize,
    mut start: impl FnMut(usize) -> Result<StayOpen, ExifToolError>,
) -> Result<Vec<StayOpen>, ExifToolError> {
    let mut workers = Vec::with_capacity(size);
    for index in 0..size {
        match start(index) {
            Ok(worker) => workers.push(worker),
            Err(source) => {
                for worker in &workers {
                    worker.stop();
                }
                return Err(ExifToolError::PoolConstruction {
                    index,
                    source: Box::new(source),
                });
            }
        }
    }
    Ok(workers)
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::utils::test_helpers::fake_exiftool;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_invalid_path() {
        let result = Pool::new("nonexistent_exiftool_command", &["-json"], 3);
        assert_matches!(
            result,
            Err(ExifToolError::PoolConstruction { index: 0, source })
                if matches!(*source, ExifToolError::Launch { .. })
        );
    }

    fn is_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_failed_start_stops_earlier_workers() {
        let mut pids = Vec::new();
        let result = start_workers(4, |index| {
            let executable = if index < 2 {
                fake_exiftool()
            } else {
                Path::new("nonexistent_exiftool_command")
            };
            let worker = StayOpen::start(executable, &["-json"])?;
            pids.push(worker.pid());
            Ok(worker)
        });

        assert_matches!(
            result,
            Err(ExifToolError::PoolConstruction { index: 2, source })
                if matches!(*source, ExifToolError::Launch { .. })
        );
        assert_eq!(pids.len(), 2);
        for pid in pids {
            assert!(!is_alive(pid), "exiftool {pid} outlived the failed pool");
        }
    }

    #[test]
    fn test_new_empty_pool() {
        assert_matches!(
            Pool::new(fake_exiftool(), &["-json"], 0),
            Err(ExifToolError::EmptyPool)
        );
    }

    #[test]
    fn test_extract() -> Result<(), ExifToolError> {
        let pool = Pool::new(fake_exiftool(), &["-json"], 2)?;
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.extract("data/image.jpg")?, b"-json data/image.jpg");
        assert_eq!(
            pool.extract_with_options("data/image.jpg", &["-ShutterSpeed"])?,
            b"-json -ShutterSpeed data/image.jpg"
        );
        Ok(())
    }

    #[test]
    fn test_round_robin_distribution() -> Result<(), ExifToolError> {
        let pool = Pool::new(fake_exiftool(), &[], 3)?;
        for i in 0..10 {
            pool.extract(format!("data/{i}.jpg"))?;
        }

        let stats = pool.stats();
        assert_eq!(stats.requests_served, vec![4, 3, 3]);
        assert_eq!(stats.total_requests_served(), 10);
        assert!(stats.requests_served.iter().all(|&n| n <= 10_usize.div_ceil(3)));
        Ok(())
    }

    #[test]
    fn test_stop_then_extract_fails() -> Result<(), ExifToolError> {
        let pool = Pool::new(fake_exiftool(), &["-json"], 2)?;
        pool.extract("data/image.jpg")?;
        pool.stop();
        assert!(pool.is_stopped());
        assert_eq!(pool.stats().running, 0);
        assert_matches!(pool.extract("data/image.jpg"), Err(ExifToolError::Stopped));

        pool.stop();
        assert_matches!(
            pool.extract_with_options("data/image.jpg", &["-n"]),
            Err(ExifToolError::Stopped)
        );
        Ok(())
    }

    #[test]
    fn test_dead_worker_is_not_retried() -> Result<(), ExifToolError> {
        let pool = Pool::new(fake_exiftool(), &["-json"], 2)?;
        assert_matches!(pool.extract("data/crash.jpg"), Err(ExifToolError::ProcessTerminated));
        assert_eq!(pool.extract("data/image.jpg")?, b"-json data/image.jpg");
        assert_matches!(pool.extract("data/image.jpg"), Err(ExifToolError::Stopped));

        let stats = pool.stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.requests_served, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn test_concurrent_extract() -> Result<(), ExifToolError> {
        let pool = Arc::new(Pool::new(fake_exiftool(), &["-json"], 4)?);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || -> Result<(), ExifToolError> {
                    for i in 0..20 {
                        let file = format!("data/img-{t}-{i}.jpg");
                        assert_eq!(pool.extract(&file)?, format!("-json {file}").into_bytes());
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("caller thread panicked")?;
        }

        assert_eq!(pool.stats().requests_served, vec![40, 40, 40, 40]);
        Ok(())
    }

    #[test]
    fn test_stop_during_extract() -> Result<(), ExifToolError> {
        let pool = Arc::new(Pool::new(fake_exiftool(), &["-json"], 2)?);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0.. {
                        let file = format!("data/img-{t}-{i}.jpg");
                        match pool.extract(&file) {
                            Ok(frame) => assert_eq!(frame, format!("-json {file}").into_bytes()),
                            Err(ExifToolError::Stopped) => return i,
                            Err(e) => panic!("Unexpected error: {e}"),
                        }
                    }
                    unreachable!()
                })
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(50));
        pool.stop();
        for handle in handles {
            handle.join().expect("caller thread panicked");
        }
        assert_matches!(pool.extract("data/image.jpg"), Err(ExifToolError::Stopped));
        Ok(())
    }
}
