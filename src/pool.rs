use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

/// Runs `job` over `items` on at most `limit` OS threads and returns the
/// results in completion order, which need not match submission order.
///
/// Workers pull from a shared queue, so a slow item never blocks the rest of
/// the batch behind it. The scope joins every worker before returning.
pub fn run_bounded<T, R, F>(items: Vec<T>, limit: usize, job: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = limit.max(1).min(items.len());
    let queue = Mutex::new(items.into_iter());
    let (sender, receiver) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..workers {
            let sender = sender.clone();
            let queue = &queue;
            let job = &job;
            scope.spawn(move || {
                loop {
                    let item = {
                        let Ok(mut pending) = queue.lock() else {
                            break;
                        };
                        pending.next()
                    };
                    let Some(item) = item else {
                        break;
                    };
                    if sender.send(job(item)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(sender);
        receiver.iter().collect()
    })
}
