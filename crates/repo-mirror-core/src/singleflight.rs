//! Dedups concurrent calls sharing the same string tag: the first caller runs the work,
//! later callers for the same tag block and share its result. The tag is removed from the
//! map before waiters are woken, so the next call (success or failure) always re-executes.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

struct Call<T> {
    done: Mutex<bool>,
    cv: Condvar,
    result: Mutex<Option<Result<T, Arc<crate::Error>>>>,
}

pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` under `tag`, or waits for an in-flight call under the same tag and shares
    /// its result.
    pub fn run(
        &self,
        tag: &str,
        f: impl FnOnce() -> Result<T, crate::Error>,
    ) -> Result<T, Arc<crate::Error>> {
        let mut calls = self.calls.lock().unwrap();
        if let Some(existing) = calls.get(tag).cloned() {
            drop(calls);
            return Self::wait(&existing);
        }

        let call = Arc::new(Call {
            done: Mutex::new(false),
            cv: Condvar::new(),
            result: Mutex::new(None),
        });
        calls.insert(tag.to_string(), call.clone());
        drop(calls);

        let outcome = f().map_err(Arc::new);

        *call.result.lock().unwrap() = Some(outcome.clone());
        *call.done.lock().unwrap() = true;

        self.calls.lock().unwrap().remove(tag);
        call.cv.notify_all();

        outcome
    }

    fn wait(call: &Arc<Call<T>>) -> Result<T, Arc<crate::Error>> {
        let mut done = call.done.lock().unwrap();
        while !*done {
            done = call.cv.wait(done).unwrap();
        }
        call.result
            .lock()
            .unwrap()
            .clone()
            .expect("single-flight call finished without recording a result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_callers_share_one_execution() {
        let sf: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sf = sf.clone();
                let executions = executions.clone();
                thread::spawn(move || {
                    sf.run("tag", || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(30));
                        Ok(42)
                    })
                    .unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_later_call_reruns_after_the_tag_clears() {
        let sf: SingleFlight<u32> = SingleFlight::new();
        assert_eq!(sf.run("tag", || Ok(1)).unwrap(), 1);
        assert_eq!(sf.run("tag", || Ok(2)).unwrap(), 2);
    }
}
