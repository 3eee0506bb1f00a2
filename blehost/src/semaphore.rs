use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Credits {
    count: usize,
    closed: bool,
}

/// Counts controller ACL buffers. One credit is taken per outbound ACL fragment
/// and returned by Number Of Completed Packets.
#[derive(Debug)]
pub struct CreditSemaphore {
    state: Mutex<Credits>,
    available: Condvar,
}

impl CreditSemaphore {
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(Credits {
                count,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Re-seeds the count, e.g. after LE Read Buffer Size.
    pub fn init(&self, count: usize) {
        let mut state = self.state.lock();
        state.count = count;
        if count > 0 {
            self.available.notify_all();
        }
    }

    /// Blocks until a credit is free. `false` once closed.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.count > 0 {
                state.count -= 1;
                return true;
            }
            self.available.wait(&mut state);
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.count == 0 {
            return false;
        }
        state.count -= 1;
        true
    }

    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.count = state.count.saturating_add(count);
        self.available.notify_all();
    }

    /// Wakes every waiter; all later acquires fail.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn available(&self) -> usize {
        self.state.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_until_empty() {
        let sem = CreditSemaphore::new(2);
        assert!(sem.acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.available(), 0);
        sem.release(3);
        assert_eq!(sem.available(), 3);
    }

    #[test]
    fn release_wakes_blocked_acquire() {
        let sem = Arc::new(CreditSemaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };
        thread::sleep(Duration::from_millis(50));
        sem.release(1);
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn close_fails_waiters_and_future_acquires() {
        let sem = Arc::new(CreditSemaphore::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.acquire())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        sem.close();
        for w in waiters {
            assert!(!w.join().unwrap());
        }
        sem.release(5);
        assert!(!sem.acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn init_reseeds() {
        let sem = CreditSemaphore::new(12);
        sem.init(4);
        assert_eq!(sem.available(), 4);
    }
}
