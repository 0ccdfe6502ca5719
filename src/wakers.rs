use std::task::Waker;

/// Wakers of the futures currently parked on one event.
///
/// Each waiting future holds a key so it can replace its waker on a later poll
/// and remove itself when dropped before the event fires.
#[derive(Debug, Default)]
pub(crate) struct Wakers {
    next_key: u64,
    entries: Vec<(u64, Waker)>,
}

impl Wakers {
    pub(crate) fn register(&mut self, key: &mut Option<u64>, waker: &Waker) {
        if let Some(k) = *key {
            if let Some((_, parked)) = self.entries.iter_mut().find(|(e, _)| *e == k) {
                if !parked.will_wake(waker) {
                    *parked = waker.clone();
                }
                return;
            }
        }
        let k = key.unwrap_or_else(|| {
            self.next_key += 1;
            self.next_key
        });
        *key = Some(k);
        self.entries.push((k, waker.clone()));
    }

    pub(crate) fn remove(&mut self, key: u64) {
        self.entries.retain(|(k, _)| *k != key);
    }

    /// Takes every parked waker. Call `wake` on them after releasing the lock.
    pub(crate) fn drain(&mut self) -> Vec<Waker> {
        self.entries.drain(..).map(|(_, waker)| waker).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
