use log::warn;
use serde::Deserialize;

use crate::{
    error::NvramError,
    nvram::{ByteStore, NvBytes},
};

pub const LEGACY_COUNTER_SLOT: usize = 0;
pub const COUNTER_HIGH_SLOT: usize = 2;
pub const COUNTER_LOW_SLOT: usize = 3;

/// Where the counter lives in the byte image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterLayout {
    /// Big-endian 16-bit value across slots 2 (high) and 3 (low).
    #[default]
    Wide,
    /// Low-order byte only, in slot 0. Values above 255 are truncated on write.
    Legacy,
}

pub fn encode(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

pub fn decode(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// Durable event counter. `increment_and_persist` is the one writer used at
/// runtime; it holds the byte store for the whole read-modify-write.
pub struct CounterStore<B> {
    bytes: NvBytes<B>,
    layout: CounterLayout,
}

impl<B> Clone for CounterStore<B> {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            layout: self.layout,
        }
    }
}

impl<B: ByteStore> CounterStore<B> {
    pub fn new(bytes: NvBytes<B>, layout: CounterLayout) -> Self {
        Self { bytes, layout }
    }

    pub fn layout(&self) -> CounterLayout {
        self.layout
    }

    pub fn read(&self) -> u16 {
        let store = self.bytes.lock();
        read_locked(&*store, self.layout)
    }

    pub fn write(&self, value: u16) -> Result<(), NvramError> {
        let mut store = self.bytes.lock();
        write_locked(&mut *store, self.layout, value)
    }

    pub fn increment_and_persist(&self) -> Result<u16, NvramError> {
        let mut store = self.bytes.lock();
        let next = match self.layout {
            CounterLayout::Wide => read_locked(&*store, self.layout).wrapping_add(1),
            CounterLayout::Legacy => {
                u16::from(store.read_byte(LEGACY_COUNTER_SLOT).wrapping_add(1))
            }
        };

        if let Err(err) = write_locked(&mut *store, self.layout, next) {
            warn!("counter persist failed at value {next}: {err}");
            return Err(err);
        }
        Ok(next)
    }
}

fn read_locked<B: ByteStore>(store: &B, layout: CounterLayout) -> u16 {
    match layout {
        CounterLayout::Wide => decode([
            store.read_byte(COUNTER_HIGH_SLOT),
            store.read_byte(COUNTER_LOW_SLOT),
        ]),
        CounterLayout::Legacy => u16::from(store.read_byte(LEGACY_COUNTER_SLOT)),
    }
}

/// Stages the counter bytes and commits them. On any failure the previous
/// bytes are put back, so reads keep reporting the last persisted value.
fn write_locked<B: ByteStore>(
    store: &mut B,
    layout: CounterLayout,
    value: u16,
) -> Result<(), NvramError> {
    let [high, low] = encode(value);
    let staged = match layout {
        CounterLayout::Wide => vec![(COUNTER_HIGH_SLOT, high), (COUNTER_LOW_SLOT, low)],
        CounterLayout::Legacy => vec![(LEGACY_COUNTER_SLOT, low)],
    };
    let previous: Vec<(usize, u8)> = staged
        .iter()
        .map(|&(slot, _)| (slot, store.read_byte(slot)))
        .collect();

    let result = stage_and_commit(store, &staged);
    if result.is_err() {
        for &(slot, byte) in &previous {
            if let Err(err) = store.write_byte(slot, byte) {
                warn!("failed to roll back counter slot {slot}: {err}");
            }
        }
    }
    result
}

fn stage_and_commit<B: ByteStore>(store: &mut B, staged: &[(usize, u8)]) -> Result<(), NvramError> {
    for &(slot, byte) in staged {
        store.write_byte(slot, byte)?;
    }
    store.commit()
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::fakes::MemoryByteStore;

    fn counter(layout: CounterLayout) -> (CounterStore<MemoryByteStore>, NvBytes<MemoryByteStore>) {
        let bytes = NvBytes::new(MemoryByteStore::default());
        (CounterStore::new(bytes.clone(), layout), bytes)
    }

    #[test]
    fn encode_decode_covers_every_value() {
        for value in 0..=u16::MAX {
            assert_eq!(decode(encode(value)), value);
        }
    }

    #[test]
    fn encoding_is_big_endian() {
        assert_eq!(encode(0x1234), [0x12, 0x34]);
        assert_eq!(decode([0x01, 0x00]), 256);
    }

    #[test]
    fn read_before_any_write_is_zero() {
        let (counter, _) = counter(CounterLayout::Wide);
        assert_eq!(counter.read(), 0);
    }

    #[test]
    fn write_places_high_byte_before_low_byte() {
        let (counter, bytes) = counter(CounterLayout::Wide);
        counter.write(0xBEEF).unwrap();

        assert_eq!(bytes.read_byte(COUNTER_HIGH_SLOT), 0xBE);
        assert_eq!(bytes.read_byte(COUNTER_LOW_SLOT), 0xEF);
        assert_eq!(bytes.lock().commits, 1);
        assert_eq!(counter.read(), 0xBEEF);
    }

    #[test]
    fn increment_carries_into_high_byte_and_wraps() {
        let (counter, _) = counter(CounterLayout::Wide);
        counter.write(255).unwrap();
        assert_eq!(counter.increment_and_persist().unwrap(), 256);

        counter.write(u16::MAX).unwrap();
        assert_eq!(counter.increment_and_persist().unwrap(), 0);
    }

    #[test]
    fn legacy_layout_keeps_only_the_low_byte() {
        let (counter, bytes) = counter(CounterLayout::Legacy);
        counter.write(0x0102).unwrap();

        assert_eq!(bytes.read_byte(LEGACY_COUNTER_SLOT), 0x02);
        assert_eq!(bytes.read_byte(COUNTER_HIGH_SLOT), 0);
        assert_eq!(counter.read(), 2);

        counter.write(255).unwrap();
        assert_eq!(counter.increment_and_persist().unwrap(), 0);
    }

    #[test]
    fn failed_commit_is_reported() {
        let (counter, bytes) = counter(CounterLayout::Wide);
        bytes.lock().fail_commits = true;

        assert!(counter.increment_and_persist().is_err());
    }

    #[test]
    fn failed_persist_keeps_the_last_stored_value() {
        let (counter, bytes) = counter(CounterLayout::Wide);
        counter.write(0x00FF).unwrap();
        bytes.lock().fail_commits = true;

        assert!(counter.increment_and_persist().is_err());
        assert!(counter.increment_and_persist().is_err());
        assert!(counter.write(7).is_err());
        assert_eq!(counter.read(), 0x00FF);
        assert_eq!(bytes.read_byte(COUNTER_HIGH_SLOT), 0x00);
        assert_eq!(bytes.read_byte(COUNTER_LOW_SLOT), 0xFF);

        bytes.lock().fail_commits = false;
        assert_eq!(counter.increment_and_persist().unwrap(), 0x0100);
    }

    #[test]
    fn failed_legacy_persist_keeps_the_last_stored_value() {
        let (counter, bytes) = counter(CounterLayout::Legacy);
        counter.write(9).unwrap();
        bytes.lock().fail_commits = true;

        assert!(counter.increment_and_persist().is_err());
        assert_eq!(counter.read(), 9);
    }

    #[test]
    fn concurrent_increments_never_lose_updates() {
        let (counter, _) = counter(CounterLayout::Wide);
        let counter = Arc::new(counter);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        counter.increment_and_persist().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(counter.read(), 1_000);
    }
}
